//! Block scheduler driving the fixed-point loop
//!
//! The scheduler only owns block identities; the heaps live in the state
//! map. Which waiting block `get_next` hands out is a pure policy choice:
//! FIFO and LIFO orderings, a LIFO that re-prioritizes re-scheduled blocks,
//! and a load-driven mode asking the state map for pending counts and
//! picking the least loaded block (ties broken by insertion order, so runs
//! stay deterministic).

use crate::config::SchedulerKind;
use shale_ir::{BlockId, Fnc};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// Pending-heap counts per block; implemented by the state map.
pub trait PendingCountProvider {
    fn cnt_pending(&self, bb: BlockId) -> usize;
}

/// Worklist over the basic blocks of one function.
#[derive(Debug)]
pub struct BlockScheduler {
    kind: SchedulerKind,
    todo: BTreeSet<BlockId>,
    fifo: VecDeque<BlockId>,
    stack: Vec<BlockId>,
    /// Insertion order of waiting blocks; the load-driven tie-breaker.
    order: Vec<BlockId>,
    done: BTreeMap<BlockId, u32>,
}

impl BlockScheduler {
    pub fn new(kind: SchedulerKind) -> Self {
        BlockScheduler {
            kind,
            todo: BTreeSet::new(),
            fifo: VecDeque::new(),
            stack: Vec::new(),
            order: Vec::new(),
            done: BTreeMap::new(),
        }
    }

    pub fn cnt_waiting(&self) -> usize {
        self.todo.len()
    }

    pub fn todo(&self) -> &BTreeSet<BlockId> {
        &self.todo
    }

    pub fn done(&self) -> Vec<BlockId> {
        self.done.keys().copied().collect()
    }

    pub fn cnt_visits(&self, bb: BlockId) -> u32 {
        self.done.get(&bb).copied().unwrap_or(0)
    }

    /// Add a block unless already waiting; reports a fresh insertion. A
    /// re-scheduled block climbs to the top under the prioritized policy.
    pub fn schedule(&mut self, bb: BlockId) -> bool {
        if self.todo.insert(bb) {
            match self.kind {
                SchedulerKind::Fifo => self.fifo.push_back(bb),
                SchedulerKind::Lifo | SchedulerKind::PrioritizedLifo => self.stack.push(bb),
                SchedulerKind::LoadDriven => self.order.push(bb),
            }
            return true;
        }

        // already in the queue
        if self.kind == SchedulerKind::PrioritizedLifo {
            let cnt = self.stack.len();
            let Some(idx) = self.stack.iter().position(|&b| b == bb) else {
                debug_assert!(false, "scheduler lost track of a waiting block");
                return false;
            };
            if idx + 1 != cnt {
                debug!(block = ?bb, depth = cnt - idx, "prioritizing block");
                self.stack[idx..].rotate_left(1);
            }
        }

        false
    }

    /// Select and remove a block per policy; counts the visit.
    pub fn get_next(&mut self, pcp: &impl PendingCountProvider) -> Option<BlockId> {
        if self.todo.is_empty() {
            return None;
        }

        let bb = match self.kind {
            SchedulerKind::Fifo => self.fifo.pop_front()?,
            SchedulerKind::Lifo | SchedulerKind::PrioritizedLifo => self.stack.pop()?,
            SchedulerKind::LoadDriven => {
                self.order.retain(|b| self.todo.contains(b));
                let mut best: Option<(usize, BlockId)> = None;
                for &cand in &self.order {
                    let pending = pcp.cnt_pending(cand);
                    match best {
                        // strict comparison keeps the earliest insertion
                        // on a tie
                        Some((min, _)) if pending >= min => {}
                        _ => best = Some((pending, cand)),
                    }
                }
                let (pending, bb) = best?;
                debug!(block = ?bb, pending, "load-driven scheduler picks a block");
                self.order.retain(|&b| b != bb);
                bb
            }
        };

        self.todo.remove(&bb);
        *self.done.entry(bb).or_insert(0) += 1;
        Some(bb)
    }

    /// Log how often each block was examined, least-visited first.
    pub fn print_stats(&self, fnc: &Fnc) {
        let mut by_cnt: BTreeMap<u32, Vec<BlockId>> = BTreeMap::new();
        for (&bb, &cnt) in &self.done {
            by_cnt.entry(cnt).or_default().push(bb);
        }

        for (cnt, blocks) in by_cnt {
            for bb in blocks {
                let name = &fnc.block(bb).name;
                let suffix = if self.todo.contains(&bb) {
                    " [still in the queue]"
                } else {
                    ""
                };
                debug!("block {} examined {} times{}", name, cnt, suffix);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPending(BTreeMap<BlockId, usize>);

    impl PendingCountProvider for FixedPending {
        fn cnt_pending(&self, bb: BlockId) -> usize {
            self.0.get(&bb).copied().unwrap_or(0)
        }
    }

    fn no_pending() -> FixedPending {
        FixedPending(BTreeMap::new())
    }

    #[test]
    fn fifo_returns_in_arrival_order() {
        let mut sched = BlockScheduler::new(SchedulerKind::Fifo);
        assert!(sched.schedule(BlockId(0)));
        assert!(sched.schedule(BlockId(1)));
        assert!(sched.schedule(BlockId(2)));
        assert!(!sched.schedule(BlockId(1)));

        let p = no_pending();
        assert_eq!(sched.get_next(&p), Some(BlockId(0)));
        assert_eq!(sched.get_next(&p), Some(BlockId(1)));
        assert_eq!(sched.get_next(&p), Some(BlockId(2)));
        assert_eq!(sched.get_next(&p), None);
    }

    #[test]
    fn lifo_returns_most_recent_first() {
        let mut sched = BlockScheduler::new(SchedulerKind::Lifo);
        sched.schedule(BlockId(0));
        sched.schedule(BlockId(1));
        sched.schedule(BlockId(2));

        let p = no_pending();
        assert_eq!(sched.get_next(&p), Some(BlockId(2)));
        assert_eq!(sched.get_next(&p), Some(BlockId(1)));
        assert_eq!(sched.get_next(&p), Some(BlockId(0)));
    }

    #[test]
    fn prioritized_lifo_bumps_rescheduled_blocks() {
        let mut sched = BlockScheduler::new(SchedulerKind::PrioritizedLifo);
        sched.schedule(BlockId(0));
        sched.schedule(BlockId(1));
        sched.schedule(BlockId(2));

        // re-scheduling block 0 moves it to the top of the stack
        assert!(!sched.schedule(BlockId(0)));

        let p = no_pending();
        assert_eq!(sched.get_next(&p), Some(BlockId(0)));
        assert_eq!(sched.get_next(&p), Some(BlockId(2)));
        assert_eq!(sched.get_next(&p), Some(BlockId(1)));
    }

    #[test]
    fn load_driven_picks_least_pending_with_stable_ties() {
        let mut sched = BlockScheduler::new(SchedulerKind::LoadDriven);
        sched.schedule(BlockId(0));
        sched.schedule(BlockId(1));
        sched.schedule(BlockId(2));

        let mut counts = BTreeMap::new();
        counts.insert(BlockId(0), 5);
        counts.insert(BlockId(1), 2);
        counts.insert(BlockId(2), 2);
        let p = FixedPending(counts);

        // 1 and 2 tie on load; 1 was inserted earlier
        assert_eq!(sched.get_next(&p), Some(BlockId(1)));
        assert_eq!(sched.get_next(&p), Some(BlockId(2)));
        assert_eq!(sched.get_next(&p), Some(BlockId(0)));
    }

    #[test]
    fn every_scheduled_block_is_eventually_returned() {
        for kind in [
            SchedulerKind::Fifo,
            SchedulerKind::Lifo,
            SchedulerKind::PrioritizedLifo,
            SchedulerKind::LoadDriven,
        ] {
            let mut sched = BlockScheduler::new(kind);
            for i in 0..10 {
                sched.schedule(BlockId(i));
            }
            let p = no_pending();
            let mut seen = BTreeSet::new();
            while let Some(bb) = sched.get_next(&p) {
                seen.insert(bb);
            }
            assert_eq!(seen.len(), 10);
            assert_eq!(sched.cnt_waiting(), 0);
        }
    }

    #[test]
    fn visit_counts_accumulate() {
        let mut sched = BlockScheduler::new(SchedulerKind::Fifo);
        let p = no_pending();
        sched.schedule(BlockId(0));
        sched.get_next(&p);
        sched.schedule(BlockId(0));
        sched.get_next(&p);
        assert_eq!(sched.cnt_visits(BlockId(0)), 2);
        assert_eq!(sched.done(), vec![BlockId(0)]);
    }
}
