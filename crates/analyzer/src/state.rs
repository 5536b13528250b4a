//! Containers of symbolic heaps per program point
//!
//! A [`SymState`] stores the heaps reached at one basic block. Insertion is
//! where the fixed point comes from: depending on the configured join
//! policy an incoming heap is deduplicated by isomorphism, absorbed by an
//! existing entailing heap, replaces an entailed one, or is widened into a
//! three-way join; only genuinely new information reports `true`.
//!
//! The container also carries the `done` bitmap driving the block-level
//! worklist: entries flip back to pending whenever their heap is replaced,
//! and every structural mutation (rotation, pack-state erasure) keeps the
//! bitmap aligned with the heap list.
//!
//! [`StateMap`] maps basic blocks to their states and feeds the scheduler
//! with pending counts.

use crate::cmp::are_equal;
use crate::config::LiveOrdering;
use crate::heap::SymHeap;
use crate::join::{JoinStatus, join_sym_heaps};
use crate::sched::PendingCountProvider;
use crate::trace::{IdMapper, TraceId};
use crate::EngineCtx;
use shale_ir::{Block, BlockId, Fnc, InsnKind};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// The set of heaps reached at one program point.
#[derive(Debug, Default)]
pub struct SymState {
    heaps: Vec<SymHeap>,
    done: Vec<bool>,
    cnt_pending: usize,
    cnt_lookups: u64,
}

impl SymState {
    pub fn new() -> Self {
        SymState::default()
    }

    pub fn size(&self) -> usize {
        self.heaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heaps.is_empty()
    }

    pub fn get(&self, idx: usize) -> &SymHeap {
        &self.heaps[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymHeap> {
        self.heaps.iter()
    }

    pub fn cnt_pending(&self) -> usize {
        self.cnt_pending
    }

    /// How many comparison scans this container has run.
    pub fn cnt_lookups(&self) -> u64 {
        self.cnt_lookups
    }

    pub fn is_done(&self, idx: usize) -> bool {
        self.done[idx]
    }

    /// Claim the first pending heap: marks it done and hands out a clone.
    pub fn take_pending(&mut self) -> Option<(usize, SymHeap)> {
        let idx = self.done.iter().position(|d| !d)?;
        self.done[idx] = true;
        self.cnt_pending -= 1;
        Some((idx, self.heaps[idx].clone()))
    }

    /// Unconditional append; drops the incoming heap's pending clone node.
    pub fn insert_new(&mut self, ctx: &mut EngineCtx, sh: &SymHeap) {
        let dup = sh.clone();
        ctx.trace.waive_clone(dup.trace());
        self.heaps.push(dup);
        self.done.push(false);
        self.cnt_pending += 1;
    }

    /// Linear isomorphism scan; rotates the hit to the front when the
    /// configured live ordering covers lookups.
    pub fn lookup(&mut self, ctx: &EngineCtx, look_for: &SymHeap) -> Option<usize> {
        let cnt = self.size();
        if cnt == 0 {
            return None;
        }
        self.cnt_lookups += 1;

        for idx in 0..cnt {
            if are_equal(look_for, &self.heaps[idx]) {
                debug!(idx, total = cnt, "heap is equal to an existing one");
                if ctx.config.state_live_ordering == LiveOrdering::OnLookup {
                    self.rotate_existing(0, idx);
                    return Some(0);
                }
                return Some(idx);
            }
        }
        None
    }

    /// The principal operation: offer a heap, report whether the state
    /// gained information. `allow_three_way` flags an insertion along a
    /// loop-closing edge; how much of the join machinery actually runs is
    /// decided by the configured policy.
    pub fn insert(&mut self, ctx: &mut EngineCtx, sh: &SymHeap, allow_three_way: bool) -> bool {
        if !ctx.config.join_policy.join_requested(allow_three_way) {
            // isomorphism only
            if self.lookup(ctx, sh).is_some() {
                return false;
            }
            self.insert_new(ctx, sh);
            return true;
        }

        let cnt = self.size();
        if cnt == 0 {
            self.insert_new(ctx, sh);
            return true;
        }

        let atw = ctx.config.join_policy.effective_three_way(allow_three_way);
        self.cnt_lookups += 1;

        let mut hit = None;
        for idx in 0..cnt {
            let Some(res) = join_sym_heaps(&mut ctx.trace, &self.heaps[idx], sh, atw) else {
                continue;
            };
            if ctx.config.forbid_heap_replace && res.status == JoinStatus::RightCovers {
                continue;
            }
            hit = Some((idx, res));
            break;
        }

        let Some((idx, res)) = hit else {
            // nothing to join here
            self.insert_new(ctx, sh);
            return true;
        };

        match res.status {
            JoinStatus::Equal => {
                debug!(idx, total = cnt, "heap is equal to an existing one");
            }

            JoinStatus::LeftCovers => {
                debug!(idx, total = cnt, "an existing heap covers the new one");
            }

            JoinStatus::RightCovers => {
                debug!(idx, total = cnt, "replacing an existing heap by the new one");
                // keep the incoming heap, under the joined trace node
                let mut dup = sh.clone();
                dup.set_trace(res.heap.trace());
                self.replace(idx, dup);
                self.pack_state(ctx, idx, allow_three_way);
                return true;
            }

            JoinStatus::ThreeWay => {
                debug!(idx, total = cnt, "three-way join with an existing heap");
                self.replace(idx, res.heap);
                self.pack_state(ctx, idx, allow_three_way);
                return true;
            }
        }

        // the state absorbed the heap without growing
        self.update_trace_of(ctx, idx, res.heap.trace(), res.status);
        if ctx.config.state_live_ordering != LiveOrdering::Disabled {
            self.rotate_existing(0, idx);
        }
        false
    }

    /// Collapse every other entry that joins with the entry at `idx_new`,
    /// keeping indices consistent while entries are erased.
    pub fn pack_state(&mut self, ctx: &mut EngineCtx, mut idx_new: usize, allow_three_way: bool) {
        let atw = ctx.config.join_policy.effective_three_way(allow_three_way);

        let mut idx_old = 0;
        while idx_old < self.size() {
            if idx_new == idx_old {
                // never collapse the entry against itself
                idx_old += 1;
                continue;
            }

            let Some(res) =
                join_sym_heaps(&mut ctx.trace, &self.heaps[idx_old], &self.heaps[idx_new], atw)
            else {
                idx_old += 1;
                continue;
            };
            if ctx.config.forbid_heap_replace && res.status == JoinStatus::RightCovers {
                idx_old += 1;
                continue;
            }

            debug!(
                idx_old,
                idx_new,
                status = ?res.status,
                size = self.size(),
                "pack-state collapse"
            );

            let res_trace = res.heap.trace();
            let res_status = res.status;
            match res.status {
                JoinStatus::Equal | JoinStatus::RightCovers => {}
                JoinStatus::LeftCovers => {
                    // the older entry wins; move it into the surviving slot
                    self.heaps.swap(idx_new, idx_old);
                }
                JoinStatus::ThreeWay => {
                    self.replace(idx_new, res.heap);
                }
            }

            if res_status != JoinStatus::ThreeWay {
                self.update_trace_of(ctx, idx_new, res_trace, res_status);
            }

            self.erase(idx_old);
            if idx_old < idx_new {
                idx_new -= 1;
            }
        }

        if ctx.config.state_live_ordering != LiveOrdering::Disabled {
            self.rotate_existing(0, idx_new);
        }
    }

    /// Move entry `j` to position `i` by rotating the tail `[i..]`.
    pub fn rotate_existing(&mut self, i: usize, j: usize) {
        debug_assert!(i <= j && j < self.size());
        if i == j {
            return;
        }
        self.heaps[i..].rotate_left(j - i);
        self.done[i..].rotate_left(j - i);
    }

    /// Splice a freshly composed trace node in place of the heap's current
    /// one, recomposing the node's id-mappers so that the surviving side
    /// reads as identity.
    pub fn update_trace_of(
        &mut self,
        ctx: &mut EngineCtx,
        idx: usize,
        tr_new: TraceId,
        status: JoinStatus,
    ) {
        let tr_old = self.heaps[idx].trace();
        if tr_old == tr_new {
            return;
        }

        let (i0, i1) = match status {
            JoinStatus::Equal | JoinStatus::LeftCovers => (0, 1),
            JoinStatus::RightCovers => (1, 0),
            JoinStatus::ThreeWay => {
                debug_assert!(false, "update_trace_of: a three-way keeps its own node");
                return;
            }
        };

        let maps = ctx.trace.id_maps_mut(tr_new);
        if maps.len() == 2 {
            maps[i0].flip();
            let m0 = maps[i0].clone();
            maps[i1].compose(&m0);
            maps[i0] = IdMapper::identity();
        }

        if ctx.config.allow_cyclic_trace_graph {
            ctx.trace.replace_node(tr_old, tr_new);
        }
        self.heaps[idx].set_trace(tr_new);
    }

    fn replace(&mut self, idx: usize, sh: SymHeap) {
        self.heaps[idx] = sh;
        if self.done[idx] {
            self.done[idx] = false;
            self.cnt_pending += 1;
        }
    }

    fn erase(&mut self, idx: usize) {
        if !self.done[idx] {
            self.cnt_pending -= 1;
        }
        self.heaps.remove(idx);
        self.done.remove(idx);
    }
}

#[derive(Debug, Default)]
struct BlockState {
    state: SymState,
    any_hit: bool,
}

/// Per-block states of one analyzed function.
#[derive(Debug, Default)]
pub struct StateMap {
    cont: BTreeMap<BlockId, BlockState>,
    incomplete: bool,
}

impl StateMap {
    pub fn new() -> Self {
        StateMap::default()
    }

    pub fn state_mut(&mut self, bb: BlockId) -> &mut SymState {
        &mut self.cont.entry(bb).or_default().state
    }

    pub fn state(&self, bb: BlockId) -> Option<&SymState> {
        self.cont.get(&bb).map(|bs| &bs.state)
    }

    /// Offer a heap at the entry of `dst`; true when the target state
    /// changed. Blocks with a single predecessor and trivial control flow
    /// skip even the isomorphism scan at the highest join-policy level.
    pub fn insert(
        &mut self,
        ctx: &mut EngineCtx,
        fnc: &Fnc,
        dst: BlockId,
        sh: &SymHeap,
        allow_three_way: bool,
    ) -> bool {
        if let Some(limit) = ctx.config.limit_depth {
            if sh.generation() > limit {
                warn!(
                    generation = sh.generation(),
                    limit, "depth limit reached, analysis incomplete"
                );
                self.incomplete = true;
                return false;
            }
        }

        let bypass =
            ctx.config.join_policy.bypass_isomorphism() && is_straight_line(fnc.block(dst));
        let entry = self.cont.entry(dst).or_default();
        let size = entry.state.size();

        let changed = if bypass {
            debug!(block = ?dst, "state map bypasses even the isomorphism check");
            entry.state.insert_new(ctx, sh);
            true
        } else {
            entry.state.insert(ctx, sh, allow_three_way)
        };

        if entry.state.size() <= size {
            // the size did not grow, so at least one join absorbed input
            entry.any_hit = true;
        }

        changed
    }

    pub fn any_reuse_happened(&self, bb: BlockId) -> bool {
        self.cont.get(&bb).map(|bs| bs.any_hit).unwrap_or(false)
    }

    /// Comparison scans run across all blocks.
    pub fn total_lookups(&self) -> u64 {
        self.cont.values().map(|bs| bs.state.cnt_lookups()).sum()
    }

    pub fn incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn mark_incomplete(&mut self) {
        self.incomplete = true;
    }
}

impl PendingCountProvider for StateMap {
    fn cnt_pending(&self, bb: BlockId) -> usize {
        self.cont.get(&bb).map(|bs| bs.state.cnt_pending()).unwrap_or(0)
    }
}

/// Single predecessor and trivial control flow: either the block is just a
/// terminal instruction, or a two-instruction conditional tail.
fn is_straight_line(bb: &Block) -> bool {
    if bb.inbound.len() != 1 {
        return false;
    }
    let front_terminal = bb.front().map(|i| i.kind.is_terminal()).unwrap_or(false);
    let cond_tail = bb.insns.len() == 2
        && matches!(bb.back().map(|i| &i.kind), Some(InsnKind::Cond { .. }));
    front_terminal || cond_tail
}
