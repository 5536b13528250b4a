//! Loop-edge classification over a function's control-flow graph
//!
//! The fixed-point driver widens only along edges that close a loop. An edge
//! `u -> v` closes a loop when `v` is still on the DFS stack while `u` is
//! being expanded, so the classification is one iterative depth-first walk
//! from the entry block.

use crate::storage::{BlockId, Fnc};
use std::collections::HashSet;

/// Loop-closing edges of one function.
#[derive(Debug, Clone, Default)]
pub struct LoopEdges {
    closing: HashSet<(BlockId, BlockId)>,
}

impl LoopEdges {
    /// Classify all edges of `fnc`.
    pub fn compute(fnc: &Fnc) -> Self {
        let Some(entry) = fnc.entry else {
            return LoopEdges::default();
        };

        let n = fnc.blocks.len();
        let mut closing = HashSet::new();
        let mut visited = vec![false; n];
        let mut on_stack = vec![false; n];

        // frame: (block, next-successor-index)
        let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
        visited[entry.0 as usize] = true;
        on_stack[entry.0 as usize] = true;

        while let Some(top) = stack.last_mut() {
            let bb = top.0;
            let targets = fnc.block(bb).targets();
            if top.1 < targets.len() {
                let tgt = targets[top.1];
                top.1 += 1;

                if on_stack[tgt.0 as usize] {
                    closing.insert((bb, tgt));
                } else if !visited[tgt.0 as usize] {
                    visited[tgt.0 as usize] = true;
                    on_stack[tgt.0 as usize] = true;
                    stack.push((tgt, 0));
                }
            } else {
                on_stack[bb.0 as usize] = false;
                stack.pop();
            }
        }

        LoopEdges { closing }
    }

    pub fn closes_loop(&self, src: BlockId, dst: BlockId) -> bool {
        self.closing.contains(&(src, dst))
    }

    /// True when some loop-closing edge targets `bb`.
    pub fn is_loop_head(&self, bb: BlockId) -> bool {
        self.closing.iter().any(|&(_, dst)| dst == bb)
    }

    pub fn len(&self) -> usize {
        self.closing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ProgramBuilder;

    #[test]
    fn straight_line_has_no_loop_edges() {
        let mut p = ProgramBuilder::new();
        let void = p.types().void();
        let mut f = p.fnc("f", void);
        let b0 = f.block("entry");
        let b1 = f.block("exit");
        f.switch_to(b0).jmp(b1);
        f.switch_to(b1).ret(None);
        let id = f.finish();

        let stor = p.build();
        let edges = LoopEdges::compute(stor.fnc(id));
        assert!(edges.is_empty());
    }

    #[test]
    fn while_loop_back_edge_is_detected() {
        let mut p = ProgramBuilder::new();
        let void = p.types().void();
        let i64t = p.types().int(8);

        let mut f = p.fnc("f", void);
        let x = f.local("x", i64t);
        let b0 = f.block("entry");
        let head = f.block("head");
        let body = f.block("body");
        let exit = f.block("exit");

        f.switch_to(b0).jmp(head);
        let cond = f.op_var(x);
        f.switch_to(head).cond(cond, body, exit);
        f.switch_to(body).jmp(head);
        f.switch_to(exit).ret(None);
        let id = f.finish();

        let stor = p.build();
        let edges = LoopEdges::compute(stor.fnc(id));
        assert!(edges.closes_loop(body, head));
        assert!(!edges.closes_loop(b0, head));
        assert!(edges.is_loop_head(head));
        assert!(!edges.is_loop_head(body));
        assert_eq!(edges.len(), 1);
    }
}
