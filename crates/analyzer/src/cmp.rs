//! Heap isomorphism
//!
//! Two heaps are equal when a simultaneous walk from the synchronized roots
//! (program variables, return slot) finds a bijection between their values
//! and objects that preserves every attribute and every predicate. The walk
//! only sees the reachable part; unreachable garbage does not influence
//! equality, mirroring how state containers use the comparison.

use crate::heap::{ObjId, SymHeap, ValId, ValTarget};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

struct CmpCtx<'a> {
    sh1: &'a SymHeap,
    sh2: &'a SymHeap,
    m12: BTreeMap<ValId, ValId>,
    m21: BTreeMap<ValId, ValId>,
    visited: BTreeSet<ObjId>,
    wl: VecDeque<(ValId, ValId)>,
}

impl<'a> CmpCtx<'a> {
    /// Record a value pair, refusing anything non-bijective.
    fn bind(&mut self, v1: ValId, v2: ValId) -> bool {
        match (self.m12.get(&v1), self.m21.get(&v2)) {
            (Some(&old2), Some(&old1)) => return old2 == v2 && old1 == v1,
            (None, None) => {}
            _ => return false,
        }
        self.m12.insert(v1, v2);
        self.m21.insert(v2, v1);
        self.wl.push_back((v1, v2));
        true
    }
}

fn match_objects(ctx: &mut CmpCtx<'_>, o1: ObjId, o2: ObjId) -> bool {
    if !ctx.visited.insert(o1) {
        // already descended; the value bijection pins the pairing
        return true;
    }

    let (sh1, sh2) = (ctx.sh1, ctx.sh2);

    if sh1.obj_kind(o1) != sh2.obj_kind(o2)
        || sh1.obj_size(o1) != sh2.obj_size(o2)
        || sh1.is_valid(o1) != sh2.is_valid(o2)
        || sh1.obj_proto_level(o1) != sh2.obj_proto_level(o2)
        || sh1.seg_binding(o1) != sh2.seg_binding(o2)
        || sh1.seg_min_length(o1) != sh2.seg_min_length(o2)
        || sh1.obj_estimated_type(o1) != sh2.obj_estimated_type(o2)
        || sh1.cvar_by_object(o1) != sh2.cvar_by_object(o2)
    {
        return false;
    }

    // identical field layout
    let flds1 = sh1.gather_live_fields(o1);
    let flds2 = sh2.gather_live_fields(o2);
    if flds1.len() != flds2.len() {
        return false;
    }
    for (f1, f2) in flds1.iter().zip(&flds2) {
        if f1.off != f2.off || f1.ty != f2.ty {
            return false;
        }
        let (Some(v1), Some(v2)) = (sh1.peek_field(*f1), sh2.peek_field(*f2)) else {
            return false;
        };
        if !ctx.bind(v1, v2) {
            return false;
        }
    }

    // identical uniform blocks
    let ubs1 = sh1.gather_uniform_blocks(o1);
    let ubs2 = sh2.gather_uniform_blocks(o2);
    if ubs1.len() != ubs2.len() {
        return false;
    }
    for (ub1, ub2) in ubs1.iter().zip(&ubs2) {
        if ub1.off != ub2.off || ub1.size != ub2.size || !ctx.bind(ub1.tpl_value, ub2.tpl_value) {
            return false;
        }
    }

    true
}

fn match_values(ctx: &mut CmpCtx<'_>, v1: ValId, v2: ValId) -> bool {
    if v1.is_special() || v2.is_special() {
        return v1 == v2;
    }

    match (ctx.sh1.val_target(v1), ctx.sh2.val_target(v2)) {
        (ValTarget::Custom(c1), ValTarget::Custom(c2)) => c1 == c2,
        (ValTarget::Unknown(o1), ValTarget::Unknown(o2)) => o1 == o2,
        (
            ValTarget::AddrOf { obj: o1, off: off1 },
            ValTarget::AddrOf { obj: o2, off: off2 },
        ) => {
            if off1 != off2 {
                return false;
            }
            let (o1, o2) = (*o1, *o2);
            let root1 = ctx.sh1.addr_of_region(o1);
            let root2 = ctx.sh2.addr_of_region(o2);
            if !ctx.bind(root1, root2) {
                return false;
            }
            match_objects(ctx, o1, o2)
        }
        _ => false,
    }
}

/// Predicates of `a` translated through the mapping must all hold in `b`.
fn preds_covered(
    a: &SymHeap,
    b: &SymHeap,
    map: &BTreeMap<ValId, ValId>,
) -> bool {
    for p in a.preds() {
        let (Some(&v1), Some(&v2)) = (map.get(&p.v1), map.get(&p.v2)) else {
            // operands outside the reachable part do not matter
            continue;
        };
        if !b.chk_pred(p.kind, v1, v2, p.k) {
            return false;
        }
    }
    true
}

/// Isomorphism of two symbolic heaps over the same program.
pub fn are_equal(sh1: &SymHeap, sh2: &SymHeap) -> bool {
    debug_assert!(std::sync::Arc::ptr_eq(sh1.stor(), sh2.stor()));

    let vars1: BTreeSet<_> = sh1.gather_program_vars().into_iter().collect();
    let vars2: BTreeSet<_> = sh2.gather_program_vars().into_iter().collect();
    if vars1 != vars2 {
        return false;
    }

    if sh1.obj_estimated_type(ObjId::RETURN) != sh2.obj_estimated_type(ObjId::RETURN) {
        return false;
    }

    let mut ctx = CmpCtx {
        sh1,
        sh2,
        m12: BTreeMap::new(),
        m21: BTreeMap::new(),
        visited: BTreeSet::new(),
        wl: VecDeque::new(),
    };

    // synchronize the roots
    for cv in &vars1 {
        let o1 = match sh1.var_object(*cv) {
            Some(o) => o,
            None => return false,
        };
        let o2 = match sh2.var_object(*cv) {
            Some(o) => o,
            None => return false,
        };
        if !ctx.bind(sh1.addr_of_region(o1), sh2.addr_of_region(o2)) {
            return false;
        }
        if !match_objects(&mut ctx, o1, o2) {
            return false;
        }
    }
    if sh1.obj_estimated_type(ObjId::RETURN).is_some() {
        ctx.bind(ValId::ADDR_OF_RET, ValId::ADDR_OF_RET);
        if !match_objects(&mut ctx, ObjId::RETURN, ObjId::RETURN) {
            return false;
        }
    }

    while let Some((v1, v2)) = ctx.wl.pop_front() {
        if !match_values(&mut ctx, v1, v2) {
            return false;
        }
    }

    let (m12, m21) = (ctx.m12, ctx.m21);
    preds_covered(sh1, sh2, &m12) && preds_covered(sh2, sh1, &m21)
}
