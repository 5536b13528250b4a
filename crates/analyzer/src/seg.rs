//! Helpers for abstract list segments
//!
//! Binding discovery turns a concrete node's pointer layout into candidate
//! `next`/`prev` offsets; unfolding (concretization) materializes the cases
//! an abstract object stands for, which the transfer functions need before
//! dereferencing through one.

use crate::heap::{BindingOff, FieldKey, ObjId, ObjKind, SymHeap, ValId, ValTarget};
use crate::trace::TraceGraph;

/// The live pointer field of `o` placed at `off`, if any.
pub fn link_field(sh: &SymHeap, o: ObjId, off: u32) -> Option<FieldKey> {
    sh.gather_live_pointers(o).into_iter().find(|k| k.off == off)
}

/// Value of the `next` link of a node, per the given binding.
pub fn next_value(sh: &SymHeap, o: ObjId, binding: &BindingOff) -> Option<ValId> {
    link_field(sh, o, binding.next).and_then(|k| sh.peek_field(k))
}

/// Value of the `prev` link of a node, per the given binding.
pub fn prev_value(sh: &SymHeap, o: ObjId, binding: &BindingOff) -> Option<ValId> {
    let prev = binding.prev?;
    link_field(sh, o, prev).and_then(|k| sh.peek_field(k))
}

/// Nodes of one chain must agree on size and prototype nesting.
pub fn compatible_nodes(sh_a: &SymHeap, o_a: ObjId, sh_b: &SymHeap, o_b: ObjId) -> bool {
    if sh_a.obj_size(o_a) != sh_b.obj_size(o_b)
        || sh_a.obj_proto_level(o_a) != sh_b.obj_proto_level(o_b)
    {
        return false;
    }
    match (sh_a.obj_estimated_type(o_a), sh_b.obj_estimated_type(o_b)) {
        (Some(t1), Some(t2)) => t1 == t2,
        _ => true,
    }
}

/// Guess the linking offsets of a concrete node: the first pointer field
/// reaching a same-sized object becomes `next`; a pointer field of that
/// target aiming back at the node makes the pair a DLS candidate.
pub fn discover_binding(sh: &SymHeap, o: ObjId) -> Option<BindingOff> {
    let ptrs = sh.gather_live_pointers(o);

    for f in &ptrs {
        let Some(v) = sh.peek_field(*f) else {
            continue;
        };
        if !sh.is_possible_to_deref(v) {
            continue;
        }
        let tgt = sh.obj_by_addr(v);
        if tgt == o || !compatible_nodes(sh, o, sh, tgt) {
            continue;
        }

        let back = sh.addr_of_region(o);
        for g in sh.gather_live_pointers(tgt) {
            if g.off == f.off {
                continue;
            }
            if sh.peek_field(g) == Some(back) {
                return Some(BindingOff {
                    next: f.off,
                    prev: Some(g.off),
                    head: 0,
                });
            }
        }
        return Some(BindingOff {
            next: f.off,
            prev: None,
            head: 0,
        });
    }

    match ptrs.as_slice() {
        [only] => Some(BindingOff {
            next: only.off,
            prev: None,
            head: 0,
        }),
        _ => None,
    }
}

/// Redirect every pointer at `o` to `to`, then retire the object. For a
/// DLS, back links (fields at the `prev` offset) are redirected to the
/// segment's own `prev` value instead, so both ends reconnect.
fn see_through(sh: &mut SymHeap, o: ObjId, to: ValId, binding: Option<&BindingOff>) {
    let back_to = binding
        .and_then(|b| b.prev.map(|_| prev_value(sh, o, b)))
        .flatten();
    let prev_off = binding.and_then(|b| b.prev);
    for fld in sh.pointed_by(o) {
        match (back_to, prev_off) {
            (Some(pv), Some(poff)) if fld.off == poff => sh.write_field(fld, pv),
            _ => sh.write_field(fld, to),
        }
    }
    sh.obj_invalidate(o);
}

/// Clone a node's non-link fields onto another object of the same layout.
/// Unknown values are refreshed so the two objects stay independent.
fn copy_plain_fields(sh: &mut SymHeap, from: ObjId, to: ObjId, binding: &BindingOff) {
    for key in sh.gather_live_fields(from) {
        if key.off == binding.next || Some(key.off) == binding.prev {
            continue;
        }
        let Some(v) = sh.peek_field(key) else {
            continue;
        };
        let v = match sh.val_target(v) {
            ValTarget::Unknown(origin) => {
                let origin = *origin;
                sh.val_create_unknown(origin)
            }
            _ => v,
        };
        sh.write_field(
            FieldKey {
                obj: to,
                off: key.off,
                ty: key.ty,
            },
            v,
        );
    }
}

/// Materialize the concrete cases an abstract object stands for. Each
/// returned heap is a clone of `sh` with the object one step less abstract;
/// dereferencing through the object is safe in every returned heap.
pub fn unfold(tg: &mut TraceGraph, sh: &SymHeap, obj: ObjId) -> Vec<SymHeap> {
    let kind = sh.obj_kind(obj);
    debug_assert!(kind.is_abstract());

    let mut out = Vec::new();
    let binding = sh.seg_binding(obj);
    let min_len = sh.seg_min_length(obj);

    // the empty case: the object stands for zero nodes
    let may_be_empty = match kind {
        ObjKind::MayExist => true,
        ObjKind::Sls | ObjKind::Dls => min_len == 0,
        _ => false,
    };
    if may_be_empty {
        let to = binding
            .and_then(|b| next_value(sh, obj, &b))
            .unwrap_or(ValId::NULL);
        // a self-referential see-through value cannot be resolved
        if sh.obj_by_addr(to) != obj {
            let mut empty = sh.clone();
            empty.set_trace(tg.clone_node(sh.trace()));
            empty.bump_generation();
            see_through(&mut empty, obj, to, binding.as_ref());
            out.push(empty);
        }
    }

    // the non-empty case: a concrete head node materializes
    let mut full = sh.clone();
    full.set_trace(tg.clone_node(sh.trace()));
    full.bump_generation();
    match kind {
        ObjKind::MayExist => {
            full.obj_set_concrete(obj);
        }
        ObjKind::Sls | ObjKind::Dls => {
            let Some(b) = binding else {
                return out;
            };
            let size = full.obj_size(obj);
            let tail = full.heap_alloc(size);
            if let Some(ty) = full.obj_estimated_type(obj) {
                full.obj_set_estimated_type(tail, ty);
            }
            full.obj_set_proto_level(tail, full.obj_proto_level(obj));
            full.obj_set_abstract(tail, kind, Some(b));
            full.seg_set_min_length(tail, min_len.saturating_sub(1));

            copy_plain_fields(&mut full, obj, tail, &b);

            // re-link: head -> tail -> old successor
            let head_addr = full.addr_of_region(obj);
            let tail_addr = full.addr_of_region(tail);
            if let Some(next_fld) = link_field(&full, obj, b.next) {
                let old_next = full.peek_field(next_fld).unwrap_or(ValId::NULL);
                full.write_field(
                    FieldKey {
                        obj: tail,
                        off: b.next,
                        ty: next_fld.ty,
                    },
                    old_next,
                );
                full.write_field(next_fld, tail_addr);

                if let Some(poff) = b.prev {
                    let prev_ty = link_field(&full, obj, poff)
                        .map(|k| k.ty)
                        .unwrap_or(next_fld.ty);
                    full.write_field(
                        FieldKey {
                            obj: tail,
                            off: poff,
                            ty: prev_ty,
                        },
                        head_addr,
                    );

                    // the old successor's back link now targets the tail
                    if full.is_possible_to_deref(old_next) && full.val_offset(old_next).lo == 0 {
                        let succ = full.obj_by_addr(old_next);
                        if let Some(back) = link_field(&full, succ, poff) {
                            if full.peek_field(back) == Some(head_addr) {
                                full.write_field(back, tail_addr);
                            }
                        }
                    }
                }
                full.obj_set_concrete(obj);
            } else {
                // a segment without its link is beyond repair; keep only
                // whatever the empty case produced
                return out;
            }
        }
        _ => {}
    }
    out.push(full);

    out
}
