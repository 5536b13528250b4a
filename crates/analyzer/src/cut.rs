//! Splitting and merging heaps along a set of program variables
//!
//! The workhorse is [`prune`]: a worklist deep-copy that materializes in a
//! destination heap exactly the part of a source heap reachable from a cut
//! of program variables. With backward digging enabled the cut grows while
//! the copy runs: any object pointing into already-copied data is pulled in
//! too, which is what call/return localization needs. Cycles terminate
//! because the value map short-circuits every already-visited root.
//!
//! [`split_heap_by_cvars`] runs the prune twice (cut, then complement) to
//! produce a sub-heap and its frame; [`join_heaps_by_cvars`] merges a frame
//! back with a forward-only prune.

use crate::config::AnalyzerConfig;
use crate::heap::{CVar, FieldKey, IntRange, ObjId, SymHeap, ValId, ValTarget};
use crate::trace::TraceGraph;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

struct DeepCopyData<'a> {
    src: &'a mut SymHeap,
    dst: &'a mut SymHeap,
    cut: &'a mut BTreeSet<CVar>,
    dig_backward: bool,
    val_map: BTreeMap<ValId, ValId>,
    seg_lengths: BTreeMap<ValId, u32>,
    wl: VecDeque<(FieldKey, FieldKey)>,
    wl_seen: BTreeSet<(FieldKey, FieldKey)>,
}

impl<'a> DeepCopyData<'a> {
    fn schedule(&mut self, item: (FieldKey, FieldKey)) {
        if self.wl_seen.insert(item) {
            self.wl.push_back(item);
        }
    }
}

/// Translate a template value (uniform-block filler); never an address.
fn translate_val_proto(dst: &mut SymHeap, src: &SymHeap, proto: ValId) -> ValId {
    if proto.is_special() {
        return proto;
    }
    match src.val_target(proto).clone() {
        ValTarget::Custom(cv) => dst.val_wrap_custom(cv),
        ValTarget::Unknown(origin) => dst.val_create_unknown(origin),
        _ => ValId::INVALID,
    }
}

/// Copy uniform blocks of one object and schedule all its live fields.
fn dig_fields(dc: &mut DeepCopyData<'_>, addr_src: ValId, addr_dst: ValId) {
    if dc.src.is_possible_to_deref(addr_src) {
        let obj_src = dc.src.obj_by_addr(addr_src);
        let obj_dst = dc.dst.obj_by_addr(addr_dst);
        for mut ub in dc.src.gather_uniform_blocks(obj_src) {
            ub.tpl_value = translate_val_proto(dc.dst, dc.src, ub.tpl_value);
            dc.dst.write_uniform_block(obj_dst, ub);
        }
    }

    let obj_src = dc.src.obj_by_addr(addr_src);
    let obj_dst = dc.dst.obj_by_addr(addr_dst);
    for fld_src in dc.src.gather_live_fields(obj_src) {
        let fld_dst = FieldKey {
            obj: obj_dst,
            off: fld_src.off,
            ty: fld_src.ty,
        };
        let at_src = dc.src.addr_of(obj_src, IntRange::single(fld_src.off as i64));
        let at_dst = dc.dst.addr_of(obj_dst, IntRange::single(fld_src.off as i64));
        dc.val_map.insert(at_src, at_dst);
        dc.schedule((fld_src, fld_dst));
    }
}

/// Materialize in `dst` the object rooted at `root_src_at`, preserving
/// size, type info, prototype level and abstract-object metadata.
fn add_object_if_needed(dc: &mut DeepCopyData<'_>, root_src_at: ValId) -> ValId {
    if ValId::NULL == root_src_at {
        return ValId::NULL;
    }
    if let Some(&mapped) = dc.val_map.get(&root_src_at) {
        return mapped;
    }
    debug_assert_ne!(ValId::ADDR_OF_RET, root_src_at);

    let obj_src = dc.src.obj_by_addr(root_src_at);
    let valid = dc.src.is_valid(obj_src);

    if let Some(cv) = dc.src.cvar_by_object(obj_src) {
        // program variable: enlarge the cut if needed
        if valid {
            dc.cut.insert(cv);
        }

        let reg_dst = dc.dst.region_by_var(cv, true);
        if !valid {
            dc.dst.obj_invalidate(reg_dst);
        }

        let root_dst_at = dc.dst.addr_of_region(reg_dst);
        dc.val_map.insert(root_src_at, root_dst_at);
        dig_fields(dc, root_src_at, root_dst_at);
        return root_dst_at;
    }

    // create the object in dst
    let size = dc.src.obj_size(obj_src);
    let obj_dst = dc.dst.heap_alloc(size);
    if !valid {
        dc.dst.obj_invalidate(obj_dst);
    }

    let root_dst_at = dc.dst.addr_of_region(obj_dst);

    if let Some(clt) = dc.src.obj_estimated_type(obj_src) {
        dc.dst.obj_set_estimated_type(obj_dst, clt);
    }
    dc.dst
        .obj_set_proto_level(obj_dst, dc.src.obj_proto_level(obj_src));

    let kind = dc.src.obj_kind(obj_src);
    if kind.is_abstract() {
        dc.dst
            .obj_set_abstract(obj_dst, kind, dc.src.seg_binding(obj_src));
        dc.seg_lengths
            .insert(root_dst_at, dc.src.seg_min_length(obj_src));
    }

    dc.val_map.insert(root_src_at, root_dst_at);
    dig_fields(dc, root_src_at, root_dst_at);
    root_dst_at
}

fn handle_value_core(dc: &mut DeepCopyData<'_>, src_at: ValId) -> ValId {
    if let Some(&mapped) = dc.val_map.get(&src_at) {
        return mapped;
    }

    let root_src_at = dc.src.val_root(src_at);
    let root_dst_at = add_object_if_needed(dc, root_src_at);

    let off = dc.src.val_offset(src_at);
    if !off.is_single() {
        // range offset value
        let dst_at = dc.dst.val_by_range(root_dst_at, off);
        dc.val_map.insert(src_at, dst_at);
        return dst_at;
    }

    if off.lo == 0 {
        return root_dst_at;
    }

    let dst_at = dc.dst.val_by_offset(root_dst_at, off.lo);
    dc.val_map.insert(src_at, dst_at);
    dst_at
}

fn handle_custom_value(dc: &mut DeepCopyData<'_>, val_src: ValId) -> ValId {
    let custom = dc
        .src
        .val_unwrap_custom(val_src)
        .expect("handle_custom_value: not a custom value")
        .clone();
    let val_dst = dc.dst.val_wrap_custom(custom);
    dc.val_map.insert(val_src, val_dst);
    val_dst
}

/// Enumerate back-pointers of a value and pull their source objects into
/// the copy; this is what grows the cut when reachability is bidirectional.
fn track_uses(dc: &mut DeepCopyData<'_>, val_src: ValId) {
    if !dc.dig_backward {
        return;
    }

    let root_src_at = dc.src.val_root(val_src);
    if ValId::NULL == root_src_at {
        return;
    }

    let uses = if dc.src.is_possible_to_deref(root_src_at) {
        dc.src.pointed_by(dc.src.obj_by_addr(root_src_at))
    } else {
        dc.src.used_by(val_src)
    };

    // go from the value backward
    for fld_src in uses {
        let src_at = dc
            .src
            .addr_of(fld_src.obj, IntRange::single(fld_src.off as i64));
        if !dc.src.is_possible_to_deref(src_at) {
            continue;
        }

        handle_value_core(dc, src_at);
    }
}

fn handle_value(dc: &mut DeepCopyData<'_>, val_src: ValId) -> ValId {
    if val_src.is_special() {
        // reserved ids always match across heaps
        return val_src;
    }

    if let Some(&mapped) = dc.val_map.get(&val_src) {
        return mapped;
    }

    track_uses(dc, val_src);

    match dc.src.val_target(val_src).clone() {
        ValTarget::Custom(_) => handle_custom_value(dc, val_src),
        ValTarget::AddrOf { .. } => handle_value_core(dc, val_src),
        ValTarget::Unknown(origin) => {
            let val_dst = dc.dst.val_create_unknown(origin);
            dc.val_map.insert(val_src, val_dst);
            val_dst
        }
        ValTarget::Null | ValTarget::Invalid => val_src,
    }
}

fn deep_copy(dc: &mut DeepCopyData<'_>) {
    while let Some((fld_src, fld_dst)) = dc.wl.pop_front() {
        let at_src = dc
            .src
            .addr_of(fld_src.obj, IntRange::single(fld_src.off as i64));
        track_uses(dc, at_src);

        let Some(val_src) = dc.src.peek_field(fld_src) else {
            continue;
        };
        if dc.src.stor().types.is_composite(fld_src.ty) {
            // structure is materialized by its member fields
            continue;
        }

        let val_dst = handle_value(dc, val_src);
        dc.dst.write_field(fld_dst, val_dst);
    }

    dc.src.copy_relevant_preds(dc.dst, &dc.val_map);

    for (&root_dst_at, &min_len) in &dc.seg_lengths {
        let seg = dc.dst.obj_by_addr(root_dst_at);
        dc.dst.seg_set_min_length(seg, min_len);
    }
}

/// Deep-copy the part of `src` reachable from `cut` into `dst`.
///
/// The cut may grow while copying unless `forward_only` is set; the value
/// map of the copy is returned for callers that need to translate further
/// ids (trace recording).
pub fn prune(
    src: &mut SymHeap,
    dst: &mut SymHeap,
    cut: &mut BTreeSet<CVar>,
    forward_only: bool,
) -> BTreeMap<ValId, ValId> {
    let mut dc = DeepCopyData {
        src,
        dst,
        cut,
        dig_backward: !forward_only,
        val_map: BTreeMap::new(),
        seg_lengths: BTreeMap::new(),
        wl: VecDeque::new(),
        wl_seen: BTreeSet::new(),
    };

    // go through all program variables of the cut
    let snap: Vec<CVar> = dc.cut.iter().copied().collect();
    for cv in snap {
        let src_reg = dc.src.region_by_var(cv, true);
        let dst_reg = dc.dst.region_by_var(cv, true);
        if !dc.src.is_valid(src_reg) {
            dc.dst.obj_invalidate(dst_reg);
        }

        let src_at = dc.src.addr_of_region(src_reg);
        let dst_at = dc.dst.addr_of_region(dst_reg);
        dc.val_map.insert(src_at, dst_at);
        dig_fields(&mut dc, src_at, dst_at);
    }

    if let Some(ty) = dc.src.obj_estimated_type(ObjId::RETURN) {
        // clone the return slot as well
        dc.dst.obj_set_estimated_type(ObjId::RETURN, ty);
        dc.val_map.insert(ValId::ADDR_OF_RET, ValId::ADDR_OF_RET);
        dig_fields(&mut dc, ValId::ADDR_OF_RET, ValId::ADDR_OF_RET);
    }

    deep_copy(&mut dc);
    dc.val_map
}

/// Partition `src_dst` into the sub-heap reachable from `cut` (written back
/// into `src_dst`) and its frame (written into `save_frame_to` when given).
pub fn split_heap_by_cvars(
    config: &AnalyzerConfig,
    tg: &mut TraceGraph,
    src_dst: &mut SymHeap,
    cut: &[CVar],
    mut save_frame_to: Option<&mut SymHeap>,
) {
    if config.disable_sym_cut {
        return;
    }

    // intersect the cut with the live program variables
    let live: BTreeSet<CVar> = src_dst.gather_program_vars().into_iter().collect();
    let mut cset: BTreeSet<CVar> = cut.iter().filter(|cv| live.contains(cv)).copied().collect();
    let cnt_orig = cset.len();

    // cut the first part
    let trace = tg.transient("split_heap_by_cvars");
    let mut dst = SymHeap::new(src_dst.stor().clone(), trace);
    prune(src_dst, &mut dst, &mut cset, false);

    let Some(frame) = save_frame_to.as_deref_mut() else {
        *src_dst = dst;
        return;
    };

    // the complement of the (possibly enlarged) cut
    let all: Vec<CVar> = src_dst.gather_program_vars();
    let mut complement: BTreeSet<CVar> = all
        .iter()
        .filter(|cv| !cset.contains(cv))
        .copied()
        .collect();

    prune(src_dst, frame, &mut complement, false);

    debug_assert!(cset.len() >= cnt_orig);
    debug_assert_eq!(cset.len() + complement.len(), all.len());

    *src_dst = dst;
}

/// Merge the heap `src2` (typically a frame) into `src_dst`.
pub fn join_heaps_by_cvars(config: &AnalyzerConfig, src_dst: &mut SymHeap, src2: &mut SymHeap) {
    if config.disable_sym_cut {
        return;
    }

    // forward-only merge over all program variables of src2
    let mut cset: BTreeSet<CVar> = src2.gather_program_vars().into_iter().collect();
    prune(src2, src_dst, &mut cset, true);
}
