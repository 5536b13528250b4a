//! Abstract join of two symbolic heaps
//!
//! `join_sym_heaps` walks both heaps simultaneously from the synchronized
//! roots, building an output heap that subsumes both inputs, and classifies
//! the relation of the inputs on the way:
//!
//! - `Equal`: the heaps are isomorphic,
//! - `LeftCovers` / `RightCovers`: one side already subsumes the other,
//! - `ThreeWay`: the output is strictly more abstract than both inputs;
//!   this is the engine's widening and only happens when the caller allows
//!   it.
//!
//! Widening folds concrete list chains into segments: a chain and a
//! compatible segment melt into one segment whose minimum length is the
//! smaller of the two sides' guarantees; a null meeting an address gives
//! birth to a may-exist object. DLS folding verifies the back-link
//! invariant of every absorbed node and gives up on violation, in which
//! case the caller simply keeps both heaps.
//!
//! A failed join leaves no mark on either input; the partially built output
//! is discarded wholesale.

use crate::heap::{
    BindingOff, CustomValue, FieldKey, IntRange, ObjId, ObjKind, StorClass, SymHeap, ValId,
    ValOrigin, ValTarget,
};
use crate::seg;
use crate::trace::{IdMapper, TraceGraph};
use shale_ir::TypeId;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Relation of two joined heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Equal,
    /// The left heap subsumes the right one.
    LeftCovers,
    /// The right heap subsumes the left one.
    RightCovers,
    /// The output is strictly more abstract than both inputs.
    ThreeWay,
}

impl JoinStatus {
    /// The status the mirrored join (arguments swapped) reports.
    pub fn swapped(self) -> JoinStatus {
        match self {
            JoinStatus::LeftCovers => JoinStatus::RightCovers,
            JoinStatus::RightCovers => JoinStatus::LeftCovers,
            other => other,
        }
    }
}

/// A successfully joined heap with the relation of its inputs.
#[derive(Debug)]
pub struct JoinResult {
    pub status: JoinStatus,
    pub heap: SymHeap,
}

/// Irreconcilable shapes; the caller stores both heaps separately.
struct JoinFailed;

type JResult<T> = Result<T, JoinFailed>;

struct JoinCtx<'a> {
    sh1: &'a SymHeap,
    sh2: &'a SymHeap,
    dst: SymHeap,
    /// Memo of two-sided pairings.
    pair_cache: BTreeMap<(ValId, ValId), ValId>,
    /// Memos of one-sided clones.
    one1: BTreeMap<ValId, ValId>,
    one2: BTreeMap<ValId, ValId>,
    /// Per-side value translations (for the trace id-mappers and for
    /// consistency checks). Reserved ids are never recorded here: the null
    /// pairs with plain nulls and with may-exist targets at the same time.
    map1: BTreeMap<ValId, ValId>,
    map2: BTreeMap<ValId, ValId>,
    status: JoinStatus,
    allow_three_way: bool,
}

impl<'a> JoinCtx<'a> {
    fn side(&self, side: u8) -> &'a SymHeap {
        match side {
            1 => self.sh1,
            _ => self.sh2,
        }
    }

    fn update_status(&mut self, action: JoinStatus) -> JResult<()> {
        use JoinStatus::*;
        let new = match (self.status, action) {
            (cur, Equal) => cur,
            (Equal, act) => act,
            (LeftCovers, LeftCovers) => LeftCovers,
            (RightCovers, RightCovers) => RightCovers,
            _ => ThreeWay,
        };
        if new == ThreeWay && !self.allow_three_way {
            return Err(JoinFailed);
        }
        self.status = new;
        Ok(())
    }

    /// Already-joined output for a value pair; `Err` on a mapping conflict.
    fn joined_pair(&self, v1: Option<ValId>, v2: Option<ValId>) -> JResult<Option<ValId>> {
        match (v1, v2) {
            (Some(a), Some(b)) => {
                if let Some(&out) = self.pair_cache.get(&(a, b)) {
                    return Ok(Some(out));
                }
                if a.is_special() || b.is_special() {
                    return Ok(None);
                }
                match (self.map1.get(&a), self.map2.get(&b)) {
                    (Some(&x), Some(&y)) if x == y => Ok(Some(x)),
                    (None, None) => Ok(None),
                    // each side's translation must stay a function
                    _ => Err(JoinFailed),
                }
            }
            (Some(a), None) => Ok(self.one1.get(&a).or_else(|| self.map1.get(&a)).copied()),
            (None, Some(b)) => Ok(self.one2.get(&b).or_else(|| self.map2.get(&b)).copied()),
            (None, None) => Ok(None),
        }
    }

    fn bind(&mut self, v1: Option<ValId>, v2: Option<ValId>, out: ValId) -> JResult<()> {
        if let (Some(a), Some(b)) = (v1, v2) {
            self.pair_cache.insert((a, b), out);
        } else if let Some(a) = v1 {
            self.one1.insert(a, out);
        } else if let Some(b) = v2 {
            self.one2.insert(b, out);
        }
        if let Some(a) = v1 {
            self.record(1, a, out)?;
        }
        if let Some(b) = v2 {
            self.record(2, b, out)?;
        }
        Ok(())
    }

    fn record(&mut self, side: u8, v: ValId, out: ValId) -> JResult<()> {
        if v.is_special() {
            return Ok(());
        }
        let map = match side {
            1 => &mut self.map1,
            _ => &mut self.map2,
        };
        if *map.entry(v).or_insert(out) != out {
            return Err(JoinFailed);
        }
        Ok(())
    }
}

// ---- value pairing ------------------------------------------------------

fn join_values(ctx: &mut JoinCtx<'_>, v1: ValId, v2: ValId) -> JResult<ValId> {
    if let Some(out) = ctx.joined_pair(Some(v1), Some(v2))? {
        return Ok(out);
    }

    if v1.is_special() || v2.is_special() {
        if v1 == v2 {
            ctx.bind(Some(v1), Some(v2), v1)?;
            return Ok(v1);
        }
        // fall through: a special on one side may still be joinable
    }

    let t1 = ctx.sh1.val_target(v1).clone();
    let t2 = ctx.sh2.val_target(v2).clone();

    match (t1, t2) {
        (ValTarget::Custom(a), ValTarget::Custom(b)) => {
            if a != b {
                return Err(JoinFailed);
            }
            let out = ctx.dst.val_wrap_custom(a);
            ctx.bind(Some(v1), Some(v2), out)?;
            Ok(out)
        }

        (ValTarget::Unknown(o1), ValTarget::Unknown(o2)) => {
            let origin = if o1 == o2 {
                o1
            } else {
                match (o1, o2) {
                    (ValOrigin::UnknownResult, _) => ctx.update_status(JoinStatus::LeftCovers)?,
                    (_, ValOrigin::UnknownResult) => ctx.update_status(JoinStatus::RightCovers)?,
                    _ => ctx.update_status(JoinStatus::ThreeWay)?,
                }
                ValOrigin::UnknownResult
            };
            let out = ctx.dst.val_create_unknown(origin);
            ctx.bind(Some(v1), Some(v2), out)?;
            Ok(out)
        }

        // an unknown swallows any known value; the unknown side covers
        (ValTarget::Unknown(origin), _) => {
            ctx.update_status(JoinStatus::LeftCovers)?;
            let out = ctx.dst.val_create_unknown(origin);
            ctx.bind(Some(v1), Some(v2), out)?;
            Ok(out)
        }
        (_, ValTarget::Unknown(origin)) => {
            ctx.update_status(JoinStatus::RightCovers)?;
            let out = ctx.dst.val_create_unknown(origin);
            ctx.bind(Some(v1), Some(v2), out)?;
            Ok(out)
        }

        (ValTarget::AddrOf { obj: o1, off: off1 }, ValTarget::AddrOf { obj: o2, off: off2 }) => {
            let dst_obj = join_objects(ctx, o1, o2)?;
            let off = if off1 == off2 {
                off1
            } else {
                ctx.update_status(JoinStatus::ThreeWay)?;
                off1.hull(&off2)
            };
            let out = ctx.dst.addr_of(dst_obj, off);
            ctx.bind(Some(v1), Some(v2), out)?;
            Ok(out)
        }

        (ValTarget::Null, ValTarget::AddrOf { obj, off }) => {
            join_null_with_object(ctx, 2, v1, v2, obj, off)
        }
        (ValTarget::AddrOf { obj, off }, ValTarget::Null) => {
            join_null_with_object(ctx, 1, v2, v1, obj, off)
        }

        _ => Err(JoinFailed),
    }
}

/// Join a null with an address: a possibly-empty abstract target covers the
/// null outright; a concrete region gives rise to a may-exist object.
fn join_null_with_object(
    ctx: &mut JoinCtx<'_>,
    obj_side: u8,
    v_null: ValId,
    v_addr: ValId,
    obj: ObjId,
    off: IntRange,
) -> JResult<ValId> {
    if off != IntRange::single(0) {
        return Err(JoinFailed);
    }
    let sh = ctx.side(obj_side);
    if !sh.is_valid(obj) {
        return Err(JoinFailed);
    }

    let (pair1, pair2) = if obj_side == 2 {
        (Some(v_null), Some(v_addr))
    } else {
        (Some(v_addr), Some(v_null))
    };

    let kind = sh.obj_kind(obj);
    let may_be_empty = match kind {
        ObjKind::MayExist => true,
        ObjKind::Sls | ObjKind::Dls => sh.seg_min_length(obj) == 0,
        _ => false,
    };
    // an abstract chain covers the null only when its empty unfolding
    // actually ends in null
    let covers_null = may_be_empty && chain_resolves_to_null(sh, obj);

    if covers_null {
        // the empty unfolding of the abstract object is exactly the null
        ctx.update_status(if obj_side == 1 {
            JoinStatus::LeftCovers
        } else {
            JoinStatus::RightCovers
        })?;
        let dst_obj = clone_object_one_sided(ctx, obj_side, obj)?;
        let out = ctx.dst.addr_of(dst_obj, IntRange::single(0));
        ctx.bind(pair1, pair2, out)?;
        return Ok(out);
    }

    if kind != ObjKind::Region {
        return Err(JoinFailed);
    }

    // introduce a may-exist object covering both cases
    ctx.update_status(JoinStatus::ThreeWay)?;

    let binding = match seg::discover_binding(sh, obj) {
        Some(b) => Some(b),
        None if sh.gather_live_pointers(obj).is_empty() => None,
        // outgoing pointers we cannot classify would get lost
        None => return Err(JoinFailed),
    };

    let dst_obj = ctx.dst.heap_alloc(sh.obj_size(obj));
    if let Some(ty) = sh.obj_estimated_type(obj) {
        ctx.dst.obj_set_estimated_type(dst_obj, ty);
    }
    ctx.dst
        .obj_set_proto_level(dst_obj, sh.obj_proto_level(obj));
    ctx.dst.obj_set_abstract(dst_obj, ObjKind::MayExist, binding);

    let out = ctx.dst.addr_of(dst_obj, IntRange::single(0));
    ctx.bind(pair1, pair2, out)?;

    // plain fields come from the existing side
    for key in sh.gather_live_fields(obj) {
        if let Some(b) = &binding {
            if key.off == b.next {
                continue;
            }
        }
        let Some(v) = sh.peek_field(key) else {
            continue;
        };
        let out_v = join_one_sided(ctx, obj_side, v)?;
        ctx.dst.write_field(
            FieldKey {
                obj: dst_obj,
                off: key.off,
                ty: key.ty,
            },
            out_v,
        );
    }

    // the see-through link: joins the null continuation with the
    // object's successor
    if let Some(b) = binding {
        if let Some(link) = seg::link_field(sh, obj, b.next) {
            let see = sh.peek_field(link).unwrap_or(ValId::NULL);
            let out_next = if obj_side == 2 {
                join_values(ctx, ValId::NULL, see)?
            } else {
                join_values(ctx, see, ValId::NULL)?
            };
            ctx.dst.write_field(
                FieldKey {
                    obj: dst_obj,
                    off: b.next,
                    ty: link.ty,
                },
                out_next,
            );
        }
    }

    Ok(out)
}

/// Follow see-through links of possibly-empty abstract objects; true when
/// the whole chain can vanish into a null.
fn chain_resolves_to_null(sh: &SymHeap, obj: ObjId) -> bool {
    let mut cur = obj;
    let mut hops = 0;
    loop {
        if hops > sh.cnt_objs() {
            return false;
        }
        hops += 1;

        match sh.obj_kind(cur) {
            ObjKind::MayExist => {}
            ObjKind::Sls | ObjKind::Dls if sh.seg_min_length(cur) == 0 => {}
            _ => return false,
        }
        let see = sh
            .seg_binding(cur)
            .and_then(|b| seg::next_value(sh, cur, &b))
            .unwrap_or(ValId::NULL);
        if see == ValId::NULL {
            return true;
        }
        match sh.val_target(see) {
            ValTarget::AddrOf { obj: tgt, .. } => cur = *tgt,
            _ => return false,
        }
    }
}

// ---- one-sided cloning --------------------------------------------------

fn join_one_sided(ctx: &mut JoinCtx<'_>, side: u8, v: ValId) -> JResult<ValId> {
    let (k1, k2) = if side == 1 {
        (Some(v), None)
    } else {
        (None, Some(v))
    };
    if let Some(out) = ctx.joined_pair(k1, k2)? {
        return Ok(out);
    }
    if v.is_special() {
        ctx.bind(k1, k2, v)?;
        return Ok(v);
    }

    let sh = ctx.side(side);
    match sh.val_target(v).clone() {
        ValTarget::Custom(cv) => {
            let out = ctx.dst.val_wrap_custom(cv);
            ctx.bind(k1, k2, out)?;
            Ok(out)
        }
        ValTarget::Unknown(origin) => {
            let out = ctx.dst.val_create_unknown(origin);
            ctx.bind(k1, k2, out)?;
            Ok(out)
        }
        ValTarget::AddrOf { obj, off } => {
            let dst_obj = clone_object_one_sided(ctx, side, obj)?;
            let out = ctx.dst.addr_of(dst_obj, off);
            ctx.bind(k1, k2, out)?;
            Ok(out)
        }
        ValTarget::Null | ValTarget::Invalid => Ok(v),
    }
}

/// Forward copy of one side's object into the output, preserving all
/// metadata; used where the other side contributes nothing at all.
fn clone_object_one_sided(ctx: &mut JoinCtx<'_>, side: u8, obj: ObjId) -> JResult<ObjId> {
    let sh = ctx.side(side);
    let root = sh.addr_of_region(obj);
    let (k1, k2) = if side == 1 {
        (Some(root), None)
    } else {
        (None, Some(root))
    };
    if let Some(out) = ctx.joined_pair(k1, k2)? {
        return Ok(ctx.dst.obj_by_addr(out));
    }

    let dst_obj = match sh.obj_stor_class(obj) {
        StorClass::Var(cv) => ctx.dst.region_by_var(cv, true),
        StorClass::OnHeap => ctx.dst.heap_alloc(sh.obj_size(obj)),
        StorClass::Return | StorClass::Invalid => return Err(JoinFailed),
    };
    if !sh.is_valid(obj) {
        ctx.dst.obj_invalidate(dst_obj);
    }
    if let Some(ty) = sh.obj_estimated_type(obj) {
        ctx.dst.obj_set_estimated_type(dst_obj, ty);
    }
    ctx.dst.obj_set_proto_level(dst_obj, sh.obj_proto_level(obj));
    let kind = sh.obj_kind(obj);
    if kind.is_abstract() {
        ctx.dst
            .obj_set_abstract(dst_obj, kind, sh.seg_binding(obj));
        ctx.dst
            .seg_set_min_length(dst_obj, sh.seg_min_length(obj));
    }

    let dst_root = ctx.dst.addr_of_region(dst_obj);
    ctx.bind(k1, k2, dst_root)?;

    for mut ub in sh.gather_uniform_blocks(obj) {
        ub.tpl_value = match sh.val_target(ub.tpl_value).clone() {
            ValTarget::Custom(cv) => ctx.dst.val_wrap_custom(cv),
            ValTarget::Unknown(origin) => ctx.dst.val_create_unknown(origin),
            _ => ub.tpl_value,
        };
        ctx.dst.write_uniform_block(dst_obj, ub);
    }

    for key in sh.gather_live_fields(obj) {
        let Some(v) = ctx.side(side).peek_field(key) else {
            continue;
        };
        let out_v = join_one_sided(ctx, side, v)?;
        ctx.dst.write_field(
            FieldKey {
                obj: dst_obj,
                off: key.off,
                ty: key.ty,
            },
            out_v,
        );
    }

    Ok(dst_obj)
}

// ---- object pairing -----------------------------------------------------

fn join_objects(ctx: &mut JoinCtx<'_>, o1: ObjId, o2: ObjId) -> JResult<ObjId> {
    let r1 = ctx.sh1.addr_of_region(o1);
    let r2 = ctx.sh2.addr_of_region(o2);
    if let Some(out) = ctx.joined_pair(Some(r1), Some(r2))? {
        return Ok(ctx.dst.obj_by_addr(out));
    }

    let valid1 = ctx.sh1.is_valid(o1);
    let valid2 = ctx.sh2.is_valid(o2);
    if valid1 != valid2 {
        return Err(JoinFailed);
    }

    let stor1 = ctx.sh1.obj_stor_class(o1);
    let stor2 = ctx.sh2.obj_stor_class(o2);

    match (stor1, stor2) {
        (StorClass::Return, StorClass::Return) => {
            // handled once, from the root seeding
            ctx.bind(Some(r1), Some(r2), ValId::ADDR_OF_RET)?;
            join_fields(ctx, o1, o2, ObjId::RETURN, None)?;
            Ok(ObjId::RETURN)
        }

        (StorClass::Var(cv1), StorClass::Var(cv2)) => {
            if cv1 != cv2
                || ctx.sh1.obj_kind(o1) != ObjKind::Region
                || ctx.sh2.obj_kind(o2) != ObjKind::Region
            {
                return Err(JoinFailed);
            }
            let dst_obj = ctx.dst.region_by_var(cv1, true);
            if !valid1 {
                ctx.dst.obj_invalidate(dst_obj);
            }
            let dst_root = ctx.dst.addr_of_region(dst_obj);
            ctx.bind(Some(r1), Some(r2), dst_root)?;
            if valid1 {
                join_uniform_blocks(ctx, o1, o2, dst_obj)?;
                join_fields(ctx, o1, o2, dst_obj, None)?;
            }
            Ok(dst_obj)
        }

        (StorClass::OnHeap, StorClass::OnHeap) => {
            let kind1 = ctx.sh1.obj_kind(o1);
            let kind2 = ctx.sh2.obj_kind(o2);

            if !valid1 {
                // a pair of deleted objects: keep one dead witness
                if ctx.sh1.obj_size(o1) != ctx.sh2.obj_size(o2) {
                    return Err(JoinFailed);
                }
                let dst_obj = ctx.dst.heap_alloc(ctx.sh1.obj_size(o1));
                ctx.dst.obj_invalidate(dst_obj);
                let dst_root = ctx.dst.addr_of_region(dst_obj);
                ctx.bind(Some(r1), Some(r2), dst_root)?;
                return Ok(dst_obj);
            }

            match (kind1, kind2) {
                (ObjKind::Region, ObjKind::Region) => {
                    pair_plain(ctx, o1, o2, ObjKind::Region, None)
                }
                (ObjKind::MayExist, ObjKind::MayExist) => {
                    let b1 = ctx.sh1.seg_binding(o1);
                    let b2 = ctx.sh2.seg_binding(o2);
                    if b1 != b2 {
                        return Err(JoinFailed);
                    }
                    pair_plain(ctx, o1, o2, ObjKind::MayExist, b1)
                }
                (ObjKind::Head | ObjKind::Part, _) | (_, ObjKind::Head | ObjKind::Part) => {
                    Err(JoinFailed)
                }
                _ => join_chain(ctx, o1, o2),
            }
        }

        _ => Err(JoinFailed),
    }
}

/// Pair two objects of the same shape one-to-one.
fn pair_plain(
    ctx: &mut JoinCtx<'_>,
    o1: ObjId,
    o2: ObjId,
    out_kind: ObjKind,
    binding: Option<BindingOff>,
) -> JResult<ObjId> {
    let size1 = ctx.sh1.obj_size(o1);
    if size1 != ctx.sh2.obj_size(o2)
        || ctx.sh1.obj_proto_level(o1) != ctx.sh2.obj_proto_level(o2)
    {
        return Err(JoinFailed);
    }

    let dst_obj = ctx.dst.heap_alloc(size1);
    if let Some(ty) = ctx.sh1.obj_estimated_type(o1) {
        if Some(ty) == ctx.sh2.obj_estimated_type(o2) {
            ctx.dst.obj_set_estimated_type(dst_obj, ty);
        }
    }
    ctx.dst
        .obj_set_proto_level(dst_obj, ctx.sh1.obj_proto_level(o1));
    if out_kind.is_abstract() {
        ctx.dst.obj_set_abstract(dst_obj, out_kind, binding);
    }

    let r1 = ctx.sh1.addr_of_region(o1);
    let r2 = ctx.sh2.addr_of_region(o2);
    let dst_root = ctx.dst.addr_of_region(dst_obj);
    ctx.bind(Some(r1), Some(r2), dst_root)?;

    join_uniform_blocks(ctx, o1, o2, dst_obj)?;
    join_fields(ctx, o1, o2, dst_obj, None)?;
    Ok(dst_obj)
}

/// Join the live fields of a paired object; a field present on one side
/// only is dropped (the side without it is the more general one).
fn join_fields(
    ctx: &mut JoinCtx<'_>,
    o1: ObjId,
    o2: ObjId,
    dst_obj: ObjId,
    exclude: Option<&BindingOff>,
) -> JResult<()> {
    let excluded = |off: u32| -> bool {
        match exclude {
            Some(b) => off == b.next || Some(off) == b.prev,
            None => false,
        }
    };

    let flds1: BTreeMap<(u32, TypeId), ValId> = ctx
        .sh1
        .gather_live_fields(o1)
        .into_iter()
        .filter(|k| !excluded(k.off))
        .filter_map(|k| ctx.sh1.peek_field(k).map(|v| ((k.off, k.ty), v)))
        .collect();
    let flds2: BTreeMap<(u32, TypeId), ValId> = ctx
        .sh2
        .gather_live_fields(o2)
        .into_iter()
        .filter(|k| !excluded(k.off))
        .filter_map(|k| ctx.sh2.peek_field(k).map(|v| ((k.off, k.ty), v)))
        .collect();

    let keys: BTreeSet<(u32, TypeId)> = flds1.keys().chain(flds2.keys()).copied().collect();
    for (off, ty) in keys {
        match (flds1.get(&(off, ty)), flds2.get(&(off, ty))) {
            (Some(&v1), Some(&v2)) => {
                let out = join_values(ctx, v1, v2)?;
                ctx.dst.write_field(
                    FieldKey {
                        obj: dst_obj,
                        off,
                        ty,
                    },
                    out,
                );
            }
            (Some(_), None) => ctx.update_status(JoinStatus::RightCovers)?,
            (None, Some(_)) => ctx.update_status(JoinStatus::LeftCovers)?,
            (None, None) => {}
        }
    }
    Ok(())
}

fn join_uniform_blocks(
    ctx: &mut JoinCtx<'_>,
    o1: ObjId,
    o2: ObjId,
    dst_obj: ObjId,
) -> JResult<()> {
    let ubs1: BTreeMap<(u32, u32), ValId> = ctx
        .sh1
        .gather_uniform_blocks(o1)
        .into_iter()
        .map(|ub| ((ub.off, ub.size), ub.tpl_value))
        .collect();
    let ubs2: BTreeMap<(u32, u32), ValId> = ctx
        .sh2
        .gather_uniform_blocks(o2)
        .into_iter()
        .map(|ub| ((ub.off, ub.size), ub.tpl_value))
        .collect();

    let keys: BTreeSet<(u32, u32)> = ubs1.keys().chain(ubs2.keys()).copied().collect();
    for (off, size) in keys {
        match (ubs1.get(&(off, size)), ubs2.get(&(off, size))) {
            (Some(&t1), Some(&t2)) => {
                let tpl = join_values(ctx, t1, t2)?;
                ctx.dst.write_uniform_block(
                    dst_obj,
                    crate::heap::UniformBlock {
                        off,
                        size,
                        tpl_value: tpl,
                    },
                );
            }
            (Some(_), None) => ctx.update_status(JoinStatus::RightCovers)?,
            (None, Some(_)) => ctx.update_status(JoinStatus::LeftCovers)?,
            (None, None) => {}
        }
    }
    Ok(())
}

// ---- chain absorption ---------------------------------------------------

/// Per-side summary of one non-link field across all absorbed nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideVal {
    Absent,
    Uniform(ValId),
    Varied,
}

struct ChainInfo {
    nodes: Vec<ObjId>,
    min: u32,
    /// Upper bound on the number of nodes the chain can stand for;
    /// saturates once a segment is absorbed.
    max: u32,
    end: ValId,
    fields: BTreeMap<(u32, TypeId), SideVal>,
    next_ty: TypeId,
    prev_of_head: Option<ValId>,
}

/// Walk one side's chain from `start` along `binding`, absorbing every
/// compatible unshared node, and summarize what the chain guarantees.
fn absorb_chain(
    sh: &SymHeap,
    start: ObjId,
    binding: &BindingOff,
    out_kind: ObjKind,
) -> JResult<ChainInfo> {
    let mut nodes = Vec::new();
    let mut min: u32 = 0;
    let mut max: u32 = 0;
    let mut fields: BTreeMap<(u32, TypeId), SideVal> = BTreeMap::new();
    let mut visited: BTreeSet<ObjId> = BTreeSet::new();
    let mut next_ty = None;
    let mut cur = start;

    let end = loop {
        let kind = sh.obj_kind(cur);
        match kind {
            ObjKind::Region => {
                min += 1;
                max = max.saturating_add(1);
            }
            ObjKind::MayExist => max = max.saturating_add(1),
            ObjKind::Sls | ObjKind::Dls => {
                // a mid-chain segment must carry the same binding
                if sh.seg_binding(cur) != Some(*binding) {
                    return Err(JoinFailed);
                }
                if (kind == ObjKind::Dls) != (out_kind == ObjKind::Dls) {
                    return Err(JoinFailed);
                }
                min += sh.seg_min_length(cur);
                max = u32::MAX;
            }
            ObjKind::Head | ObjKind::Part => return Err(JoinFailed),
        }
        if !seg::compatible_nodes(sh, start, sh, cur) {
            return Err(JoinFailed);
        }
        visited.insert(cur);

        // summarize the node's plain fields
        let mut node_fields: BTreeMap<(u32, TypeId), ValId> = BTreeMap::new();
        for key in sh.gather_live_fields(cur) {
            if key.off == binding.next || Some(key.off) == binding.prev {
                continue;
            }
            if let Some(v) = sh.peek_field(key) {
                node_fields.insert((key.off, key.ty), v);
            }
        }
        if nodes.is_empty() {
            for (k, v) in node_fields {
                fields.insert(k, SideVal::Uniform(v));
            }
        } else {
            let keys: BTreeSet<(u32, TypeId)> =
                fields.keys().chain(node_fields.keys()).copied().collect();
            for k in keys {
                let merged = match (fields.get(&k).copied(), node_fields.get(&k).copied()) {
                    (Some(SideVal::Uniform(a)), Some(b)) if a == b => SideVal::Uniform(a),
                    (None, _) | (_, None) => SideVal::Varied,
                    _ => SideVal::Varied,
                };
                fields.insert(k, merged);
            }
        }
        nodes.push(cur);

        // follow the link
        let Some(link) = seg::link_field(sh, cur, binding.next) else {
            return Err(JoinFailed);
        };
        if next_ty.is_none() {
            next_ty = Some(link.ty);
        }
        let Some(next_v) = sh.peek_field(link) else {
            return Err(JoinFailed);
        };

        if !sh.is_possible_to_deref(next_v) || sh.val_offset(next_v) != IntRange::single(0) {
            break next_v;
        }
        let tgt = sh.obj_by_addr(next_v);
        if visited.contains(&tgt)
            || !seg::compatible_nodes(sh, start, sh, tgt)
            || sh.cvar_by_object(tgt).is_some()
        {
            break next_v;
        }
        if !node_unshared(sh, tgt, binding) {
            break next_v;
        }
        if let Some(poff) = binding.prev {
            // the back-link invariant of DLS chains
            let back = seg::link_field(sh, tgt, poff).and_then(|k| sh.peek_field(k));
            if back != Some(sh.addr_of_region(cur)) {
                return Err(JoinFailed);
            }
        }

        cur = tgt;
    };

    let prev_of_head = match binding.prev {
        Some(_) => seg::prev_value(sh, start, binding),
        None => None,
    };

    Ok(ChainInfo {
        nodes,
        min,
        max,
        end,
        fields,
        next_ty: next_ty.ok_or(JoinFailed)?,
        prev_of_head,
    })
}

/// A chain-interior node may only be referenced through the chain links.
fn node_unshared(sh: &SymHeap, o: ObjId, binding: &BindingOff) -> bool {
    sh.pointed_by(o)
        .iter()
        .all(|k| k.off == binding.next || Some(k.off) == binding.prev)
}

/// Fold both sides' chains into a single output segment.
fn join_chain(ctx: &mut JoinCtx<'_>, o1: ObjId, o2: ObjId) -> JResult<ObjId> {
    let b1 = match ctx.sh1.obj_kind(o1) {
        ObjKind::Sls | ObjKind::Dls | ObjKind::MayExist => ctx.sh1.seg_binding(o1),
        _ => None,
    };
    let b2 = match ctx.sh2.obj_kind(o2) {
        ObjKind::Sls | ObjKind::Dls | ObjKind::MayExist => ctx.sh2.seg_binding(o2),
        _ => None,
    };
    let binding = match (b1, b2) {
        (Some(a), Some(b)) => {
            if a != b {
                return Err(JoinFailed);
            }
            a
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => {
            match seg::discover_binding(ctx.sh1, o1).or_else(|| seg::discover_binding(ctx.sh2, o2))
            {
                Some(b) => b,
                None => {
                    // no links anywhere: a scalar may-exist absorbs a
                    // plain region without any chain walking
                    let k1 = ctx.sh1.obj_kind(o1);
                    let k2 = ctx.sh2.obj_kind(o2);
                    if ctx.sh1.gather_live_pointers(o1).is_empty()
                        && ctx.sh2.gather_live_pointers(o2).is_empty()
                    {
                        if k1 == ObjKind::MayExist && k2 == ObjKind::Region {
                            ctx.update_status(JoinStatus::LeftCovers)?;
                            return pair_plain(ctx, o1, o2, ObjKind::MayExist, None);
                        }
                        if k1 == ObjKind::Region && k2 == ObjKind::MayExist {
                            ctx.update_status(JoinStatus::RightCovers)?;
                            return pair_plain(ctx, o1, o2, ObjKind::MayExist, None);
                        }
                    }
                    return Err(JoinFailed);
                }
            }
        }
    };
    let mut out_kind = if binding.prev.is_some() {
        ObjKind::Dls
    } else {
        ObjKind::Sls
    };

    let chain1 = absorb_chain(ctx.sh1, o1, &binding, out_kind)?;
    let chain2 = absorb_chain(ctx.sh2, o2, &binding, out_kind)?;
    if chain1.next_ty != chain2.next_ty {
        return Err(JoinFailed);
    }
    let out_min = chain1.min.min(chain2.min);

    // when neither side can exceed one node, a may-exist is enough; a
    // segment here would over-widen and break join monotonicity
    let k1 = ctx.sh1.obj_kind(o1);
    let k2 = ctx.sh2.obj_kind(o2);
    if chain1.max <= 1
        && chain2.max <= 1
        && (k1 == ObjKind::MayExist || k2 == ObjKind::MayExist)
        && out_kind == ObjKind::Sls
    {
        out_kind = ObjKind::MayExist;
    }

    debug!(
        nodes1 = chain1.nodes.len(),
        nodes2 = chain2.nodes.len(),
        out_min,
        ?out_kind,
        "folding chains into a segment"
    );

    // exactness: a side consisting of exactly the output segment
    let exact = |sh: &SymHeap, start: ObjId, chain: &ChainInfo| -> bool {
        chain.nodes.len() == 1 && sh.obj_kind(start) == out_kind && chain.min == out_min
    };
    let exact1 = exact(ctx.sh1, o1, &chain1);
    let exact2 = exact(ctx.sh2, o2, &chain2);
    match (exact1, exact2) {
        (true, true) => {}
        (true, false) => ctx.update_status(JoinStatus::LeftCovers)?,
        (false, true) => ctx.update_status(JoinStatus::RightCovers)?,
        (false, false) => ctx.update_status(JoinStatus::ThreeWay)?,
    }

    // materialize the output segment
    let size = ctx.sh1.obj_size(o1);
    if size != ctx.sh2.obj_size(o2) {
        return Err(JoinFailed);
    }
    let dst_obj = ctx.dst.heap_alloc(size);
    let et1 = ctx.sh1.obj_estimated_type(o1);
    if et1.is_some() && et1 == ctx.sh2.obj_estimated_type(o2) {
        if let Some(ty) = et1 {
            ctx.dst.obj_set_estimated_type(dst_obj, ty);
        }
    }
    ctx.dst
        .obj_set_proto_level(dst_obj, ctx.sh1.obj_proto_level(o1));
    ctx.dst.obj_set_abstract(dst_obj, out_kind, Some(binding));
    ctx.dst.seg_set_min_length(dst_obj, out_min);

    let dst_root = ctx.dst.addr_of_region(dst_obj);
    for &node in &chain1.nodes {
        let r = ctx.sh1.addr_of_region(node);
        ctx.bind(Some(r), None, dst_root)?;
    }
    for &node in &chain2.nodes {
        let r = ctx.sh2.addr_of_region(node);
        ctx.bind(None, Some(r), dst_root)?;
    }

    // plain fields: the summaries of both sides joined
    let keys: BTreeSet<(u32, TypeId)> = chain1
        .fields
        .keys()
        .chain(chain2.fields.keys())
        .copied()
        .collect();
    for (off, ty) in keys {
        let s1 = chain1.fields.get(&(off, ty)).copied().unwrap_or(SideVal::Absent);
        let s2 = chain2.fields.get(&(off, ty)).copied().unwrap_or(SideVal::Absent);
        let out_v = match (s1, s2) {
            (SideVal::Absent, SideVal::Absent) => continue,
            (SideVal::Absent, _) => {
                ctx.update_status(JoinStatus::LeftCovers)?;
                continue;
            }
            (_, SideVal::Absent) => {
                ctx.update_status(JoinStatus::RightCovers)?;
                continue;
            }
            (SideVal::Uniform(a), SideVal::Uniform(b)) => join_values(ctx, a, b)?,
            (SideVal::Varied, SideVal::Uniform(b)) => {
                match ctx.sh2.val_target(b) {
                    ValTarget::Unknown(_) => ctx.update_status(JoinStatus::RightCovers)?,
                    _ => ctx.update_status(JoinStatus::ThreeWay)?,
                }
                ctx.dst.val_create_unknown(ValOrigin::UnknownResult)
            }
            (SideVal::Uniform(a), SideVal::Varied) => {
                match ctx.sh1.val_target(a) {
                    ValTarget::Unknown(_) => ctx.update_status(JoinStatus::LeftCovers)?,
                    _ => ctx.update_status(JoinStatus::ThreeWay)?,
                }
                ctx.dst.val_create_unknown(ValOrigin::UnknownResult)
            }
            (SideVal::Varied, SideVal::Varied) => {
                ctx.update_status(JoinStatus::ThreeWay)?;
                ctx.dst.val_create_unknown(ValOrigin::UnknownResult)
            }
        };
        ctx.dst.write_field(
            FieldKey {
                obj: dst_obj,
                off,
                ty,
            },
            out_v,
        );
    }

    // the outgoing link continues the simultaneous walk
    let out_end = join_values(ctx, chain1.end, chain2.end)?;
    ctx.dst.write_field(
        FieldKey {
            obj: dst_obj,
            off: binding.next,
            ty: chain1.next_ty,
        },
        out_end,
    );

    if let Some(poff) = binding.prev {
        match (chain1.prev_of_head, chain2.prev_of_head) {
            (Some(p1), Some(p2)) => {
                let out_prev = join_values(ctx, p1, p2)?;
                ctx.dst.write_field(
                    FieldKey {
                        obj: dst_obj,
                        off: poff,
                        ty: chain1.next_ty,
                    },
                    out_prev,
                );
            }
            (Some(_), None) => ctx.update_status(JoinStatus::RightCovers)?,
            (None, Some(_)) => ctx.update_status(JoinStatus::LeftCovers)?,
            (None, None) => {}
        }
    }

    Ok(dst_obj)
}

// ---- predicates ---------------------------------------------------------

fn join_preds(ctx: &mut JoinCtx<'_>) -> JResult<()> {
    let translate = |sh: &SymHeap, map: &BTreeMap<ValId, ValId>| {
        let mut out = BTreeSet::new();
        for p in sh.preds() {
            if let (Some(&x), Some(&y)) = (map.get(&p.v1), map.get(&p.v2)) {
                let (x, y) = if x <= y { (x, y) } else { (y, x) };
                out.insert((p.kind, x, y, p.k));
            }
        }
        out
    };

    let s1 = translate(ctx.sh1, &ctx.map1);
    let s2 = translate(ctx.sh2, &ctx.map2);

    for &(kind, x, y, k) in s1.intersection(&s2) {
        ctx.dst.add_pred(kind, x, y, k);
    }
    if s1.difference(&s2).next().is_some() {
        // sh1 constrains more, so sh2 is the wider side
        ctx.update_status(JoinStatus::RightCovers)?;
    }
    if s2.difference(&s1).next().is_some() {
        ctx.update_status(JoinStatus::LeftCovers)?;
    }
    Ok(())
}

// ---- entry point --------------------------------------------------------

fn join_core(ctx: &mut JoinCtx<'_>) -> JResult<()> {
    let vars1: BTreeSet<_> = ctx.sh1.gather_program_vars().into_iter().collect();
    let vars2: BTreeSet<_> = ctx.sh2.gather_program_vars().into_iter().collect();
    if vars1 != vars2 {
        return Err(JoinFailed);
    }

    for cv in vars1 {
        let (Some(o1), Some(o2)) = (ctx.sh1.var_object(cv), ctx.sh2.var_object(cv)) else {
            return Err(JoinFailed);
        };
        join_objects(ctx, o1, o2)?;
    }

    let ret1 = ctx.sh1.obj_estimated_type(ObjId::RETURN);
    let ret2 = ctx.sh2.obj_estimated_type(ObjId::RETURN);
    match (ret1, ret2) {
        (None, None) => {}
        (Some(t1), Some(t2)) if t1 == t2 => {
            ctx.dst.obj_set_estimated_type(ObjId::RETURN, t1);
            ctx.bind(Some(ValId::ADDR_OF_RET), Some(ValId::ADDR_OF_RET), ValId::ADDR_OF_RET)?;
            join_fields(ctx, ObjId::RETURN, ObjId::RETURN, ObjId::RETURN, None)?;
        }
        _ => return Err(JoinFailed),
    }

    join_preds(ctx)
}

/// Join two heaps over the same program. `None` when the shapes are
/// irreconcilable (the caller keeps both heaps); otherwise the joined heap
/// with the relation of the inputs, its trace node carrying one id-mapper
/// per input.
pub fn join_sym_heaps(
    tg: &mut TraceGraph,
    sh1: &SymHeap,
    sh2: &SymHeap,
    allow_three_way: bool,
) -> Option<JoinResult> {
    debug_assert!(std::sync::Arc::ptr_eq(sh1.stor(), sh2.stor()));

    let trace = tg.transient("join_sym_heaps");
    let mut ctx = JoinCtx {
        sh1,
        sh2,
        dst: SymHeap::new(sh1.stor().clone(), trace),
        pair_cache: BTreeMap::new(),
        one1: BTreeMap::new(),
        one2: BTreeMap::new(),
        map1: BTreeMap::new(),
        map2: BTreeMap::new(),
        status: JoinStatus::Equal,
        allow_three_way,
    };

    if join_core(&mut ctx).is_err() {
        return None;
    }

    let mut m1 = IdMapper::new();
    for (&from, &to) in &ctx.map1 {
        m1.insert(from, to);
    }
    let mut m2 = IdMapper::new();
    for (&from, &to) in &ctx.map2 {
        m2.insert(from, to);
    }
    let node = tg.join_node(sh1.trace(), sh2.trace(), m1, m2);

    let mut heap = ctx.dst;
    heap.set_trace(node);
    heap.set_generation(sh1.generation().max(sh2.generation()));

    debug!(status = ?ctx.status, "join succeeded");
    Some(JoinResult {
        status: ctx.status,
        heap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmp::are_equal;
    use crate::heap::CVar;
    use crate::trace::TraceId;
    use shale_ir::{ProgramBuilder, TypeItem, VarId};
    use std::sync::Arc;

    struct Fixture {
        stor: Arc<shale_ir::Storage>,
        node_ptr: TypeId,
        i64t: TypeId,
        p: VarId,
        x: VarId,
    }

    /// struct node { node *next; long data; };  node *p;  long x;
    fn fixture() -> Fixture {
        let mut pb = ProgramBuilder::new();
        let void = pb.types().void();
        let i64t = pb.types().int(8);
        let fwd = pb.types().strukt(vec![]);
        let fwd_ptr = pb.types().ptr(fwd);
        let node = pb.types().strukt(vec![
            TypeItem {
                name: Some("next".into()),
                ty: fwd_ptr,
                offset: 0,
            },
            TypeItem {
                name: Some("data".into()),
                ty: i64t,
                offset: 8,
            },
        ]);
        let node_ptr = pb.types().ptr(node);
        let mut f = pb.fnc("f", void);
        let p = f.local("p", node_ptr);
        let x = f.local("x", i64t);
        f.block("entry");
        f.ret(None);
        f.finish();
        Fixture {
            stor: Arc::new(pb.build()),
            node_ptr,
            i64t,
            p,
            x,
        }
    }

    fn mk(fx: &Fixture) -> SymHeap {
        let mut sh = SymHeap::new(fx.stor.clone(), TraceId(0));
        sh.region_by_var(CVar::new(fx.p, 0), true);
        sh.region_by_var(CVar::new(fx.x, 0), true);
        sh
    }

    fn set_p(fx: &Fixture, sh: &mut SymHeap, v: ValId) {
        let reg = sh.region_by_var(CVar::new(fx.p, 0), true);
        sh.write_field(
            FieldKey {
                obj: reg,
                off: 0,
                ty: fx.node_ptr,
            },
            v,
        );
    }

    fn set_x(fx: &Fixture, sh: &mut SymHeap, v: ValId) {
        let reg = sh.region_by_var(CVar::new(fx.x, 0), true);
        sh.write_field(
            FieldKey {
                obj: reg,
                off: 0,
                ty: fx.i64t,
            },
            v,
        );
    }

    /// Allocate one list node with an unknown payload.
    fn mk_node(fx: &Fixture, sh: &mut SymHeap) -> ObjId {
        let node = sh.heap_alloc(IntRange::single(16));
        let data = sh.val_create_unknown(ValOrigin::Heap);
        sh.write_field(
            FieldKey {
                obj: node,
                off: 8,
                ty: fx.i64t,
            },
            data,
        );
        node
    }

    fn set_next(fx: &Fixture, sh: &mut SymHeap, node: ObjId, v: ValId) {
        sh.write_field(
            FieldKey {
                obj: node,
                off: 0,
                ty: fx.node_ptr,
            },
            v,
        );
    }

    fn sls_binding() -> BindingOff {
        BindingOff {
            next: 0,
            prev: None,
            head: 0,
        }
    }

    #[test]
    fn identical_heaps_join_as_equal() {
        let fx = fixture();
        let mut tg = TraceGraph::new();

        let mut h1 = mk(&fx);
        set_p(&fx, &mut h1, ValId::NULL);
        let five = h1.val_wrap_custom(CustomValue::Int(5));
        set_x(&fx, &mut h1, five);

        let mut h2 = mk(&fx);
        set_p(&fx, &mut h2, ValId::NULL);
        let five = h2.val_wrap_custom(CustomValue::Int(5));
        set_x(&fx, &mut h2, five);

        let res = join_sym_heaps(&mut tg, &h1, &h2, true).unwrap();
        assert_eq!(res.status, JoinStatus::Equal);
        assert!(are_equal(&res.heap, &h1));
        assert!(are_equal(&res.heap, &h2));
    }

    #[test]
    fn unknown_side_covers_known_side() {
        let fx = fixture();
        let mut tg = TraceGraph::new();

        let mut h1 = mk(&fx);
        set_p(&fx, &mut h1, ValId::NULL);
        let u = h1.val_create_unknown(ValOrigin::UninitStack);
        set_x(&fx, &mut h1, u);

        let mut h2 = mk(&fx);
        set_p(&fx, &mut h2, ValId::NULL);
        let five = h2.val_wrap_custom(CustomValue::Int(5));
        set_x(&fx, &mut h2, five);

        // entailment needs no widening permission
        let res = join_sym_heaps(&mut tg, &h1, &h2, false).unwrap();
        assert_eq!(res.status, JoinStatus::LeftCovers);

        let res = join_sym_heaps(&mut tg, &h2, &h1, false).unwrap();
        assert_eq!(res.status, JoinStatus::RightCovers);
    }

    #[test]
    fn null_vs_single_node_widens_to_may_exist() {
        let fx = fixture();
        let mut tg = TraceGraph::new();

        let mut h1 = mk(&fx);
        set_p(&fx, &mut h1, ValId::NULL);

        let mut h2 = mk(&fx);
        let node = mk_node(&fx, &mut h2);
        set_next(&fx, &mut h2, node, ValId::NULL);
        let addr = h2.addr_of_region(node);
        set_p(&fx, &mut h2, addr);

        // widening disabled: the attempt must abort
        assert!(join_sym_heaps(&mut tg, &h1, &h2, false).is_none());

        let res = join_sym_heaps(&mut tg, &h1, &h2, true).unwrap();
        assert_eq!(res.status, JoinStatus::ThreeWay);

        let reg = res.heap.var_object(CVar::new(fx.p, 0)).unwrap();
        let held = res
            .heap
            .peek_field(FieldKey {
                obj: reg,
                off: 0,
                ty: fx.node_ptr,
            })
            .unwrap();
        let m = res.heap.obj_by_addr(held);
        assert_eq!(res.heap.obj_kind(m), ObjKind::MayExist);

        // mirrored arguments give the mirrored status
        let res_rev = join_sym_heaps(&mut tg, &h2, &h1, true).unwrap();
        assert_eq!(res_rev.status, res.status.swapped());
    }

    #[test]
    fn segment_covers_concrete_chain_prefix() {
        let fx = fixture();
        let mut tg = TraceGraph::new();

        // h1: p -> SLS(min 0) -> null
        let mut h1 = mk(&fx);
        let seg = mk_node(&fx, &mut h1);
        h1.obj_set_abstract(seg, ObjKind::Sls, Some(sls_binding()));
        set_next(&fx, &mut h1, seg, ValId::NULL);
        let addr = h1.addr_of_region(seg);
        set_p(&fx, &mut h1, addr);

        // h2: p -> node -> SLS(min 0) -> null
        let mut h2 = mk(&fx);
        let node = mk_node(&fx, &mut h2);
        let seg2 = mk_node(&fx, &mut h2);
        h2.obj_set_abstract(seg2, ObjKind::Sls, Some(sls_binding()));
        set_next(&fx, &mut h2, seg2, ValId::NULL);
        let seg2_addr = h2.addr_of_region(seg2);
        set_next(&fx, &mut h2, node, seg2_addr);
        let node_addr = h2.addr_of_region(node);
        set_p(&fx, &mut h2, node_addr);

        let res = join_sym_heaps(&mut tg, &h1, &h2, true).unwrap();
        assert_eq!(res.status, JoinStatus::LeftCovers);

        let reg = res.heap.var_object(CVar::new(fx.p, 0)).unwrap();
        let held = res
            .heap
            .peek_field(FieldKey {
                obj: reg,
                off: 0,
                ty: fx.node_ptr,
            })
            .unwrap();
        let out_seg = res.heap.obj_by_addr(held);
        assert_eq!(res.heap.obj_kind(out_seg), ObjKind::Sls);
        assert_eq!(res.heap.seg_min_length(out_seg), 0);

        let res_rev = join_sym_heaps(&mut tg, &h2, &h1, true).unwrap();
        assert_eq!(res_rev.status, JoinStatus::RightCovers);
    }

    #[test]
    fn three_way_join_is_monotonic() {
        let fx = fixture();
        let mut tg = TraceGraph::new();

        let mut h1 = mk(&fx);
        set_p(&fx, &mut h1, ValId::NULL);

        let mut h2 = mk(&fx);
        let node = mk_node(&fx, &mut h2);
        set_next(&fx, &mut h2, node, ValId::NULL);
        let addr = h2.addr_of_region(node);
        set_p(&fx, &mut h2, addr);

        let wide = join_sym_heaps(&mut tg, &h1, &h2, true).unwrap();
        assert_eq!(wide.status, JoinStatus::ThreeWay);

        // the widened heap subsumes both of its inputs
        let back1 = join_sym_heaps(&mut tg, &wide.heap, &h1, true).unwrap();
        assert_eq!(back1.status, JoinStatus::LeftCovers);
        let back2 = join_sym_heaps(&mut tg, &wide.heap, &h2, true).unwrap();
        assert_eq!(back2.status, JoinStatus::LeftCovers);
    }

    #[test]
    fn dls_back_link_violation_aborts() {
        let fx = fixture();
        let mut tg = TraceGraph::new();
        let dls_binding = BindingOff {
            next: 0,
            prev: Some(8),
            head: 0,
        };

        // h1: p -> DLS(min 0), both links null
        let mut h1 = mk(&fx);
        let seg = h1.heap_alloc(IntRange::single(16));
        h1.obj_set_abstract(seg, ObjKind::Dls, Some(dls_binding));
        set_next(&fx, &mut h1, seg, ValId::NULL);
        h1.write_field(
            FieldKey {
                obj: seg,
                off: 8,
                ty: fx.node_ptr,
            },
            ValId::NULL,
        );
        let addr = h1.addr_of_region(seg);
        set_p(&fx, &mut h1, addr);

        // h2: a -> b, but b's back link does not aim at a
        let mut h2 = mk(&fx);
        let a = h2.heap_alloc(IntRange::single(16));
        let b = h2.heap_alloc(IntRange::single(16));
        let addr_b = h2.addr_of_region(b);
        set_next(&fx, &mut h2, a, addr_b);
        h2.write_field(
            FieldKey {
                obj: a,
                off: 8,
                ty: fx.node_ptr,
            },
            ValId::NULL,
        );
        set_next(&fx, &mut h2, b, ValId::NULL);
        h2.write_field(
            FieldKey {
                obj: b,
                off: 8,
                ty: fx.node_ptr,
            },
            ValId::NULL,
        );
        let addr_a = h2.addr_of_region(a);
        set_p(&fx, &mut h2, addr_a);

        assert!(join_sym_heaps(&mut tg, &h1, &h2, true).is_none());
    }

    #[test]
    fn valid_vs_freed_object_cannot_join() {
        let fx = fixture();
        let mut tg = TraceGraph::new();

        let mut h1 = mk(&fx);
        let live = mk_node(&fx, &mut h1);
        set_next(&fx, &mut h1, live, ValId::NULL);
        let addr = h1.addr_of_region(live);
        set_p(&fx, &mut h1, addr);

        let mut h2 = mk(&fx);
        let dead = mk_node(&fx, &mut h2);
        let addr = h2.addr_of_region(dead);
        set_p(&fx, &mut h2, addr);
        h2.obj_invalidate(dead);

        assert!(join_sym_heaps(&mut tg, &h1, &h2, true).is_none());
    }
}
