//! Symbolic heap: the abstract state of memory at one program point
//!
//! A heap is a graph of *objects* (allocation regions, possibly abstract
//! list segments), *values* (abstract addresses and data) and *fields*
//! (typed cells within objects holding values), plus a set of predicates
//! over values. Objects and values are arena slots addressed by copyable
//! ids, so cloning a heap is a plain arena copy and identity survives the
//! clone.
//!
//! A few ids are reserved in every heap and always map to themselves across
//! heaps: the invalid object, the return-slot object, the null address, the
//! address of the return slot and the invalid value.

use crate::trace::TraceId;
use shale_ir::{Storage, TypeCode, TypeId, VarId};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Index of an object within one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(pub u32);

impl ObjId {
    /// Landing pad for dereferences that cannot hit a real object.
    pub const INVALID: ObjId = ObjId(0);
    /// The function's return slot.
    pub const RETURN: ObjId = ObjId(1);

    pub fn is_special(self) -> bool {
        self.0 <= Self::RETURN.0
    }
}

/// Index of a value within one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValId(pub u32);

impl ValId {
    /// The unique null address.
    pub const NULL: ValId = ValId(0);
    /// Address of [`ObjId::RETURN`].
    pub const ADDR_OF_RET: ValId = ValId(1);
    /// Address of [`ObjId::INVALID`].
    pub const INVALID: ValId = ValId(2);

    pub fn is_special(self) -> bool {
        self.0 <= Self::INVALID.0
    }
}

/// A closed integer interval, used for sizes and address offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntRange {
    pub lo: i64,
    pub hi: i64,
}

impl IntRange {
    pub fn single(n: i64) -> Self {
        IntRange { lo: n, hi: n }
    }

    pub fn new(lo: i64, hi: i64) -> Self {
        debug_assert!(lo <= hi);
        IntRange { lo, hi }
    }

    pub fn is_single(&self) -> bool {
        self.lo == self.hi
    }

    /// Smallest interval covering both.
    pub fn hull(&self, other: &IntRange) -> IntRange {
        IntRange {
            lo: self.lo.min(other.lo),
            hi: self.hi.max(other.hi),
        }
    }

    pub fn shifted(&self, by: i64) -> IntRange {
        IntRange {
            lo: self.lo + by,
            hi: self.hi + by,
        }
    }

    pub fn contains(&self, n: i64) -> bool {
        self.lo <= n && n <= self.hi
    }
}

/// A program variable instance: variable id plus a nesting instance,
/// distinguishing frames of recursive calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CVar {
    pub uid: VarId,
    pub inst: u32,
}

impl CVar {
    pub fn new(uid: VarId, inst: u32) -> Self {
        CVar { uid, inst }
    }
}

/// Kind of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    /// A concrete allocation region.
    Region,
    /// Singly-linked list segment.
    Sls,
    /// Doubly-linked list segment.
    Dls,
    /// An object that may or may not exist (zero or one instance).
    MayExist,
    /// Head node of a nested structure.
    Head,
    /// Interior part of a composite object.
    Part,
}

impl ObjKind {
    pub fn is_abstract(self) -> bool {
        !matches!(self, ObjKind::Region)
    }

    pub fn is_segment(self) -> bool {
        matches!(self, ObjKind::Sls | ObjKind::Dls)
    }
}

/// Byte offsets binding a segment's nodes together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingOff {
    /// Offset of the `next` pointer within a node.
    pub next: u32,
    /// Offset of the `prev` pointer; present only for DLS.
    pub prev: Option<u32>,
    /// Offset within the successor node the link points at.
    pub head: u32,
}

/// Storage class of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorClass {
    /// Backing store of a program variable.
    Var(CVar),
    /// Dynamically allocated.
    OnHeap,
    /// The function's return slot.
    Return,
    /// The reserved invalid object.
    Invalid,
}

/// Where an unknown value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValOrigin {
    /// Read of a never-written stack cell.
    UninitStack,
    /// Read of a never-written heap cell.
    Heap,
    /// Read through a deleted object.
    Deleted,
    /// Result of an operation the analyzer does not model.
    UnknownResult,
}

/// An interned constant that is not an address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum CustomValue {
    Int(i64),
    Str(String),
    Fnc(shale_ir::FncId),
}

/// Target classification of a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValTarget {
    /// The null address.
    Null,
    /// Address of data: an object plus a byte offset (possibly a range).
    AddrOf { obj: ObjId, off: IntRange },
    /// An interned constant.
    Custom(CustomValue),
    /// Unknown value with an origin tag.
    Unknown(ValOrigin),
    /// The reserved invalid value.
    Invalid,
}

impl ValTarget {
    pub fn is_address(&self) -> bool {
        matches!(self, ValTarget::AddrOf { .. })
    }
}

/// Identity of a field: object, byte offset, type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FieldKey {
    pub obj: ObjId,
    pub off: u32,
    pub ty: TypeId,
}

/// A byte range of an object tiled with one default value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBlock {
    pub off: u32,
    pub size: u32,
    pub tpl_value: ValId,
}

impl UniformBlock {
    fn covers(&self, off: u32, size: u32) -> bool {
        self.off <= off && off + size <= self.off + self.size
    }
}

/// Kind of a predicate over two values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PredKind {
    Equal,
    NotEqual,
    /// `v1 + k < v2` over offsets into the same object.
    LessByOffset,
    /// `v1 + k != v2` over offsets into the same object.
    NeqOffset,
}

impl PredKind {
    fn is_symmetric(self) -> bool {
        matches!(self, PredKind::Equal | PredKind::NotEqual)
    }
}

/// A constraint over two values that is not representable as an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pred {
    pub kind: PredKind,
    pub v1: ValId,
    pub v2: ValId,
    pub k: i64,
}

#[derive(Debug, Clone)]
struct ObjData {
    kind: ObjKind,
    size: IntRange,
    valid: bool,
    stor: StorClass,
    est_type: Option<TypeId>,
    proto_level: u32,
    binding: Option<BindingOff>,
    min_len: u32,
    addr: ValId,
}

#[derive(Debug, Clone)]
struct ValData {
    target: ValTarget,
}

/// The symbolic heap.
#[derive(Debug, Clone)]
pub struct SymHeap {
    stor: Arc<Storage>,
    objs: Vec<ObjData>,
    vals: Vec<ValData>,
    fields: BTreeMap<FieldKey, ValId>,
    uni_blocks: BTreeMap<(ObjId, u32), UniformBlock>,
    preds: BTreeSet<Pred>,
    var_index: BTreeMap<CVar, ObjId>,
    addr_index: BTreeMap<(ObjId, IntRange), ValId>,
    custom_index: BTreeMap<CustomValue, ValId>,
    used_by: BTreeMap<ValId, BTreeSet<FieldKey>>,
    addrs_of: BTreeMap<ObjId, BTreeSet<ValId>>,
    trace: TraceId,
    generation: u32,
}

impl SymHeap {
    pub fn new(stor: Arc<Storage>, trace: TraceId) -> Self {
        let mut sh = SymHeap {
            stor,
            objs: Vec::new(),
            vals: Vec::new(),
            fields: BTreeMap::new(),
            uni_blocks: BTreeMap::new(),
            preds: BTreeSet::new(),
            var_index: BTreeMap::new(),
            addr_index: BTreeMap::new(),
            custom_index: BTreeMap::new(),
            used_by: BTreeMap::new(),
            addrs_of: BTreeMap::new(),
            trace,
            generation: 0,
        };

        // reserved values
        sh.vals.push(ValData {
            target: ValTarget::Null,
        });
        sh.vals.push(ValData {
            target: ValTarget::AddrOf {
                obj: ObjId::RETURN,
                off: IntRange::single(0),
            },
        });
        sh.vals.push(ValData {
            target: ValTarget::Invalid,
        });

        // reserved objects
        sh.objs.push(ObjData {
            kind: ObjKind::Region,
            size: IntRange::single(0),
            valid: false,
            stor: StorClass::Invalid,
            est_type: None,
            proto_level: 0,
            binding: None,
            min_len: 0,
            addr: ValId::INVALID,
        });
        sh.objs.push(ObjData {
            kind: ObjKind::Region,
            size: IntRange::single(0),
            valid: true,
            stor: StorClass::Return,
            est_type: None,
            proto_level: 0,
            binding: None,
            min_len: 0,
            addr: ValId::ADDR_OF_RET,
        });

        sh.addr_index
            .insert((ObjId::RETURN, IntRange::single(0)), ValId::ADDR_OF_RET);
        sh.addrs_of
            .entry(ObjId::RETURN)
            .or_default()
            .insert(ValId::ADDR_OF_RET);

        sh
    }

    pub fn stor(&self) -> &Arc<Storage> {
        &self.stor
    }

    pub fn trace(&self) -> TraceId {
        self.trace
    }

    pub fn set_trace(&mut self, trace: TraceId) {
        self.trace = trace;
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn bump_generation(&mut self) {
        self.generation += 1;
    }

    pub fn set_generation(&mut self, generation: u32) {
        self.generation = generation;
    }

    pub fn cnt_objs(&self) -> usize {
        self.objs.len()
    }

    pub fn cnt_vals(&self) -> usize {
        self.vals.len()
    }

    // ---- read-only object/value queries --------------------------------

    /// Object a value points into; [`ObjId::INVALID`] for non-addresses.
    pub fn obj_by_addr(&self, v: ValId) -> ObjId {
        match &self.val(v).target {
            ValTarget::AddrOf { obj, .. } => *obj,
            _ => ObjId::INVALID,
        }
    }

    /// Base address of an object.
    pub fn addr_of_region(&self, o: ObjId) -> ValId {
        self.obj(o).addr
    }

    /// Byte offset of an address value from the root of its object.
    pub fn val_offset(&self, v: ValId) -> IntRange {
        match &self.val(v).target {
            ValTarget::AddrOf { off, .. } => *off,
            _ => IntRange::single(0),
        }
    }

    /// Canonicalize an address to the base address of its object;
    /// non-addresses canonicalize to themselves.
    pub fn val_root(&self, v: ValId) -> ValId {
        match &self.val(v).target {
            ValTarget::AddrOf { obj, .. } => self.obj(*obj).addr,
            _ => v,
        }
    }

    pub fn val_target(&self, v: ValId) -> &ValTarget {
        &self.val(v).target
    }

    pub fn val_origin(&self, v: ValId) -> Option<ValOrigin> {
        match &self.val(v).target {
            ValTarget::Unknown(origin) => Some(*origin),
            _ => None,
        }
    }

    pub fn obj_size(&self, o: ObjId) -> IntRange {
        self.obj(o).size
    }

    pub fn obj_kind(&self, o: ObjId) -> ObjKind {
        self.obj(o).kind
    }

    pub fn obj_proto_level(&self, o: ObjId) -> u32 {
        self.obj(o).proto_level
    }

    pub fn obj_estimated_type(&self, o: ObjId) -> Option<TypeId> {
        self.obj(o).est_type
    }

    pub fn obj_stor_class(&self, o: ObjId) -> StorClass {
        self.obj(o).stor
    }

    pub fn seg_binding(&self, o: ObjId) -> Option<BindingOff> {
        self.obj(o).binding
    }

    pub fn seg_min_length(&self, o: ObjId) -> u32 {
        self.obj(o).min_len
    }

    pub fn is_valid(&self, o: ObjId) -> bool {
        self.obj(o).valid
    }

    /// The program variable an object backs, if any.
    pub fn cvar_by_object(&self, o: ObjId) -> Option<CVar> {
        match self.obj(o).stor {
            StorClass::Var(cv) => Some(cv),
            _ => None,
        }
    }

    /// Program variables with a live (bound) object in this heap.
    pub fn gather_program_vars(&self) -> Vec<CVar> {
        self.var_index.keys().copied().collect()
    }

    /// The object bound to a program variable, without creating one.
    pub fn var_object(&self, cv: CVar) -> Option<ObjId> {
        self.var_index.get(&cv).copied()
    }

    /// True when dereferencing `v` lands on real data.
    pub fn is_possible_to_deref(&self, v: ValId) -> bool {
        match &self.val(v).target {
            ValTarget::AddrOf { obj, .. } => *obj != ObjId::INVALID && self.obj(*obj).valid,
            _ => false,
        }
    }

    // ---- field enumeration ---------------------------------------------

    /// All written fields of one object, in (offset, type) order.
    pub fn gather_live_fields(&self, o: ObjId) -> Vec<FieldKey> {
        self.fields_of(o).collect()
    }

    /// Written fields of one object whose type is a pointer.
    pub fn gather_live_pointers(&self, o: ObjId) -> Vec<FieldKey> {
        self.fields_of(o)
            .filter(|k| self.stor.types.get(k.ty).code == TypeCode::Ptr)
            .collect()
    }

    pub fn gather_uniform_blocks(&self, o: ObjId) -> Vec<UniformBlock> {
        self.uni_blocks
            .range((o, 0)..=(o, u32::MAX))
            .map(|(_, ub)| *ub)
            .collect()
    }

    /// Value stored in a field, if the field was ever written.
    pub fn peek_field(&self, key: FieldKey) -> Option<ValId> {
        self.fields.get(&key).copied()
    }

    /// Fields of any object currently holding the value `v`.
    pub fn used_by(&self, v: ValId) -> Vec<FieldKey> {
        self.used_by
            .get(&v)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fields of any object holding an address into `o` (at any offset).
    pub fn pointed_by(&self, o: ObjId) -> Vec<FieldKey> {
        let mut dst = Vec::new();
        if let Some(addrs) = self.addrs_of.get(&o) {
            for &addr in addrs {
                if let Some(set) = self.used_by.get(&addr) {
                    dst.extend(set.iter().copied());
                }
            }
        }
        dst.sort();
        dst.dedup();
        dst
    }

    // ---- predicates ----------------------------------------------------

    pub fn add_pred(&mut self, kind: PredKind, v1: ValId, v2: ValId, k: i64) {
        let (v1, v2) = if kind.is_symmetric() && v2 < v1 {
            (v2, v1)
        } else {
            (v1, v2)
        };
        if kind == PredKind::Equal && v1 == v2 {
            // reflexivity is implicit
            return;
        }
        self.preds.insert(Pred { kind, v1, v2, k });
    }

    pub fn chk_pred(&self, kind: PredKind, v1: ValId, v2: ValId, k: i64) -> bool {
        let (v1, v2) = if kind.is_symmetric() && v2 < v1 {
            (v2, v1)
        } else {
            (v1, v2)
        };
        if kind == PredKind::Equal && v1 == v2 {
            return true;
        }
        self.preds.contains(&Pred { kind, v1, v2, k })
    }

    pub fn preds(&self) -> impl Iterator<Item = &Pred> {
        self.preds.iter()
    }

    /// False when the predicate set is self-contradictory.
    pub fn is_feasible(&self) -> bool {
        for p in &self.preds {
            if p.kind == PredKind::Equal {
                let flipped = Pred {
                    kind: PredKind::NotEqual,
                    ..*p
                };
                if self.preds.contains(&flipped) {
                    return false;
                }
            }
            if p.kind == PredKind::NotEqual && p.v1 == p.v2 {
                return false;
            }
        }
        true
    }

    /// Copy every predicate whose operands both appear in `val_map` into
    /// `dst`, translated through the map.
    pub fn copy_relevant_preds(&self, dst: &mut SymHeap, val_map: &BTreeMap<ValId, ValId>) {
        for p in &self.preds {
            let (Some(&v1), Some(&v2)) = (val_map.get(&p.v1), val_map.get(&p.v2)) else {
                continue;
            };
            dst.add_pred(p.kind, v1, v2, p.k);
        }
    }

    // ---- mutation ------------------------------------------------------

    /// Create a fresh heap-allocated region of the given byte size.
    pub fn heap_alloc(&mut self, size: IntRange) -> ObjId {
        self.new_obj(ObjKind::Region, size, StorClass::OnHeap)
    }

    /// Look up (or create) the object backing a program variable.
    pub fn region_by_var(&mut self, cv: CVar, create_if_needed: bool) -> ObjId {
        if let Some(&o) = self.var_index.get(&cv) {
            return o;
        }
        if !create_if_needed {
            return ObjId::INVALID;
        }
        let ty = self.stor.var(cv.uid).ty;
        let size = self.stor.types.get(ty).size;
        let o = self.new_obj(
            ObjKind::Region,
            IntRange::single(size as i64),
            StorClass::Var(cv),
        );
        self.objs[o.0 as usize].est_type = Some(ty);
        self.var_index.insert(cv, o);
        o
    }

    /// Mark an object deleted. Its fields are destroyed; addresses into it
    /// survive as use-after-free witnesses.
    pub fn obj_invalidate(&mut self, o: ObjId) {
        for key in self.gather_live_fields(o) {
            self.remove_field(key);
        }
        let blocks: Vec<(ObjId, u32)> = self
            .uni_blocks
            .range((o, 0)..=(o, u32::MAX))
            .map(|(k, _)| *k)
            .collect();
        for k in blocks {
            self.uni_blocks.remove(&k);
        }
        self.objs[o.0 as usize].valid = false;
    }

    /// Destroy the object backing a program variable when its frame dies.
    pub fn var_leave_scope(&mut self, cv: CVar) {
        if let Some(&o) = self.var_index.get(&cv) {
            self.obj_invalidate(o);
            self.var_index.remove(&cv);
        }
    }

    pub fn obj_set_estimated_type(&mut self, o: ObjId, ty: TypeId) {
        self.objs[o.0 as usize].est_type = Some(ty);
    }

    pub fn obj_set_proto_level(&mut self, o: ObjId, level: u32) {
        self.objs[o.0 as usize].proto_level = level;
    }

    /// Turn an object into an abstract one (segment or may-exist).
    pub fn obj_set_abstract(&mut self, o: ObjId, kind: ObjKind, binding: Option<BindingOff>) {
        debug_assert!(kind.is_abstract());
        let data = &mut self.objs[o.0 as usize];
        data.kind = kind;
        data.binding = binding;
    }

    /// Turn an abstract object back into a concrete region.
    pub fn obj_set_concrete(&mut self, o: ObjId) {
        let data = &mut self.objs[o.0 as usize];
        data.kind = ObjKind::Region;
        data.binding = None;
        data.min_len = 0;
    }

    pub fn seg_set_min_length(&mut self, o: ObjId, len: u32) {
        self.objs[o.0 as usize].min_len = len;
    }

    pub fn write_uniform_block(&mut self, o: ObjId, ub: UniformBlock) {
        self.uni_blocks.insert((o, ub.off), ub);
    }

    /// Store a value into a field, creating the field if needed.
    pub fn write_field(&mut self, key: FieldKey, v: ValId) {
        if let Some(old) = self.fields.insert(key, v) {
            if let Some(set) = self.used_by.get_mut(&old) {
                set.remove(&key);
            }
        }
        self.used_by.entry(v).or_default().insert(key);
    }

    fn remove_field(&mut self, key: FieldKey) {
        if let Some(old) = self.fields.remove(&key) {
            if let Some(set) = self.used_by.get_mut(&old) {
                set.remove(&key);
            }
        }
    }

    /// Read a field, materializing a default when it was never written:
    /// the covering uniform block's template if any, otherwise a fresh
    /// unknown whose origin reflects the object's storage class.
    pub fn read_field(&mut self, key: FieldKey) -> ValId {
        if let Some(v) = self.fields.get(&key) {
            return *v;
        }

        let size = self.stor.types.get(key.ty).size;
        let covered = self
            .gather_uniform_blocks(key.obj)
            .iter()
            .find(|ub| ub.covers(key.off, size))
            .map(|ub| ub.tpl_value);
        let v = match covered {
            Some(tpl) => tpl,
            None => {
                let origin = match self.obj(key.obj).stor {
                    StorClass::Var(_) | StorClass::Return => ValOrigin::UninitStack,
                    StorClass::OnHeap => ValOrigin::Heap,
                    StorClass::Invalid => ValOrigin::Deleted,
                };
                self.val_create_unknown(origin)
            }
        };
        self.write_field(key, v);
        v
    }

    // ---- value construction --------------------------------------------

    /// Fresh unknown value.
    pub fn val_create_unknown(&mut self, origin: ValOrigin) -> ValId {
        self.new_val(ValTarget::Unknown(origin))
    }

    /// Derived address `v + off`, canonicalized: a zero total offset yields
    /// the object's base address.
    pub fn val_by_offset(&mut self, v: ValId, off: i64) -> ValId {
        if off == 0 {
            return v;
        }
        match self.val(v).target.clone() {
            ValTarget::AddrOf { obj, off: base } => self.addr_of(obj, base.shifted(off)),
            _ => self.val_create_unknown(ValOrigin::UnknownResult),
        }
    }

    /// Derived address over an offset range.
    pub fn val_by_range(&mut self, v: ValId, range: IntRange) -> ValId {
        match self.val(v).target.clone() {
            ValTarget::AddrOf { obj, off: base } => {
                let shifted = IntRange::new(base.lo + range.lo, base.hi + range.hi);
                self.addr_of(obj, shifted)
            }
            _ => self.val_create_unknown(ValOrigin::UnknownResult),
        }
    }

    /// Intern a custom constant; the same payload always yields the same id
    /// within one heap.
    pub fn val_wrap_custom(&mut self, cv: CustomValue) -> ValId {
        if let Some(&v) = self.custom_index.get(&cv) {
            return v;
        }
        let v = self.new_val(ValTarget::Custom(cv.clone()));
        self.custom_index.insert(cv, v);
        v
    }

    pub fn val_unwrap_custom(&self, v: ValId) -> Option<&CustomValue> {
        match &self.val(v).target {
            ValTarget::Custom(cv) => Some(cv),
            _ => None,
        }
    }

    /// Intern the address of `obj` at the given offset.
    pub fn addr_of(&mut self, obj: ObjId, off: IntRange) -> ValId {
        if let Some(&v) = self.addr_index.get(&(obj, off)) {
            return v;
        }
        let v = self.new_val(ValTarget::AddrOf { obj, off });
        self.addr_index.insert((obj, off), v);
        self.addrs_of.entry(obj).or_default().insert(v);
        v
    }

    // ---- internals -----------------------------------------------------

    fn fields_of(&self, o: ObjId) -> impl Iterator<Item = FieldKey> + '_ {
        let from = FieldKey {
            obj: o,
            off: 0,
            ty: TypeId(0),
        };
        let to = FieldKey {
            obj: o,
            off: u32::MAX,
            ty: TypeId(u32::MAX),
        };
        self.fields.range(from..=to).map(|(k, _)| *k)
    }

    fn new_obj(&mut self, kind: ObjKind, size: IntRange, stor: StorClass) -> ObjId {
        let o = ObjId(self.objs.len() as u32);
        // the base address value is created eagerly to keep the
        // object/address bijection total
        let addr = self.new_val(ValTarget::AddrOf {
            obj: o,
            off: IntRange::single(0),
        });
        self.addr_index.insert((o, IntRange::single(0)), addr);
        self.addrs_of.entry(o).or_default().insert(addr);
        self.objs.push(ObjData {
            kind,
            size,
            valid: true,
            stor,
            est_type: None,
            proto_level: 0,
            binding: None,
            min_len: 0,
            addr,
        });
        o
    }

    fn new_val(&mut self, target: ValTarget) -> ValId {
        let v = ValId(self.vals.len() as u32);
        self.vals.push(ValData { target });
        v
    }

    fn obj(&self, o: ObjId) -> &ObjData {
        &self.objs[o.0 as usize]
    }

    fn val(&self, v: ValId) -> &ValData {
        &self.vals[v.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceId;
    use shale_ir::ProgramBuilder;

    fn empty_heap() -> SymHeap {
        let stor = Arc::new(ProgramBuilder::new().build());
        SymHeap::new(stor, TraceId(0))
    }

    fn heap_with_var() -> (SymHeap, CVar) {
        let mut p = ProgramBuilder::new();
        let void = p.types().void();
        let i64t = p.types().int(8);
        let ptr = p.types().ptr(i64t);
        let mut f = p.fnc("f", void);
        let v = f.local("p", ptr);
        f.block("entry");
        f.ret(None);
        f.finish();
        let sh = SymHeap::new(Arc::new(p.build()), TraceId(0));
        (sh, CVar::new(v, 0))
    }

    #[test]
    fn reserved_ids_are_stable() {
        let sh = empty_heap();
        assert_eq!(sh.val_target(ValId::NULL), &ValTarget::Null);
        assert_eq!(sh.obj_by_addr(ValId::ADDR_OF_RET), ObjId::RETURN);
        assert_eq!(sh.addr_of_region(ObjId::RETURN), ValId::ADDR_OF_RET);
        assert!(!sh.is_valid(ObjId::INVALID));
        assert!(sh.is_valid(ObjId::RETURN));
    }

    #[test]
    fn heap_alloc_creates_addr_bijection() {
        let mut sh = empty_heap();
        let o = sh.heap_alloc(IntRange::single(16));
        let addr = sh.addr_of_region(o);
        assert_eq!(sh.obj_by_addr(addr), o);
        assert_eq!(sh.obj_kind(o), ObjKind::Region);
        assert_eq!(sh.obj_stor_class(o), StorClass::OnHeap);
        assert!(sh.is_possible_to_deref(addr));
    }

    #[test]
    fn derived_addresses_are_canonical() {
        let mut sh = empty_heap();
        let o = sh.heap_alloc(IntRange::single(16));
        let base = sh.addr_of_region(o);

        assert_eq!(sh.val_by_offset(base, 0), base);

        let v8 = sh.val_by_offset(base, 8);
        assert_eq!(sh.val_offset(v8), IntRange::single(8));
        assert_eq!(sh.val_root(v8), base);

        // same offset interns to the same id
        assert_eq!(sh.val_by_offset(base, 8), v8);

        // walking back to the root is canonical again
        assert_eq!(sh.val_by_offset(v8, -8), base);
    }

    #[test]
    fn custom_values_are_interned_deterministically() {
        let mut sh = empty_heap();
        let a = sh.val_wrap_custom(CustomValue::Int(42));
        let b = sh.val_wrap_custom(CustomValue::Int(42));
        let c = sh.val_wrap_custom(CustomValue::Int(7));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(sh.val_unwrap_custom(a), Some(&CustomValue::Int(42)));
    }

    #[test]
    fn field_write_read_and_back_edges() {
        let (mut sh, cv) = heap_with_var();
        let o = sh.region_by_var(cv, true);
        let target = sh.heap_alloc(IntRange::single(8));
        let addr = sh.addr_of_region(target);

        let ty = sh.stor().var(cv.uid).ty;
        let key = FieldKey { obj: o, off: 0, ty };
        sh.write_field(key, addr);

        assert_eq!(sh.peek_field(key), Some(addr));
        assert_eq!(sh.used_by(addr), vec![key]);
        assert_eq!(sh.pointed_by(target), vec![key]);
        assert_eq!(sh.gather_live_fields(o), vec![key]);
        assert_eq!(sh.gather_live_pointers(o), vec![key]);

        // overwriting drops the old back edge
        sh.write_field(key, ValId::NULL);
        assert!(sh.used_by(addr).is_empty());
        assert!(sh.pointed_by(target).is_empty());
    }

    #[test]
    fn invalidate_kills_fields_but_keeps_witnesses() {
        let (mut sh, cv) = heap_with_var();
        let o = sh.region_by_var(cv, true);
        let target = sh.heap_alloc(IntRange::single(8));
        let addr = sh.addr_of_region(target);
        let ty = sh.stor().var(cv.uid).ty;
        sh.write_field(FieldKey { obj: o, off: 0, ty }, addr);

        sh.obj_invalidate(target);
        assert!(!sh.is_valid(target));
        assert!(!sh.is_possible_to_deref(addr));
        // the address still classifies as an address into the dead object
        assert_eq!(sh.obj_by_addr(addr), target);
    }

    #[test]
    fn uniform_block_feeds_default_reads() {
        let mut p = ProgramBuilder::new();
        let i64t = p.types().int(8);
        let mut sh = SymHeap::new(Arc::new(p.build()), TraceId(0));

        let o = sh.heap_alloc(IntRange::single(16));
        sh.write_uniform_block(
            o,
            UniformBlock {
                off: 0,
                size: 16,
                tpl_value: ValId::NULL,
            },
        );

        let key = FieldKey {
            obj: o,
            off: 8,
            ty: i64t,
        };
        assert_eq!(sh.read_field(key), ValId::NULL);

        // a read outside any block materializes an unknown tagged by the
        // object's storage class
        let o2 = sh.heap_alloc(IntRange::single(8));
        let key2 = FieldKey {
            obj: o2,
            off: 0,
            ty: i64t,
        };
        let v = sh.read_field(key2);
        assert_eq!(sh.val_origin(v), Some(ValOrigin::Heap));
        // the materialized default is stable across reads
        assert_eq!(sh.read_field(key2), v);
    }

    #[test]
    fn preds_normalize_and_detect_contradiction() {
        let mut sh = empty_heap();
        let a = sh.val_create_unknown(ValOrigin::UnknownResult);
        let b = sh.val_create_unknown(ValOrigin::UnknownResult);

        sh.add_pred(PredKind::NotEqual, b, a, 0);
        assert!(sh.chk_pred(PredKind::NotEqual, a, b, 0));
        assert!(sh.is_feasible());

        sh.add_pred(PredKind::Equal, a, b, 0);
        assert!(!sh.is_feasible());
    }

    #[test]
    fn var_scope_lifecycle() {
        let (mut sh, cv) = heap_with_var();
        let o = sh.region_by_var(cv, true);
        assert_eq!(sh.cvar_by_object(o), Some(cv));
        assert_eq!(sh.gather_program_vars(), vec![cv]);
        // idempotent lookup
        assert_eq!(sh.region_by_var(cv, true), o);

        sh.var_leave_scope(cv);
        assert!(!sh.is_valid(o));
        assert!(sh.gather_program_vars().is_empty());
        assert_eq!(sh.region_by_var(cv, false), ObjId::INVALID);
    }
}
