//! Transfer functions over symbolic heaps
//!
//! One basic block is interpreted instruction by instruction. Where an
//! access goes through an abstract object, the heap is first concretized
//! (the object unfolds into its cases) and the affected instruction is
//! retried on every case, so a single incoming heap can fan out into
//! several outgoing ones. Detected violations are reported and terminate
//! only the offending path; sibling paths keep running.

use crate::heap::{
    CVar, CustomValue, FieldKey, IntRange, ObjId, ObjKind, StorClass, SymHeap, ValId, ValOrigin,
    ValTarget,
};
use crate::report::{EngineError, ErrorKind, Report, ReportSink};
use crate::seg;
use crate::EngineCtx;
use shale_ir::{
    Accessor, Binop, BlockId, Fnc, FncId, InsnKind, Literal, Loc, Operand, TypeCode, TypeId, Unop,
    VarId,
};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Execution context of one analyzed function.
pub struct FncProc<'a> {
    pub ctx: &'a mut EngineCtx,
    pub fnc: &'a Fnc,
    pub fnc_id: FncId,
}

/// Result of evaluating an operand on one heap.
enum Eval {
    Val(ValId),
    /// The access went through an abstract object; concretize and retry.
    Unfold(ObjId),
    /// A violation was reported; the path ends here.
    Die,
}

enum Place {
    Field(FieldKey),
    Unfold(ObjId),
    Die,
}

enum CondEval {
    True,
    False,
    Both,
    Unfold(ObjId),
    Die,
}

/// Interpret one basic block on one heap; returns the heaps offered to
/// each successor block.
pub fn exec_block(
    pc: &mut FncProc<'_>,
    reports: &mut dyn ReportSink,
    sh: SymHeap,
    bb: BlockId,
) -> Result<Vec<(BlockId, SymHeap)>, EngineError> {
    let insns = &pc.fnc.block(bb).insns;
    let mut out = Vec::new();
    let mut queue: Vec<(SymHeap, usize)> = vec![(sh, 0)];

    'queue: while let Some((mut sh, mut idx)) = queue.pop() {
        while idx < insns.len() {
            let insn = &insns[idx];
            let loc = &insn.loc;

            macro_rules! value_of {
                ($op:expr) => {
                    match eval_operand(reports, &mut sh, $op, loc)? {
                        Eval::Val(v) => v,
                        Eval::Unfold(obj) => {
                            for case in seg::unfold(&mut pc.ctx.trace, &sh, obj) {
                                queue.push((case, idx));
                            }
                            continue 'queue;
                        }
                        Eval::Die => continue 'queue,
                    }
                };
            }
            macro_rules! place_of {
                ($op:expr) => {
                    match resolve_lvalue(reports, &mut sh, $op, loc)? {
                        Place::Field(key) => key,
                        Place::Unfold(obj) => {
                            for case in seg::unfold(&mut pc.ctx.trace, &sh, obj) {
                                queue.push((case, idx));
                            }
                            continue 'queue;
                        }
                        Place::Die => continue 'queue,
                    }
                };
            }

            match &insn.kind {
                InsnKind::Label { .. } => {}

                InsnKind::Unop { code, dst, src } => {
                    let v = value_of!(src);
                    let v = match code {
                        Unop::Assign => v,
                        Unop::Not => eval_not(&mut sh, v),
                    };
                    let key = place_of!(dst);
                    sh.write_field(key, v);
                }

                InsnKind::Binop {
                    code,
                    dst,
                    src1,
                    src2,
                } => {
                    let v1 = value_of!(src1);
                    let v2 = value_of!(src2);
                    let v = eval_binop(&mut sh, *code, v1, v2);
                    let key = place_of!(dst);
                    sh.write_field(key, v);
                }

                InsnKind::Call { dst, fnc, args } => {
                    let name = sh.stor().fnc(*fnc).name.clone();
                    match name.as_str() {
                        "malloc" => {
                            let Some(arg) = args.first() else {
                                return Err(EngineError::Fault {
                                    msg: "malloc expects one argument".into(),
                                    loc: loc.clone(),
                                });
                            };
                            let size = value_of!(arg);
                            let size = match sh.val_unwrap_custom(size) {
                                Some(CustomValue::Int(n)) => IntRange::single(*n),
                                _ => IntRange::new(0, i64::MAX),
                            };
                            let obj = sh.heap_alloc(size);
                            let addr = sh.addr_of_region(obj);
                            if let Some(dst) = dst {
                                let key = place_of!(dst);
                                sh.write_field(key, addr);
                            }
                        }
                        "free" => {
                            let Some(arg) = args.first() else {
                                return Err(EngineError::Fault {
                                    msg: "free expects one argument".into(),
                                    loc: loc.clone(),
                                });
                            };
                            let v = value_of!(arg);
                            match exec_free(reports, &mut sh, v, loc) {
                                Eval::Val(_) => {}
                                Eval::Unfold(obj) => {
                                    for case in seg::unfold(&mut pc.ctx.trace, &sh, obj) {
                                        queue.push((case, idx));
                                    }
                                    continue 'queue;
                                }
                                Eval::Die => continue 'queue,
                            }
                        }
                        _ => {
                            // an unmodeled callee: havoc the destination
                            if sh.stor().fnc(*fnc).is_defined() {
                                warn!(callee = %name, "call into a defined function is not \
                                      interpreted, result treated as unknown");
                            }
                            for arg in args {
                                let _ = value_of!(arg);
                            }
                            if let Some(dst) = dst {
                                let v = sh.val_create_unknown(ValOrigin::UnknownResult);
                                let key = place_of!(dst);
                                sh.write_field(key, v);
                            }
                        }
                    }
                }

                InsnKind::Cond {
                    src,
                    then_target,
                    else_target,
                } => {
                    let v = value_of!(src);
                    match eval_cond(reports, &sh, v, loc) {
                        CondEval::True => out.push((*then_target, sh)),
                        CondEval::False => out.push((*else_target, sh)),
                        CondEval::Both => {
                            let mut then_sh = sh.clone();
                            then_sh.set_trace(pc.ctx.trace.clone_node(sh.trace()));
                            out.push((*then_target, then_sh));
                            out.push((*else_target, sh));
                        }
                        CondEval::Unfold(obj) => {
                            for case in seg::unfold(&mut pc.ctx.trace, &sh, obj) {
                                queue.push((case, idx));
                            }
                            continue 'queue;
                        }
                        CondEval::Die => continue 'queue,
                    }
                    continue 'queue;
                }

                InsnKind::Jmp { target } => {
                    out.push((*target, sh));
                    continue 'queue;
                }

                InsnKind::Ret { src } => {
                    if let Some(src) = src {
                        let v = value_of!(src);
                        let ty = src.ty();
                        sh.obj_set_estimated_type(ObjId::RETURN, ty);
                        sh.write_field(
                            FieldKey {
                                obj: ObjId::RETURN,
                                off: 0,
                                ty,
                            },
                            v,
                        );
                    }
                    exec_fnc_exit(pc, reports, &mut sh, loc);
                    continue 'queue;
                }

                InsnKind::Abort => {
                    debug!("abnormal program exit, path ends");
                    continue 'queue;
                }
            }

            idx += 1;
        }

        // a block must end in a terminal instruction
        match insns.last() {
            Some(last) if last.kind.is_terminal() => {}
            Some(last) => {
                return Err(EngineError::Fault {
                    msg: "basic block does not end in a terminal instruction".into(),
                    loc: last.loc.clone(),
                });
            }
            None => {
                return Err(EngineError::Fault {
                    msg: "empty basic block".into(),
                    loc: Loc::default(),
                });
            }
        }
    }

    Ok(out)
}

// ---- operand walking ----------------------------------------------------

fn pointee_of(sh: &SymHeap, ty: TypeId) -> TypeId {
    let t = sh.stor().types.get(ty);
    if t.code == TypeCode::Ptr {
        if let Some(item) = t.items.first() {
            return item.ty;
        }
    }
    ty
}

/// Walk an operand's accessor chain down to its final location; the inner
/// `Err` routes an unfold request or a dead path back to the caller.
fn walk_accessors(
    reports: &mut dyn ReportSink,
    sh: &mut SymHeap,
    var: VarId,
    accessors: &[Accessor],
    loc: &Loc,
) -> Result<Result<(ObjId, u32, TypeId), Place>, EngineError> {
    let cv = CVar::new(var, 0);
    let mut obj = sh.region_by_var(cv, true);
    let mut off: u32 = 0;
    let mut ty = sh.stor().var(var).ty;

    for acc in accessors {
        match acc {
            Accessor::Item {
                offset,
                ty: item_ty,
            } => {
                off += offset;
                ty = *item_ty;
            }

            Accessor::Ref => {
                // the callers strip a trailing address-of before walking
                return Err(EngineError::Fault {
                    msg: "address-of inside an accessor chain".into(),
                    loc: loc.clone(),
                });
            }

            Accessor::Deref => {
                let key = FieldKey { obj, off, ty };
                let v = sh.read_field(key);
                match sh.val_target(v).clone() {
                    ValTarget::AddrOf { obj: tgt, off: o } => {
                        if tgt == ObjId::INVALID {
                            report(reports, sh, ErrorKind::InvalidDeref, loc);
                            return Ok(Err(Place::Die));
                        }
                        if !sh.is_valid(tgt) {
                            report(reports, sh, ErrorKind::UseAfterFree, loc);
                            return Ok(Err(Place::Die));
                        }
                        if sh.obj_kind(tgt).is_abstract() {
                            return Ok(Err(Place::Unfold(tgt)));
                        }
                        obj = tgt;
                        off = o.lo as u32;
                        ty = pointee_of(sh, ty);
                    }
                    ValTarget::Null | ValTarget::Invalid | ValTarget::Custom(_) => {
                        report(reports, sh, ErrorKind::InvalidDeref, loc);
                        return Ok(Err(Place::Die));
                    }
                    ValTarget::Unknown(origin) => {
                        let kind = match origin {
                            ValOrigin::UninitStack | ValOrigin::Heap => ErrorKind::UninitRead,
                            ValOrigin::Deleted | ValOrigin::UnknownResult => {
                                ErrorKind::InvalidDeref
                            }
                        };
                        report(reports, sh, kind, loc);
                        return Ok(Err(Place::Die));
                    }
                }
            }
        }
    }

    Ok(Ok((obj, off, ty)))
}

fn eval_operand(
    reports: &mut dyn ReportSink,
    sh: &mut SymHeap,
    op: &Operand,
    loc: &Loc,
) -> Result<Eval, EngineError> {
    match op {
        Operand::Lit { value, .. } => Ok(Eval::Val(literal_value(sh, value))),

        Operand::Var {
            var, accessors, ..
        } => {
            if let Some(Accessor::Ref) = accessors.last() {
                // &lvalue: walk everything before the Ref
                let inner = &accessors[..accessors.len() - 1];
                match walk_accessors(reports, sh, *var, inner, loc)? {
                    Ok((obj, off, _)) => {
                        let addr = sh.addr_of(obj, IntRange::single(off as i64));
                        Ok(Eval::Val(addr))
                    }
                    Err(Place::Unfold(obj)) => Ok(Eval::Unfold(obj)),
                    Err(_) => Ok(Eval::Die),
                }
            } else {
                match walk_accessors(reports, sh, *var, accessors, loc)? {
                    Ok((obj, off, ty)) => {
                        let v = sh.read_field(FieldKey { obj, off, ty });
                        Ok(Eval::Val(v))
                    }
                    Err(Place::Unfold(obj)) => Ok(Eval::Unfold(obj)),
                    Err(_) => Ok(Eval::Die),
                }
            }
        }
    }
}

fn resolve_lvalue(
    reports: &mut dyn ReportSink,
    sh: &mut SymHeap,
    op: &Operand,
    loc: &Loc,
) -> Result<Place, EngineError> {
    match op {
        Operand::Lit { .. } => Err(EngineError::Fault {
            msg: "literal used as an assignment target".into(),
            loc: loc.clone(),
        }),
        Operand::Var {
            var, accessors, ..
        } => {
            if let Some(Accessor::Ref) = accessors.last() {
                return Err(EngineError::Fault {
                    msg: "address-of used as an assignment target".into(),
                    loc: loc.clone(),
                });
            }
            match walk_accessors(reports, sh, *var, accessors, loc)? {
                Ok((obj, off, ty)) => Ok(Place::Field(FieldKey { obj, off, ty })),
                Err(place) => Ok(place),
            }
        }
    }
}

fn literal_value(sh: &mut SymHeap, lit: &Literal) -> ValId {
    match lit {
        Literal::Int(n) => sh.val_wrap_custom(CustomValue::Int(*n)),
        Literal::Bool(b) => sh.val_wrap_custom(CustomValue::Int(i64::from(*b))),
        Literal::Null => ValId::NULL,
        Literal::Str(s) => sh.val_wrap_custom(CustomValue::Str(s.clone())),
        Literal::Fnc(f) => sh.val_wrap_custom(CustomValue::Fnc(*f)),
    }
}

// ---- operations ---------------------------------------------------------

fn eval_not(sh: &mut SymHeap, v: ValId) -> ValId {
    match sh.val_target(v).clone() {
        ValTarget::Custom(CustomValue::Int(n)) => {
            sh.val_wrap_custom(CustomValue::Int(i64::from(n == 0)))
        }
        ValTarget::Null => sh.val_wrap_custom(CustomValue::Int(1)),
        _ => sh.val_create_unknown(ValOrigin::UnknownResult),
    }
}

/// Three-valued equality of two abstract values.
fn values_equal(sh: &SymHeap, v1: ValId, v2: ValId) -> Option<bool> {
    if v1 == v2 {
        return match sh.val_target(v1) {
            ValTarget::Unknown(_) => None,
            _ => Some(true),
        };
    }
    match (sh.val_target(v1), sh.val_target(v2)) {
        (ValTarget::Custom(a), ValTarget::Custom(b)) => Some(a == b),
        (ValTarget::Null, ValTarget::AddrOf { obj, .. })
        | (ValTarget::AddrOf { obj, .. }, ValTarget::Null) => {
            // a possibly-empty abstract target may stand for null
            match sh.obj_kind(*obj) {
                ObjKind::Region => Some(false),
                ObjKind::Sls | ObjKind::Dls if sh.seg_min_length(*obj) > 0 => Some(false),
                _ => None,
            }
        }
        (
            ValTarget::AddrOf { obj: o1, off: off1 },
            ValTarget::AddrOf { obj: o2, off: off2 },
        ) => {
            if o1 == o2 {
                if off1.is_single() && off2.is_single() {
                    Some(off1 == off2)
                } else {
                    None
                }
            } else if sh.obj_kind(*o1) == ObjKind::Region && sh.obj_kind(*o2) == ObjKind::Region {
                // distinct live regions never alias
                Some(false)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn eval_binop(sh: &mut SymHeap, code: Binop, v1: ValId, v2: ValId) -> ValId {
    match code {
        Binop::CmpEq | Binop::CmpNe => {
            let flip = code == Binop::CmpNe;
            match values_equal(sh, v1, v2) {
                Some(eq) => sh.val_wrap_custom(CustomValue::Int(i64::from(eq != flip))),
                None => sh.val_create_unknown(ValOrigin::UnknownResult),
            }
        }
        Binop::Add | Binop::Sub => {
            match (sh.val_target(v1).clone(), sh.val_target(v2).clone()) {
                (
                    ValTarget::Custom(CustomValue::Int(a)),
                    ValTarget::Custom(CustomValue::Int(b)),
                ) => {
                    let n = if code == Binop::Add {
                        a.wrapping_add(b)
                    } else {
                        a.wrapping_sub(b)
                    };
                    sh.val_wrap_custom(CustomValue::Int(n))
                }
                _ => sh.val_create_unknown(ValOrigin::UnknownResult),
            }
        }
    }
}

fn eval_cond(
    reports: &mut dyn ReportSink,
    sh: &SymHeap,
    v: ValId,
    loc: &Loc,
) -> CondEval {
    match sh.val_target(v) {
        ValTarget::Custom(CustomValue::Int(0)) => CondEval::False,
        ValTarget::Custom(_) => CondEval::True,
        ValTarget::Null => CondEval::False,
        ValTarget::Invalid => {
            report(reports, sh, ErrorKind::InvalidDeref, loc);
            CondEval::Die
        }
        ValTarget::AddrOf { obj, .. } => match sh.obj_kind(*obj) {
            // a possibly-empty abstract target must be concretized before
            // its address can decide a branch
            ObjKind::MayExist => CondEval::Unfold(*obj),
            ObjKind::Sls | ObjKind::Dls if sh.seg_min_length(*obj) == 0 => CondEval::Unfold(*obj),
            _ => CondEval::True,
        },
        ValTarget::Unknown(origin) => match origin {
            ValOrigin::UninitStack => {
                report(reports, sh, ErrorKind::UninitRead, loc);
                CondEval::Die
            }
            _ => CondEval::Both,
        },
    }
}

fn exec_free(
    reports: &mut dyn ReportSink,
    sh: &mut SymHeap,
    v: ValId,
    loc: &Loc,
) -> Eval {
    match sh.val_target(v).clone() {
        // free(NULL) is a no-op
        ValTarget::Null => Eval::Val(v),

        ValTarget::AddrOf { obj, off } => {
            if off != IntRange::single(0) {
                report(reports, sh, ErrorKind::InvalidFree, loc);
                return Eval::Die;
            }
            if !sh.is_valid(obj) {
                report(reports, sh, ErrorKind::DoubleFree, loc);
                return Eval::Die;
            }
            if sh.obj_stor_class(obj) != StorClass::OnHeap {
                report(reports, sh, ErrorKind::InvalidFree, loc);
                return Eval::Die;
            }
            if sh.obj_kind(obj).is_abstract() {
                return Eval::Unfold(obj);
            }
            sh.obj_invalidate(obj);
            Eval::Val(v)
        }

        ValTarget::Unknown(ValOrigin::Deleted) => {
            report(reports, sh, ErrorKind::DoubleFree, loc);
            Eval::Die
        }

        _ => {
            report(reports, sh, ErrorKind::InvalidFree, loc);
            Eval::Die
        }
    }
}

/// Tear down the function's frame and sweep for leaked heap objects.
fn exec_fnc_exit(
    pc: &mut FncProc<'_>,
    reports: &mut dyn ReportSink,
    sh: &mut SymHeap,
    loc: &Loc,
) {
    for var in bound_locals(pc, sh) {
        sh.var_leave_scope(var);
    }

    let reachable = reachable_objects(sh);
    for idx in 0..sh.cnt_objs() as u32 {
        let obj = ObjId(idx);
        if sh.obj_stor_class(obj) == StorClass::OnHeap
            && sh.is_valid(obj)
            && !reachable.contains(&obj)
        {
            report(reports, sh, ErrorKind::MemLeak, loc);
            sh.obj_invalidate(obj);
        }
    }
}

/// Forward closure over fields from the program variables and the return
/// slot.
fn reachable_objects(sh: &SymHeap) -> BTreeSet<ObjId> {
    let mut seen = BTreeSet::new();
    let mut wl: Vec<ObjId> = sh
        .gather_program_vars()
        .into_iter()
        .filter_map(|cv| sh.var_object(cv))
        .collect();
    wl.push(ObjId::RETURN);

    while let Some(obj) = wl.pop() {
        if !seen.insert(obj) {
            continue;
        }
        for key in sh.gather_live_fields(obj) {
            if let Some(v) = sh.peek_field(key) {
                if let ValTarget::AddrOf { obj: tgt, .. } = sh.val_target(v) {
                    wl.push(*tgt);
                }
            }
        }
    }
    seen
}

fn report(reports: &mut dyn ReportSink, sh: &SymHeap, kind: ErrorKind, loc: &Loc) {
    debug!(%kind, %loc, "violation detected");
    reports.report(Report {
        kind,
        loc: loc.clone(),
        trace: sh.trace(),
    });
}

/// Local variables of the analyzed function that are bound in the heap.
fn bound_locals(pc: &FncProc<'_>, sh: &SymHeap) -> Vec<CVar> {
    let locals: BTreeSet<VarId> = sh.stor().locals_of(pc.fnc_id).collect();
    sh.gather_program_vars()
        .into_iter()
        .filter(|cv| locals.contains(&cv.uid))
        .collect()
}
