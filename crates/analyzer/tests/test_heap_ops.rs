//! Cross-module properties of the heap operations
//!
//! Splitting a heap by a cut and merging the frame back must reconstruct
//! the original up to isomorphism, and the two comparators must agree:
//! a join reporting `Equal` means the isomorphism check holds too.

use shale::heap::{CVar, FieldKey, IntRange, ObjKind, SymHeap, ValId};
use shale::{
    AnalyzerConfig, EngineCtx, JoinStatus, are_equal, join_heaps_by_cvars, join_sym_heaps,
    split_heap_by_cvars,
};
use shale_ir::{ProgramBuilder, TypeId, VarId};
use std::sync::Arc;

struct Fixture {
    stor: Arc<shale_ir::Storage>,
    ptr: TypeId,
    i64t: TypeId,
    p: VarId,
    q: VarId,
}

fn fixture() -> Fixture {
    let mut pb = ProgramBuilder::new();
    let void = pb.types().void();
    let i64t = pb.types().int(8);
    let ptr = pb.types().ptr(i64t);
    let mut f = pb.fnc("f", void);
    let p = f.local("p", ptr);
    let q = f.local("q", ptr);
    f.block("entry");
    f.ret(None);
    f.finish();
    Fixture {
        stor: Arc::new(pb.build()),
        ptr,
        i64t,
        p,
        q,
    }
}

fn mk(fx: &Fixture, ctx: &mut EngineCtx) -> SymHeap {
    let trace = ctx.trace.transient("test heap");
    SymHeap::new(fx.stor.clone(), trace)
}

/// `var -> node -> node -> null`, nodes carrying a custom payload.
fn attach_list(fx: &Fixture, sh: &mut SymHeap, var: VarId, len: usize, payload: i64) {
    let reg = sh.region_by_var(CVar::new(var, 0), true);
    let mut hole = FieldKey {
        obj: reg,
        off: 0,
        ty: fx.ptr,
    };
    for _ in 0..len {
        let node = sh.heap_alloc(IntRange::single(16));
        let data = sh.val_wrap_custom(shale::heap::CustomValue::Int(payload));
        sh.write_field(
            FieldKey {
                obj: node,
                off: 8,
                ty: fx.i64t,
            },
            data,
        );
        let addr = sh.addr_of_region(node);
        sh.write_field(hole, addr);
        hole = FieldKey {
            obj: node,
            off: 0,
            ty: fx.ptr,
        };
    }
    sh.write_field(hole, ValId::NULL);
}

#[test]
fn split_and_merge_reconstructs_the_heap() {
    let fx = fixture();
    let config = AnalyzerConfig::new();
    let mut ctx = EngineCtx::new(config.clone());

    let mut sh = mk(&fx, &mut ctx);
    attach_list(&fx, &mut sh, fx.p, 2, 7);
    attach_list(&fx, &mut sh, fx.q, 1, 9);
    let original = sh.clone();

    let mut frame = mk(&fx, &mut ctx);
    split_heap_by_cvars(
        &config,
        &mut ctx.trace,
        &mut sh,
        &[CVar::new(fx.p, 0)],
        Some(&mut frame),
    );

    // the two parts carry disjoint variables
    assert_eq!(sh.gather_program_vars(), vec![CVar::new(fx.p, 0)]);
    assert_eq!(frame.gather_program_vars(), vec![CVar::new(fx.q, 0)]);
    assert!(!are_equal(&sh, &original));

    join_heaps_by_cvars(&config, &mut sh, &mut frame);
    assert!(are_equal(&sh, &original));
    assert!(are_equal(&original, &sh));
}

#[test]
fn split_without_frame_keeps_only_the_cut() {
    let fx = fixture();
    let config = AnalyzerConfig::new();
    let mut ctx = EngineCtx::new(config.clone());

    let mut sh = mk(&fx, &mut ctx);
    attach_list(&fx, &mut sh, fx.p, 1, 1);
    attach_list(&fx, &mut sh, fx.q, 1, 2);

    split_heap_by_cvars(
        &config,
        &mut ctx.trace,
        &mut sh,
        &[CVar::new(fx.q, 0)],
        None,
    );
    assert_eq!(sh.gather_program_vars(), vec![CVar::new(fx.q, 0)]);
}

#[test]
fn join_status_equal_agrees_with_isomorphism() {
    let fx = fixture();
    let mut ctx = EngineCtx::new(AnalyzerConfig::new());

    let mut h1 = mk(&fx, &mut ctx);
    attach_list(&fx, &mut h1, fx.p, 2, 5);
    attach_list(&fx, &mut h1, fx.q, 0, 0);
    let mut h2 = mk(&fx, &mut ctx);
    attach_list(&fx, &mut h2, fx.p, 2, 5);
    attach_list(&fx, &mut h2, fx.q, 0, 0);

    assert!(are_equal(&h1, &h2));
    let res = join_sym_heaps(&mut ctx.trace, &h1, &h2, true).unwrap();
    assert_eq!(res.status, JoinStatus::Equal);
    assert!(are_equal(&res.heap, &h1));
}

#[test]
fn abstraction_survives_split_and_merge() {
    let fx = fixture();
    let config = AnalyzerConfig::new();
    let mut ctx = EngineCtx::new(config.clone());

    let mut sh = mk(&fx, &mut ctx);
    attach_list(&fx, &mut sh, fx.p, 1, 3);
    attach_list(&fx, &mut sh, fx.q, 1, 4);

    // abstract p's node into a possibly-empty segment
    let reg = sh.var_object(CVar::new(fx.p, 0)).unwrap();
    let addr = sh
        .peek_field(FieldKey {
            obj: reg,
            off: 0,
            ty: fx.ptr,
        })
        .unwrap();
    let node = sh.obj_by_addr(addr);
    sh.obj_set_abstract(
        node,
        ObjKind::Sls,
        Some(shale::heap::BindingOff {
            next: 0,
            prev: None,
            head: 0,
        }),
    );
    sh.seg_set_min_length(node, 2);
    let original = sh.clone();

    let mut frame = mk(&fx, &mut ctx);
    split_heap_by_cvars(
        &config,
        &mut ctx.trace,
        &mut sh,
        &[CVar::new(fx.p, 0)],
        Some(&mut frame),
    );
    join_heaps_by_cvars(&config, &mut sh, &mut frame);

    assert!(are_equal(&sh, &original));
}
