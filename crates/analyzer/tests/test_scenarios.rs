//! End-to-end analyses of small pointer programs
//!
//! Each test lowers a C-like program by hand through the IR builder, runs
//! the engine to its fixed point and checks the exact set of reported
//! violations, plus the shape the loop-head states converge to.

use shale::heap::ObjKind;
use shale::{
    AnalyzerConfig, CollectedReports, EngineCtx, ErrorKind, SchedulerKind, analyze_storage,
    exec_fnc_with_states,
};
use shale_ir::{BlockId, FncId, ProgramBuilder, Storage, TypeId, TypeItem};
use std::sync::Arc;

/// struct node { struct node *next; long data; };
fn node_type(p: &mut ProgramBuilder) -> (TypeId, TypeId) {
    let i64t = p.types().int(8);
    let fwd = p.types().strukt(vec![]);
    let fwd_ptr = p.types().ptr(fwd);
    let node = p.types().strukt(vec![
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
    let node_ptr = p.types().ptr(node);
    (node, node_ptr)
}

/// struct dnode { struct dnode *next; struct dnode *prev; long data; };
fn dnode_type(p: &mut ProgramBuilder) -> (TypeId, TypeId) {
    let i64t = p.types().int(8);
    let fwd = p.types().strukt(vec![]);
    let fwd_ptr = p.types().ptr(fwd);
    let node = p.types().strukt(vec![
        TypeItem {
            name: Some("next".into()),
            ty: fwd_ptr,
            offset: 0,
        },
        TypeItem {
            name: Some("prev".into()),
            ty: fwd_ptr,
            offset: 8,
        },
        TypeItem {
            name: Some("data".into()),
            ty: i64t,
            offset: 16,
        },
    ]);
    let node_ptr = p.types().ptr(node);
    (node, node_ptr)
}

fn kinds(reports: &CollectedReports) -> Vec<ErrorKind> {
    reports.as_slice().iter().map(|r| r.kind).collect()
}

/// p = malloc(8); free(p); *p = 1;
fn use_after_free_program() -> Arc<Storage> {
    let mut p = ProgramBuilder::new();
    let void = p.types().void();
    let i64t = p.types().int(8);
    let pi64 = p.types().ptr(i64t);
    let malloc = p.extern_fnc("malloc", pi64);
    let free = p.extern_fnc("free", void);

    let mut f = p.fnc("main", void);
    let vp = f.local("p", pi64);
    f.block("entry");
    f.at(2);
    let dst = f.op_var(vp);
    let size = f.op_int(8);
    f.call(Some(dst), malloc, vec![size]);
    f.at(3);
    let arg = f.op_var(vp);
    f.call(None, free, vec![arg]);
    f.at(4);
    let store = f.op_deref(vp);
    let one = f.op_int(1);
    f.assign(store, one);
    f.at(5).ret(None);
    f.finish();

    Arc::new(p.build())
}

#[test]
fn scenario_use_after_free() {
    let result = analyze_storage(AnalyzerConfig::new(), use_after_free_program());
    assert!(result.complete);
    assert_eq!(kinds(&result.reports), vec![ErrorKind::UseAfterFree]);
    assert_eq!(result.reports.as_slice()[0].loc.line, 4);
}

/// p = malloc(8); p = NULL;  (no free)
#[test]
fn scenario_memory_leak() {
    let mut p = ProgramBuilder::new();
    let void = p.types().void();
    let i64t = p.types().int(8);
    let pi64 = p.types().ptr(i64t);
    let malloc = p.extern_fnc("malloc", pi64);

    let mut f = p.fnc("main", void);
    let vp = f.local("p", pi64);
    f.block("entry");
    f.at(2);
    let dst = f.op_var(vp);
    let size = f.op_int(8);
    f.call(Some(dst), malloc, vec![size]);
    f.at(3);
    let dst = f.op_var(vp);
    let null = f.op_null();
    f.assign(dst, null);
    f.at(4).ret(None);
    f.finish();

    let result = analyze_storage(AnalyzerConfig::new(), Arc::new(p.build()));
    assert!(result.complete);
    assert_eq!(kinds(&result.reports), vec![ErrorKind::MemLeak]);
}

/// while (nondet) { n = malloc(16); n->next = head; head = n; }
/// while (head) { t = head; head = t->next; free(t); }
fn sls_program() -> (Arc<Storage>, FncId, BlockId) {
    let mut p = ProgramBuilder::new();
    let void = p.types().void();
    let i64t = p.types().int(8);
    let (_, node_ptr) = node_type(&mut p);
    let malloc = p.extern_fnc("malloc", node_ptr);
    let free = p.extern_fnc("free", void);
    let nondet = p.extern_fnc("nondet", i64t);

    let mut f = p.fnc("main", void);
    let head = f.local("head", node_ptr);
    let n = f.local("n", node_ptr);
    let t = f.local("t", node_ptr);
    let x = f.local("x", i64t);

    let entry = f.block("entry");
    let loophead = f.block("loophead");
    let body = f.block("body");
    let freehead = f.block("freehead");
    let freebody = f.block("freebody");
    let exit = f.block("exit");

    f.switch_to(entry).at(2);
    let dst = f.op_var(head);
    let null = f.op_null();
    f.assign(dst, null).jmp(loophead);

    f.switch_to(loophead).at(3);
    let dst = f.op_var(x);
    f.call(Some(dst), nondet, vec![]);
    let cond = f.op_var(x);
    f.cond(cond, body, freehead);

    f.switch_to(body).at(4);
    let dst = f.op_var(n);
    let size = f.op_int(16);
    f.call(Some(dst), malloc, vec![size]);
    f.at(5);
    let next = f.op_field(n, 0);
    let src = f.op_var(head);
    f.assign(next, src);
    f.at(6);
    let dst = f.op_var(head);
    let src = f.op_var(n);
    f.assign(dst, src).jmp(loophead);

    f.switch_to(freehead).at(8);
    let cond = f.op_var(head);
    f.cond(cond, freebody, exit);

    f.switch_to(freebody).at(9);
    let dst = f.op_var(t);
    let src = f.op_var(head);
    f.assign(dst, src);
    f.at(10);
    let dst = f.op_var(head);
    let src = f.op_field(t, 0);
    f.assign(dst, src);
    f.at(11);
    let arg = f.op_var(t);
    f.call(None, free, vec![arg]).jmp(freehead);

    f.switch_to(exit).at(13).ret(None);
    let main = f.finish();

    (Arc::new(p.build()), main, loophead)
}

#[test]
fn scenario_sls_construction_and_teardown() {
    let (stor, main, loophead) = sls_program();

    let config = AnalyzerConfig::new().with_step_budget(5_000);
    let mut ctx = EngineCtx::new(config);
    let mut reports = CollectedReports::new();
    let (states, complete) = exec_fnc_with_states(&mut ctx, &stor, main, &mut reports);

    assert!(complete);
    assert!(reports.is_empty(), "unexpected reports: {:?}", reports);

    // the building loop's head converges to a single possibly-empty SLS
    let state = states.state(loophead).expect("loop head was never reached");
    assert_eq!(state.size(), 1);

    let sh = state.get(0);
    let has_sls = (0..sh.cnt_objs() as u32).any(|i| {
        let obj = shale::heap::ObjId(i);
        sh.obj_kind(obj) == ObjKind::Sls && sh.seg_min_length(obj) == 0
    });
    assert!(has_sls, "no possibly-empty SLS at the loop head");
}

#[test]
fn scenario_sls_converges_under_every_scheduler() {
    for kind in [
        SchedulerKind::Fifo,
        SchedulerKind::Lifo,
        SchedulerKind::PrioritizedLifo,
        SchedulerKind::LoadDriven,
    ] {
        let (stor, main, _) = sls_program();
        let config = AnalyzerConfig::new()
            .with_scheduler(kind)
            .with_step_budget(5_000);
        let mut ctx = EngineCtx::new(config);
        let mut reports = CollectedReports::new();
        let (_, complete) = exec_fnc_with_states(&mut ctx, &stor, main, &mut reports);

        assert!(complete, "scheduler {:?} did not drain", kind);
        assert!(
            reports.is_empty(),
            "scheduler {:?} produced {:?}",
            kind,
            reports
        );
    }
}

/// p = malloc(8); free(p); free(p);
#[test]
fn scenario_double_free() {
    let mut p = ProgramBuilder::new();
    let void = p.types().void();
    let i64t = p.types().int(8);
    let pi64 = p.types().ptr(i64t);
    let malloc = p.extern_fnc("malloc", pi64);
    let free = p.extern_fnc("free", void);

    let mut f = p.fnc("main", void);
    let vp = f.local("p", pi64);
    f.block("entry");
    f.at(2);
    let dst = f.op_var(vp);
    let size = f.op_int(8);
    f.call(Some(dst), malloc, vec![size]);
    f.at(3);
    let arg = f.op_var(vp);
    f.call(None, free, vec![arg]);
    f.at(4);
    let arg = f.op_var(vp);
    f.call(None, free, vec![arg]);
    f.at(5).ret(None);
    f.finish();

    let result = analyze_storage(AnalyzerConfig::new(), Arc::new(p.build()));
    assert!(result.complete);
    assert_eq!(kinds(&result.reports), vec![ErrorKind::DoubleFree]);
    assert_eq!(result.reports.as_slice()[0].loc.line, 4);
}

/// Prepend-build a doubly-linked list, walk it from the most recent node,
/// then tear it down.
fn dls_program() -> (Arc<Storage>, FncId, BlockId) {
    let mut p = ProgramBuilder::new();
    let void = p.types().void();
    let i64t = p.types().int(8);
    let (_, node_ptr) = dnode_type(&mut p);
    let malloc = p.extern_fnc("malloc", node_ptr);
    let free = p.extern_fnc("free", void);
    let nondet = p.extern_fnc("nondet", i64t);

    let mut f = p.fnc("main", void);
    let head = f.local("head", node_ptr);
    let n = f.local("n", node_ptr);
    let w = f.local("w", node_ptr);
    let t = f.local("t", node_ptr);
    let x = f.local("x", i64t);

    let entry = f.block("entry");
    let bhead = f.block("bhead");
    let bbody = f.block("bbody");
    let fix = f.block("fix");
    let sethead = f.block("sethead");
    let winit = f.block("winit");
    let whead = f.block("whead");
    let wbody = f.block("wbody");
    let fhead = f.block("fhead");
    let fbody = f.block("fbody");
    let done = f.block("done");

    f.switch_to(entry).at(2);
    let dst = f.op_var(head);
    let null = f.op_null();
    f.assign(dst, null).jmp(bhead);

    f.switch_to(bhead).at(3);
    let dst = f.op_var(x);
    f.call(Some(dst), nondet, vec![]);
    let cond = f.op_var(x);
    f.cond(cond, bbody, winit);

    f.switch_to(bbody).at(4);
    let dst = f.op_var(n);
    let size = f.op_int(24);
    f.call(Some(dst), malloc, vec![size]);
    f.at(5);
    let next = f.op_field(n, 0);
    let src = f.op_var(head);
    f.assign(next, src);
    f.at(6);
    let prev = f.op_field(n, 8);
    let null = f.op_null();
    f.assign(prev, null);
    let cond = f.op_var(head);
    f.cond(cond, fix, sethead);

    f.switch_to(fix).at(7);
    let back = f.op_field(head, 8);
    let src = f.op_var(n);
    f.assign(back, src).jmp(sethead);

    f.switch_to(sethead).at(8);
    let dst = f.op_var(head);
    let src = f.op_var(n);
    f.assign(dst, src).jmp(bhead);

    f.switch_to(winit).at(10);
    let dst = f.op_var(w);
    let src = f.op_var(head);
    f.assign(dst, src).jmp(whead);

    f.switch_to(whead).at(11);
    let cond = f.op_var(w);
    f.cond(cond, wbody, fhead);

    f.switch_to(wbody).at(12);
    let dst = f.op_var(w);
    let src = f.op_field(w, 0);
    f.assign(dst, src).jmp(whead);

    f.switch_to(fhead).at(14);
    let cond = f.op_var(head);
    f.cond(cond, fbody, done);

    f.switch_to(fbody).at(15);
    let dst = f.op_var(t);
    let src = f.op_var(head);
    f.assign(dst, src);
    let dst = f.op_var(head);
    let src = f.op_field(t, 0);
    f.assign(dst, src);
    let arg = f.op_var(t);
    f.call(None, free, vec![arg]).jmp(fhead);

    f.switch_to(done).at(17).ret(None);
    let main = f.finish();

    (Arc::new(p.build()), main, whead)
}

#[test]
fn scenario_dls_walk() {
    let (stor, main, whead) = dls_program();

    let config = AnalyzerConfig::new().with_step_budget(10_000);
    let mut ctx = EngineCtx::new(config);
    let mut reports = CollectedReports::new();
    let (states, _) = exec_fnc_with_states(&mut ctx, &stor, main, &mut reports);

    assert!(reports.is_empty(), "unexpected reports: {:?}", reports);

    // the walk's loop head sees the list as a possibly-empty DLS with the
    // discovered binding offsets
    let state = states.state(whead).expect("walk head was never reached");
    let mut found = false;
    for sh in state.iter() {
        for i in 0..sh.cnt_objs() as u32 {
            let obj = shale::heap::ObjId(i);
            if sh.obj_kind(obj) != ObjKind::Dls || sh.seg_min_length(obj) != 0 {
                continue;
            }
            let binding = sh.seg_binding(obj).expect("a DLS always carries a binding");
            if binding.next == 0 && binding.prev == Some(8) {
                found = true;
            }
        }
    }
    assert!(found, "no possibly-empty DLS at the walk's loop head");
}

/// p = malloc(8); if (nondet) free(p); y = *p; free(p);
#[test]
fn scenario_use_after_free_on_one_branch() {
    let mut p = ProgramBuilder::new();
    let void = p.types().void();
    let i64t = p.types().int(8);
    let pi64 = p.types().ptr(i64t);
    let malloc = p.extern_fnc("malloc", pi64);
    let free = p.extern_fnc("free", void);
    let nondet = p.extern_fnc("nondet", i64t);

    let mut f = p.fnc("main", void);
    let vp = f.local("p", pi64);
    let vx = f.local("x", i64t);
    let vy = f.local("y", i64t);

    let entry = f.block("entry");
    let do_free = f.block("do_free");
    let merge = f.block("merge");

    f.switch_to(entry).at(2);
    let dst = f.op_var(vp);
    let size = f.op_int(8);
    f.call(Some(dst), malloc, vec![size]);
    f.at(3);
    let dst = f.op_var(vx);
    f.call(Some(dst), nondet, vec![]);
    let cond = f.op_var(vx);
    f.cond(cond, do_free, merge);

    f.switch_to(do_free).at(4);
    let arg = f.op_var(vp);
    f.call(None, free, vec![arg]).jmp(merge);

    f.switch_to(merge).at(6);
    let dst = f.op_var(vy);
    let src = f.op_deref(vp);
    f.assign(dst, src);
    f.at(7);
    let arg = f.op_var(vp);
    f.call(None, free, vec![arg]);
    f.at(8).ret(None);
    f.finish();

    let result = analyze_storage(AnalyzerConfig::new(), Arc::new(p.build()));
    assert!(result.complete);

    // the freed and the live heap cannot join, so the read reports exactly
    // once, from the freed branch
    assert_eq!(kinds(&result.reports), vec![ErrorKind::UseAfterFree]);
    assert_eq!(result.reports.as_slice()[0].loc.line, 6);
}
