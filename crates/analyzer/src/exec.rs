//! Fixed-point driver
//!
//! One function is analyzed by seeding its entry block with a fresh heap
//! (globals materialized and zero-initialized, one stack frame) and then
//! pumping the scheduler: take a waiting block, interpret every pending
//! heap of its state, offer the outgoing heaps to the successor states,
//! and re-schedule the successors that changed. Widening is permitted
//! exactly on edges that close a loop, so every per-block state chain
//! stabilizes and the scheduler drains.

use crate::config::AnalyzerConfig;
use crate::heap::{CVar, SymHeap, UniformBlock, ValId};
use crate::proc::{FncProc, exec_block};
use crate::report::{CollectedReports, EngineError, ReportSink};
use crate::sched::BlockScheduler;
use crate::state::StateMap;
use crate::EngineCtx;
use shale_ir::{FncId, LoopEdges, Storage};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one whole-program analysis.
#[derive(Debug)]
pub struct AnalysisResult {
    pub reports: CollectedReports,
    /// False when a depth or step budget cut the exploration short.
    pub complete: bool,
    /// The provenance graph the reports' trace ids resolve against.
    pub trace: crate::trace::TraceGraph,
}

/// Analyze every entry point of the program: `main` when defined,
/// otherwise every defined function as a virtual root.
pub fn analyze_storage(config: AnalyzerConfig, stor: Arc<Storage>) -> AnalysisResult {
    let mut ctx = EngineCtx::new(config);
    let mut reports = CollectedReports::new();

    if !stor.types.any_complex() {
        info!("program without complex types, assume memory safety");
        return AnalysisResult {
            reports,
            complete: true,
            trace: ctx.trace,
        };
    }

    let mut complete = true;
    match stor.fnc_by_name("main").filter(|&id| stor.fnc(id).is_defined()) {
        Some(main) => {
            complete &= exec_fnc(&mut ctx, &stor, main, &mut reports);
        }
        None => {
            warn!("main() not found at global scope");
            for id in 0..stor.fncs.len() as u32 {
                let id = FncId(id);
                if !stor.fnc(id).is_defined() {
                    continue;
                }
                debug!(fnc = %stor.fnc(id).name, "analyzing a virtual root");
                complete &= exec_fnc(&mut ctx, &stor, id, &mut reports);
            }
        }
    }

    AnalysisResult {
        reports,
        complete,
        trace: ctx.trace,
    }
}

/// The initial heap of one function: globals bound and zero-initialized,
/// plus one stack frame with every local bound at once (reads of a local
/// before its first write surface as uninitialized unknowns).
pub fn entry_heap(ctx: &mut EngineCtx, stor: &Arc<Storage>, fnc_id: FncId) -> SymHeap {
    let trace = ctx.trace.root(fnc_id);
    let mut sh = SymHeap::new(stor.clone(), trace);

    for var in stor.globals() {
        let cv = CVar::new(var, 0);
        let obj = sh.region_by_var(cv, true);
        let size = stor.types.get(stor.var(var).ty).size;
        if size > 0 {
            sh.write_uniform_block(
                obj,
                UniformBlock {
                    off: 0,
                    size,
                    tpl_value: ValId::NULL,
                },
            );
        }
    }

    for var in stor.locals_of(fnc_id) {
        sh.region_by_var(CVar::new(var, 0), true);
    }

    sh
}

/// Per-block transfer functions, the pluggable piece of the engine. The
/// engine owns scheduling, state containment and widening; the transfer
/// turns one incoming heap into the heaps offered to each successor.
pub trait Transfer {
    fn exec_block(
        &mut self,
        pc: &mut FncProc<'_>,
        reports: &mut dyn ReportSink,
        sh: SymHeap,
        bb: shale_ir::BlockId,
    ) -> Result<Vec<(shale_ir::BlockId, SymHeap)>, EngineError>;
}

/// The built-in reference transfer functions.
#[derive(Debug, Default)]
pub struct BuiltinTransfer;

impl Transfer for BuiltinTransfer {
    fn exec_block(
        &mut self,
        pc: &mut FncProc<'_>,
        reports: &mut dyn ReportSink,
        sh: SymHeap,
        bb: shale_ir::BlockId,
    ) -> Result<Vec<(shale_ir::BlockId, SymHeap)>, EngineError> {
        exec_block(pc, reports, sh, bb)
    }
}

/// Run one function to its fixed point; true when the analysis covered
/// everything within its budgets.
pub fn exec_fnc(
    ctx: &mut EngineCtx,
    stor: &Arc<Storage>,
    fnc_id: FncId,
    reports: &mut CollectedReports,
) -> bool {
    let (_, complete) = exec_fnc_with_states(ctx, stor, fnc_id, reports);
    complete
}

/// Run one function to its fixed point and expose its final per-block
/// states (kept by tests and the plotting front-end).
pub fn exec_fnc_with_states(
    ctx: &mut EngineCtx,
    stor: &Arc<Storage>,
    fnc_id: FncId,
    reports: &mut CollectedReports,
) -> (StateMap, bool) {
    exec_fnc_with_transfer(ctx, stor, fnc_id, reports, &mut BuiltinTransfer)
}

/// The driver, generic over the transfer functions.
pub fn exec_fnc_with_transfer<T: Transfer>(
    ctx: &mut EngineCtx,
    stor: &Arc<Storage>,
    fnc_id: FncId,
    reports: &mut CollectedReports,
    transfer: &mut T,
) -> (StateMap, bool) {
    let fnc = stor.fnc(fnc_id);
    let Some(entry) = fnc.entry else {
        return (StateMap::new(), true);
    };
    info!(fnc = %fnc.name, "creating fresh initial state");

    let loop_edges = LoopEdges::compute(fnc);
    let mut state_map = StateMap::new();
    let mut sched = BlockScheduler::new(ctx.config.block_scheduler_kind);

    let sh = entry_heap(ctx, stor, fnc_id);
    state_map.insert(ctx, fnc, entry, &sh, false);
    sched.schedule(entry);

    let mut steps: u64 = 0;
    let budget = ctx.config.step_budget;

    'sched: while let Some(bb) = sched.get_next(&state_map) {
        loop {
            let Some((idx, mut sh)) = state_map.state_mut(bb).take_pending() else {
                break;
            };

            if let Some(limit) = budget {
                steps += 1;
                if steps > limit {
                    warn!(limit, "step budget exhausted, analysis incomplete");
                    state_map.mark_incomplete();
                    break 'sched;
                }
            }

            // attribute everything derived from this visit to the block
            let loc = fnc
                .block(bb)
                .front()
                .map(|insn| insn.loc.clone())
                .unwrap_or_default();
            let desc = format!("{}() at basic block {}", fnc.name, fnc.block(bb).name);
            let node = ctx.trace.insn_node(sh.trace(), loc, desc);
            sh.set_trace(node);
            sh.bump_generation();
            debug!(block = %fnc.block(bb).name, idx, "interpreting a pending heap");

            let mut pc = FncProc {
                ctx: &mut *ctx,
                fnc,
                fnc_id,
            };
            let succs = match transfer.exec_block(&mut pc, reports, sh, bb) {
                Ok(succs) => succs,
                Err(err @ EngineError::Fault { .. }) => {
                    warn!(%err, "aborting the analysis of this function");
                    return (state_map, false);
                }
                Err(EngineError::BudgetExceeded { .. }) => {
                    state_map.mark_incomplete();
                    break 'sched;
                }
            };

            for (tgt, out_sh) in succs {
                let closes_loop = loop_edges.closes_loop(bb, tgt);
                if state_map.insert(ctx, fnc, tgt, &out_sh, closes_loop) {
                    sched.schedule(tgt);
                }
            }
        }
    }

    sched.print_stats(fnc);
    debug!(lookups = state_map.total_lookups(), "state lookups in total");
    let complete = !state_map.incomplete();
    (state_map, complete)
}

/// A sink forwarding every report to a caller-provided callback.
pub struct CallbackSink<F: FnMut(crate::report::Report)> {
    callback: F,
}

impl<F: FnMut(crate::report::Report)> CallbackSink<F> {
    pub fn new(callback: F) -> Self {
        CallbackSink { callback }
    }
}

impl<F: FnMut(crate::report::Report)> ReportSink for CallbackSink<F> {
    fn report(&mut self, report: crate::report::Report) {
        (self.callback)(report);
    }
}
