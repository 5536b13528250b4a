//! Shale: a shape analyzer for pointer-manipulating programs
//!
//! The engine interprets a control-flow-graph program (see `shale-ir`)
//! abstractly over *symbolic heaps*, graphs of objects, fields and
//! abstract values with list-segment abstraction, and reports memory
//! safety violations: invalid dereferences, invalid and double frees,
//! leaks, use-after-free and uninitialized reads.
//!
//! The abstract domain lives in [`heap`], its two comparators in [`cmp`]
//! (isomorphism) and [`join`] (entailment and widening), the fixed-point
//! plumbing in [`state`], [`sched`] and [`exec`]. Provenance of every heap
//! is tracked in [`trace`] so that a report can be walked back to source
//! locations.
//!
//! ```rust,ignore
//! use shale::{analyze_storage, AnalyzerConfig};
//!
//! let result = analyze_storage(AnalyzerConfig::new(), storage);
//! for report in result.reports.as_slice() {
//!     eprintln!("{}", report);
//! }
//! ```

pub mod cmp;
pub mod config;
pub mod cut;
pub mod exec;
pub mod heap;
pub mod join;
pub mod plot;
pub mod proc;
pub mod report;
pub mod sched;
pub mod seg;
pub mod state;
pub mod trace;

pub use cmp::are_equal;
pub use config::{AnalyzerConfig, JoinPolicy, LiveOrdering, SchedulerKind};
pub use cut::{join_heaps_by_cvars, split_heap_by_cvars};
pub use exec::{
    AnalysisResult, BuiltinTransfer, Transfer, analyze_storage, exec_fnc, exec_fnc_with_states,
    exec_fnc_with_transfer,
};
pub use heap::{CVar, SymHeap};
pub use join::{JoinResult, JoinStatus, join_sym_heaps};
pub use report::{CollectedReports, EngineError, ErrorKind, Report, ReportSink};
pub use state::{StateMap, SymState};
pub use trace::TraceGraph;

/// Everything process-wide the engine needs: the configuration record
/// (read-only after construction) and the shared trace graph. Passing the
/// context explicitly keeps the engine free of global mutable state.
#[derive(Debug)]
pub struct EngineCtx {
    pub config: AnalyzerConfig,
    pub trace: TraceGraph,
}

impl EngineCtx {
    pub fn new(config: AnalyzerConfig) -> Self {
        EngineCtx {
            config,
            trace: TraceGraph::new(),
        }
    }
}
