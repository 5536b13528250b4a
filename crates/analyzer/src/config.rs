//! Analyzer configuration
//!
//! A configuration record is read once (from TOML or built programmatically)
//! and then only read by the engine. Every knob maps onto one decision point
//! in the state containers, the scheduler or the driver.
//!
//! ```rust,ignore
//! use shale::AnalyzerConfig;
//!
//! let config = AnalyzerConfig::new()
//!     .with_join_policy(JoinPolicy::LoopWidening)
//!     .with_scheduler(SchedulerKind::LoadDriven);
//! ```

use serde::Deserialize;
use std::path::PathBuf;

/// When the state container consults the join instead of plain isomorphism.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
    /// Never join; containers only deduplicate isomorphic heaps.
    Never,
    /// Join (including three-way widening) at every insert.
    EveryInsert,
    /// Join for entailment only; a would-be three-way attempt aborts.
    EntailmentOnly,
    /// Entailment at every insert, three-way widening only where the caller
    /// flags the insert as crossing a loop-closing edge.
    #[default]
    LoopWidening,
    /// As `LoopWidening`, and additionally bypass even the isomorphism scan
    /// for straight-line blocks with a single predecessor.
    BypassIsomorphism,
}

impl JoinPolicy {
    /// Whether an insert should try joining at all, given the caller's
    /// loop-edge flag.
    pub fn join_requested(self, allow_three_way: bool) -> bool {
        match self {
            JoinPolicy::Never => false,
            JoinPolicy::EveryInsert | JoinPolicy::EntailmentOnly => true,
            JoinPolicy::LoopWidening | JoinPolicy::BypassIsomorphism => allow_three_way,
        }
    }

    /// The three-way permission actually handed to the join.
    pub fn effective_three_way(self, allow_three_way: bool) -> bool {
        match self {
            JoinPolicy::Never => false,
            JoinPolicy::EveryInsert => true,
            JoinPolicy::EntailmentOnly => false,
            JoinPolicy::LoopWidening | JoinPolicy::BypassIsomorphism => allow_three_way,
        }
    }

    pub fn bypass_isomorphism(self) -> bool {
        self == JoinPolicy::BypassIsomorphism
    }
}

/// Rotation of matched heaps to the front of their container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LiveOrdering {
    Disabled,
    /// Rotate on a successful join.
    #[default]
    OnJoin,
    /// Rotate on a successful join or isomorphism hit.
    OnLookup,
}

/// Policy of the block scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    Fifo,
    #[default]
    Lifo,
    PrioritizedLifo,
    LoadDriven,
}

/// The process-wide configuration record, read-only after initialization.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AnalyzerConfig {
    pub join_policy: JoinPolicy,
    pub state_live_ordering: LiveOrdering,
    /// Disable the replacement of a stored heap by a covering new one.
    pub forbid_heap_replace: bool,
    /// Allow in-place trace-node replacement, which may create cycles.
    pub allow_cyclic_trace_graph: bool,
    /// Refuse inserts once a heap's generation exceeds this limit; the
    /// analysis is then flagged incomplete.
    pub limit_depth: Option<u32>,
    pub block_scheduler_kind: SchedulerKind,
    /// Short-circuit heap splitting/merging by program variables.
    pub disable_sym_cut: bool,
    /// Stop after this many transferred heaps; flagged incomplete.
    pub step_budget: Option<u64>,
    /// Directory receiving heap plots; plotting is off when unset.
    pub plot_dir: Option<PathBuf>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        AnalyzerConfig {
            join_policy: JoinPolicy::default(),
            state_live_ordering: LiveOrdering::default(),
            forbid_heap_replace: false,
            allow_cyclic_trace_graph: false,
            limit_depth: None,
            block_scheduler_kind: SchedulerKind::default(),
            disable_sym_cut: false,
            step_budget: None,
            plot_dir: None,
        }
    }
}

impl AnalyzerConfig {
    pub fn new() -> Self {
        AnalyzerConfig::default()
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn with_join_policy(mut self, policy: JoinPolicy) -> Self {
        self.join_policy = policy;
        self
    }

    pub fn with_live_ordering(mut self, ordering: LiveOrdering) -> Self {
        self.state_live_ordering = ordering;
        self
    }

    pub fn with_forbid_heap_replace(mut self, forbid: bool) -> Self {
        self.forbid_heap_replace = forbid;
        self
    }

    pub fn with_cyclic_trace_graph(mut self, allow: bool) -> Self {
        self.allow_cyclic_trace_graph = allow;
        self
    }

    pub fn with_limit_depth(mut self, limit: u32) -> Self {
        self.limit_depth = Some(limit);
        self
    }

    pub fn with_scheduler(mut self, kind: SchedulerKind) -> Self {
        self.block_scheduler_kind = kind;
        self
    }

    pub fn with_disable_sym_cut(mut self, disable: bool) -> Self {
        self.disable_sym_cut = disable;
        self
    }

    pub fn with_step_budget(mut self, budget: u64) -> Self {
        self.step_budget = Some(budget);
        self
    }

    pub fn with_plot_dir(mut self, dir: PathBuf) -> Self {
        self.plot_dir = Some(dir);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_widen_on_loop_edges_only() {
        let config = AnalyzerConfig::new();
        assert_eq!(config.join_policy, JoinPolicy::LoopWidening);
        assert!(config.join_policy.join_requested(true));
        assert!(!config.join_policy.join_requested(false));
        assert!(config.join_policy.effective_three_way(true));
        assert!(!config.join_policy.effective_three_way(false));
    }

    #[test]
    fn never_policy_disables_joins_entirely() {
        let p = JoinPolicy::Never;
        assert!(!p.join_requested(true));
        assert!(!p.join_requested(false));
    }

    #[test]
    fn entailment_only_strips_three_way() {
        let p = JoinPolicy::EntailmentOnly;
        assert!(p.join_requested(false));
        assert!(!p.effective_three_way(true));
    }

    #[test]
    fn loads_from_toml() {
        let text = r#"
            join-policy = "bypass-isomorphism"
            state-live-ordering = "on-lookup"
            forbid-heap-replace = true
            limit-depth = 40
            block-scheduler-kind = "load-driven"
        "#;
        let config = AnalyzerConfig::from_toml(text).unwrap();
        assert_eq!(config.join_policy, JoinPolicy::BypassIsomorphism);
        assert!(config.join_policy.bypass_isomorphism());
        assert_eq!(config.state_live_ordering, LiveOrdering::OnLookup);
        assert!(config.forbid_heap_replace);
        assert_eq!(config.limit_depth, Some(40));
        assert_eq!(config.block_scheduler_kind, SchedulerKind::LoadDriven);
        assert!(!config.disable_sym_cut);
    }
}
