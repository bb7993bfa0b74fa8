//! Runner tunables and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration of a [`DataFlowRunner`][crate::runner::DataFlowRunner].
///
/// The bounds trade precision for termination: whichever fires first turns
/// the run into [`Outcome::TooComplex`][crate::runner::Outcome::TooComplex].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use dfa_rs::config::RunnerConfig;
///
/// let config = RunnerConfig::default()
///     .with_deterministic(true)
///     .with_time_limit(Duration::from_secs(1));
/// assert_eq!(config.max_branches, 80);
/// assert!(config.deterministic);
/// ```
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Flows with more branching instructions are rejected up front (default: 80).
    pub max_branches: usize,
    /// Distinct states processed per branching instruction (default: 300).
    pub max_states_per_branch: usize,
    /// Wall-clock limit of one run (default: 10 seconds).
    pub time_limit: Duration,
    /// Test mode: the wall-clock limit is not enforced (default: false).
    pub deterministic: bool,
    /// Ceiling on live plus finished states while expanding call contracts (default: 100).
    pub contract_complexity_limit: usize,
    /// Prune paths that dereference a definitely-null value (default: false).
    pub stop_on_null_dereference: bool,
    /// Longest string constant produced by folding a concatenation (default: 1024).
    pub max_string_length_to_track: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_branches: 80,
            max_states_per_branch: 300,
            time_limit: Duration::from_secs(10),
            deterministic: false,
            contract_complexity_limit: 100,
            stop_on_null_dereference: false,
            max_string_length_to_track: 1024,
        }
    }
}

impl RunnerConfig {
    pub fn with_max_branches(mut self, max_branches: usize) -> Self {
        self.max_branches = max_branches;
        self
    }

    pub fn with_max_states_per_branch(mut self, max_states: usize) -> Self {
        self.max_states_per_branch = max_states;
        self
    }

    pub fn with_time_limit(mut self, time_limit: Duration) -> Self {
        self.time_limit = time_limit;
        self
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn with_contract_complexity_limit(mut self, limit: usize) -> Self {
        self.contract_complexity_limit = limit;
        self
    }

    pub fn with_stop_on_null_dereference(mut self, stop: bool) -> Self {
        self.stop_on_null_dereference = stop;
        self
    }

    pub fn with_max_string_length_to_track(mut self, max_length: usize) -> Self {
        self.max_string_length_to_track = max_length;
        self
    }
}

/// Cooperative cancellation signal shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
