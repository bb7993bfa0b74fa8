//! Worklist driver.
//!
//! [`DataFlowRunner::analyze`] explores every feasible path of a
//! [`ControlFlow`] breadth-first. Paths are never merged; termination comes
//! from deduplication at branching instructions (a state already processed
//! there is not enqueued again) and from three bounds:
//!
//! - the number of branching instructions, checked before exploring;
//! - the number of distinct states processed at one branching instruction;
//! - a wall-clock deadline (not enforced in deterministic mode).
//!
//! A bound firing yields [`Outcome::TooComplex`]; cancellation and malformed
//! input yield [`Outcome::Aborted`]. Only an [`Outcome::Ok`] run explored
//! every path, so only then are [`DataFlowRunner::const_conditions`]
//! meaningful.
//!
//! ```
//! use dfa_rs::config::RunnerConfig;
//! use dfa_rs::instruction::{ControlFlow, Instruction};
//! use dfa_rs::observer::NullObserver;
//! use dfa_rs::runner::{DataFlowRunner, Outcome};
//!
//! let mut runner = DataFlowRunner::new(RunnerConfig::default().with_deterministic(true));
//! let outcome = runner.analyze(
//!     &|_: &mut dfa_rs::value::ValueFactory| Some(ControlFlow::new(vec![Instruction::Return])),
//!     &mut NullObserver,
//! );
//! assert_eq!(outcome, Outcome::Ok);
//! ```

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Instant;

use log::{debug, error, warn};

use crate::config::{CancellationToken, RunnerConfig};
use crate::contract::{MetadataOracle, StaticMetadata};
use crate::fact::Fact;
use crate::instruction::{ControlFlow, InstructionState};
use crate::observer::Observer;
use crate::state::MemoryState;
use crate::transfer::{ControlTransferHandler, DefaultTransferHandler};
use crate::types::ClosureId;
use crate::value::ValueFactory;
use crate::visitor::{InstructionVisitor, RunRecord};

/// Terminal classification of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Every feasible path was explored.
    Ok,
    /// A complexity bound fired; results are incomplete.
    TooComplex,
    /// Cancelled, or the input was malformed.
    Aborted,
    /// There was nothing to analyze.
    NotApplicable,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Ok => "OK",
            Outcome::TooComplex => "TOO_COMPLEX",
            Outcome::Aborted => "ABORTED",
            Outcome::NotApplicable => "NOT_APPLICABLE",
        };
        write!(f, "{}", s)
    }
}

/// Produces the analyzed flow, interning its values in the run's factory.
///
/// Returning `None` means there is no analyzable body.
pub trait FlowBuilder {
    fn build(&self, factory: &mut ValueFactory) -> Option<ControlFlow>;
}

impl<F> FlowBuilder for F
where
    F: Fn(&mut ValueFactory) -> Option<ControlFlow>,
{
    fn build(&self, factory: &mut ValueFactory) -> Option<ControlFlow> {
        self(factory)
    }
}

/// Branching instructions whose boolean outcome never varied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConstConditions {
    pub always_true: BTreeSet<usize>,
    pub always_false: BTreeSet<usize>,
}

pub struct DataFlowRunner {
    config: RunnerConfig,
    cancellation: CancellationToken,
    oracle: Box<dyn MetadataOracle>,
    handler: Box<dyn ControlTransferHandler>,
    factory: ValueFactory,
    flow: Option<ControlFlow>,
    record: RunRecord,
    outcome: Option<Outcome>,
}

impl Default for DataFlowRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl DataFlowRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            cancellation: CancellationToken::new(),
            oracle: Box::new(StaticMetadata::new()),
            handler: Box::new(DefaultTransferHandler),
            factory: ValueFactory::new(),
            flow: None,
            record: RunRecord::default(),
            outcome: None,
        }
    }

    pub fn with_oracle(mut self, oracle: Box<dyn MetadataOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_transfer_handler(mut self, handler: Box<dyn ControlTransferHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// A handle that cancels this runner when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Analyzes the flow produced by `builder`, reporting to `observer`.
    pub fn analyze(&mut self, builder: &dyn FlowBuilder, observer: &mut dyn Observer) -> Outcome {
        self.factory = ValueFactory::new();
        self.record = RunRecord::default();
        self.flow = None;

        let outcome = match builder.build(&mut self.factory) {
            Some(flow) => {
                let outcome = self.run(&flow, observer);
                self.flow = Some(flow);
                outcome
            }
            None => {
                debug!("Nothing to analyze");
                Outcome::NotApplicable
            }
        };
        self.outcome = Some(outcome);
        outcome
    }

    fn run(&mut self, flow: &ControlFlow, observer: &mut dyn Observer) -> Outcome {
        let branches = flow.branch_count();
        if branches > self.config.max_branches {
            warn!(
                "Too complex: {} branching instructions, limit is {}",
                branches, self.config.max_branches
            );
            return Outcome::TooComplex;
        }
        if let Err(e) = flow.validate() {
            error!("Malformed flow: {}", e);
            return Outcome::Aborted;
        }
        debug!("Analyzing flow of {} instructions:\n{}", flow.len(), flow);

        let mut initial = MemoryState::new();
        for &param in flow.not_null_params() {
            if !initial.meet_fact(&self.factory, param, &Fact::not_null()) {
                debug!("Not-null parameter {} is always null, nothing is reachable", param);
                return Outcome::Ok;
            }
        }

        let deadline = Instant::now() + self.config.time_limit;
        let mut queue = VecDeque::from([InstructionState::new(0, initial)]);
        let mut processed: HashMap<usize, HashSet<MemoryState>> = HashMap::new();
        let mut visitor = InstructionVisitor::new(&self.config, self.oracle.as_ref(), self.handler.as_mut(), observer);

        let outcome = loop {
            let Some(item) = queue.pop_front() else {
                break Outcome::Ok;
            };
            if self.cancellation.is_cancelled() {
                debug!("Cancelled with {} items queued", queue.len() + 1);
                break Outcome::Aborted;
            }
            if !self.config.deterministic && Instant::now() > deadline {
                warn!("Too complex: time limit of {:?} exceeded", self.config.time_limit);
                break Outcome::TooComplex;
            }
            let Some(instruction) = flow.get(item.index) else {
                continue;
            };
            debug!("{}: {} {}", item.index, instruction, item.state.render(&self.factory));

            if instruction.is_branching() {
                let seen = processed.entry(item.index).or_default();
                if seen.contains(&item.state) {
                    continue;
                }
                if seen.len() > self.config.max_states_per_branch {
                    warn!(
                        "Too complex: more than {} states at #{}",
                        self.config.max_states_per_branch, item.index
                    );
                    break Outcome::TooComplex;
                }
                seen.insert(item.state.clone());
            }

            let successors = match visitor.visit(&mut self.factory, flow, item.index, item.state) {
                Ok(successors) => successors,
                Err(e) => {
                    error!("Analysis aborted: {}", e);
                    break Outcome::Aborted;
                }
            };
            for mut successor in successors {
                let already_seen = flow.get(successor.index).is_some_and(|next| next.is_branching())
                    && processed
                        .get(&successor.index)
                        .is_some_and(|seen| seen.contains(&successor.state));
                if already_seen {
                    continue;
                }
                successor.distance = item.distance + 1;
                queue.push_back(successor);
            }
        };

        self.record = visitor.into_record();
        outcome
    }

    /// Outcome of the last run, if any.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Anchored branching instructions whose outcome was the same on every
    /// non-ephemeral path. Empty unless the last run completed.
    pub fn const_conditions(&self) -> ConstConditions {
        let mut result = ConstConditions::default();
        let (Some(Outcome::Ok), Some(flow)) = (self.outcome, &self.flow) else {
            return result;
        };
        for (&index, reach) in &self.record.reach {
            if flow.get(index).and_then(|i| i.anchor()).is_none() {
                continue;
            }
            match (reach.true_reached, reach.false_reached) {
                (true, false) => {
                    result.always_true.insert(index);
                }
                (false, true) => {
                    result.always_false.insert(index);
                }
                _ => {}
            }
        }
        result
    }

    /// `instanceof` instructions that can narrow a type on some path.
    pub fn useful_instanceofs(&self) -> &BTreeSet<usize> {
        &self.record.useful_instanceofs
    }

    /// States observed by a closure when it was created.
    pub fn closure_states(&self, closure: ClosureId) -> &[MemoryState] {
        self.record.closures.get(&closure).map_or(&[], |s| s.as_slice())
    }

    /// Values of the last run.
    pub fn factory(&self) -> &ValueFactory {
        &self.factory
    }

    /// Flow of the last run.
    pub fn flow(&self) -> Option<&ControlFlow> {
        self.flow.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::instruction::Instruction;
    use crate::observer::NullObserver;
    use crate::types::Anchor;

    fn deterministic() -> DataFlowRunner {
        DataFlowRunner::new(RunnerConfig::default().with_deterministic(true))
    }

    #[test]
    fn test_no_flow_is_not_applicable() {
        let mut runner = deterministic();
        let outcome = runner.analyze(&|_: &mut ValueFactory| None, &mut NullObserver);
        assert_eq!(outcome, Outcome::NotApplicable);
        assert!(runner.flow().is_none());
    }

    #[test]
    fn test_malformed_flow_is_aborted() {
        let mut runner = deterministic();
        let outcome = runner.analyze(
            &|_: &mut ValueFactory| Some(ControlFlow::new(vec![Instruction::Pop])),
            &mut NullObserver,
        );
        assert_eq!(outcome, Outcome::Aborted);
        assert_eq!(runner.const_conditions(), ConstConditions::default());
    }

    #[test]
    fn test_cancelled_run_is_aborted() {
        let mut runner = deterministic();
        runner.cancellation_token().cancel();
        let outcome = runner.analyze(
            &|_: &mut ValueFactory| Some(ControlFlow::new(vec![Instruction::Return])),
            &mut NullObserver,
        );
        assert_eq!(outcome, Outcome::Aborted);
    }

    #[test]
    fn test_loop_terminates_by_dedup() {
        // while (b) {}
        let builder = |f: &mut ValueFactory| {
            let b = f.local("b", Fact::Bool(None));
            Some(ControlFlow::new(vec![
                Instruction::Push { value: b, anchor: None },
                Instruction::ConditionalGoto {
                    target: 3,
                    negated: true,
                    anchor: Some(Anchor(1)),
                },
                Instruction::Goto { target: 0 },
                Instruction::Return,
            ]))
        };
        let mut runner = deterministic();
        assert_eq!(runner.analyze(&builder, &mut NullObserver), Outcome::Ok);
        assert_eq!(runner.const_conditions(), ConstConditions::default());
    }

    #[test]
    fn test_constant_condition_classified() {
        // if (true) ...
        let builder = |f: &mut ValueFactory| {
            let t = f.bool_value(true);
            Some(ControlFlow::new(vec![
                Instruction::Push { value: t, anchor: None },
                Instruction::ConditionalGoto {
                    target: 3,
                    negated: false,
                    anchor: Some(Anchor(1)),
                },
                Instruction::Return,
                Instruction::Return,
            ]))
        };
        let mut runner = deterministic();
        assert_eq!(runner.analyze(&builder, &mut NullObserver), Outcome::Ok);
        let conditions = runner.const_conditions();
        assert_eq!(conditions.always_true, BTreeSet::from([1]));
        assert!(conditions.always_false.is_empty());
    }
}
