//! Diagnostics channel.
//!
//! The core emits no user-facing text. Everything it finds is reported
//! through the [`Observer`] passed to a run: a three-valued [`Verdict`] for
//! each checked [`Problem`], plus hooks before assignments, conditional
//! jumps, initializer ends and expression results.
//!
//! [`ProblemCollector`] is a ready-made observer aggregating verdicts over
//! all explored paths.

use std::collections::BTreeMap;

use crate::fact::{Fact, Nullability};
use crate::runner::Outcome;
use crate::state::MemoryState;
use crate::types::{Anchor, ValueId};

/// A checked defect condition, tied to a source anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Problem {
    NullDereference(Anchor),
    NullableArgument(Anchor),
    ArrayIndex(Anchor),
    ClassCast(Anchor),
    /// Modification of an unmodifiable value, either as call receiver or as argument.
    Mutability { anchor: Anchor, receiver: bool },
    UnsatisfiedCondition(Anchor),
}

impl Problem {
    pub fn anchor(&self) -> Anchor {
        match self {
            Problem::NullDereference(a)
            | Problem::NullableArgument(a)
            | Problem::ArrayIndex(a)
            | Problem::ClassCast(a)
            | Problem::UnsatisfiedCondition(a) => *a,
            Problem::Mutability { anchor, .. } => *anchor,
        }
    }

    fn is_nullability(&self) -> bool {
        matches!(self, Problem::NullDereference(_) | Problem::NullableArgument(_))
    }
}

/// Outcome of checking a problem on one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    AlwaysFails,
    NeverFails,
    Unsure,
}

pub trait Observer {
    fn on_condition(&mut self, _problem: Problem, _value: ValueId, _fact: &Fact, _verdict: Verdict, _state: &MemoryState) {}

    fn before_assignment(&mut self, _source: ValueId, _dest: ValueId, _state: &MemoryState) {}

    fn before_conditional_jump(&mut self, _anchor: Anchor, _taken: bool) {}

    fn before_initializer_end(&mut self, _is_static: bool, _state: &MemoryState) {}

    fn before_expression_push(&mut self, _value: ValueId, _anchor: Anchor, _state: &MemoryState) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl Observer for NullObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Fails on every path reaching it.
    Definite,
    /// Fails on some path, or involves a value declared nullable.
    Possible,
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    always: usize,
    never: usize,
    unsure: usize,
    unsure_nullable: usize,
}

/// Aggregates verdicts per problem over all paths.
#[derive(Debug, Clone, Default)]
pub struct ProblemCollector {
    tallies: BTreeMap<Problem, Tally>,
}

impl ProblemCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn severity(&self, problem: &Problem) -> Option<Severity> {
        let t = self.tallies.get(problem)?;
        if t.always > 0 && t.never == 0 && t.unsure == 0 {
            Some(Severity::Definite)
        } else if t.always > 0 || t.unsure_nullable > 0 {
            Some(Severity::Possible)
        } else {
            None
        }
    }

    /// Every problem reported as definite or possible.
    pub fn problems(&self) -> BTreeMap<Problem, Severity> {
        self.tallies
            .keys()
            .filter_map(|p| self.severity(p).map(|s| (*p, s)))
            .collect()
    }

    /// Whether the problem was checked at all.
    pub fn was_checked(&self, problem: &Problem) -> bool {
        self.tallies.contains_key(problem)
    }
}

impl Observer for ProblemCollector {
    fn on_condition(&mut self, problem: Problem, _value: ValueId, fact: &Fact, verdict: Verdict, _state: &MemoryState) {
        let tally = self.tallies.entry(problem).or_default();
        match verdict {
            Verdict::AlwaysFails => tally.always += 1,
            Verdict::NeverFails => tally.never += 1,
            Verdict::Unsure => {
                tally.unsure += 1;
                if problem.is_nullability() && fact.nullability() == Nullability::Nullable {
                    tally.unsure_nullable += 1;
                }
            }
        }
    }
}

/// Diagnostics the caller may trust for a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    pub outcome: Outcome,
    pub problems: BTreeMap<Problem, Severity>,
}

impl Diagnostics {
    /// Only a completed run yields diagnostics; an incomplete one reports none.
    pub fn for_outcome(outcome: Outcome, collector: &ProblemCollector) -> Self {
        let problems = if outcome == Outcome::Ok {
            collector.problems()
        } else {
            BTreeMap::new()
        };
        Self { outcome, problems }
    }

    pub fn severity(&self, problem: &Problem) -> Option<Severity> {
        self.problems.get(problem).copied()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn report(c: &mut ProblemCollector, problem: Problem, fact: Fact, verdict: Verdict) {
        c.on_condition(problem, ValueId::new(0), &fact, verdict, &MemoryState::new());
    }

    #[test]
    fn test_definite_requires_every_path_to_fail() {
        let mut c = ProblemCollector::new();
        let p = Problem::ArrayIndex(Anchor(1));
        report(&mut c, p, Fact::int(0), Verdict::AlwaysFails);
        assert_eq!(c.severity(&p), Some(Severity::Definite));
        report(&mut c, p, Fact::int(0), Verdict::NeverFails);
        assert_eq!(c.severity(&p), Some(Severity::Possible));
    }

    #[test]
    fn test_unsure_reported_only_for_nullable() {
        let mut c = ProblemCollector::new();
        let unknown = Problem::NullDereference(Anchor(1));
        let nullable = Problem::NullDereference(Anchor(2));
        report(&mut c, unknown, Fact::unknown_ref(), Verdict::Unsure);
        report(&mut c, nullable, Fact::nullable(), Verdict::Unsure);
        assert_eq!(c.severity(&unknown), None);
        assert!(c.was_checked(&unknown));
        assert_eq!(c.severity(&nullable), Some(Severity::Possible));
    }

    #[test]
    fn test_incomplete_run_discards_diagnostics() {
        let mut c = ProblemCollector::new();
        let p = Problem::ClassCast(Anchor(3));
        report(&mut c, p, Fact::unknown_ref(), Verdict::AlwaysFails);
        assert_eq!(Diagnostics::for_outcome(Outcome::Ok, &c).problems.len(), 1);
        assert!(Diagnostics::for_outcome(Outcome::TooComplex, &c).problems.is_empty());
        assert!(Diagnostics::for_outcome(Outcome::Aborted, &c).problems.is_empty());
    }
}
