//! Internal faults of the analysis.
//!
//! These never escape a run: the runner converts them into
//! [`Outcome::Aborted`][crate::runner::Outcome::Aborted].

use std::fmt;

/// Malformed-IR conditions detected during validation or dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    /// An instruction popped from an empty operand stack.
    StackUnderflow { index: usize },
    /// A jump targets an index outside of the flow.
    InvalidJump { index: usize, target: usize },
    /// Two paths reach the same instruction with different stack depths.
    StackMismatch { index: usize, expected: usize, found: usize },
    /// The flow has no instructions.
    EmptyFlow,
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::StackUnderflow { index } => {
                write!(f, "stack underflow at instruction {}", index)
            }
            AnalysisError::InvalidJump { index, target } => {
                write!(f, "instruction {} jumps to invalid target {}", index, target)
            }
            AnalysisError::StackMismatch { index, expected, found } => {
                write!(
                    f,
                    "inconsistent stack depth at instruction {}: expected {}, found {}",
                    index, expected, found
                )
            }
            AnalysisError::EmptyFlow => write!(f, "control flow has no instructions"),
        }
    }
}

impl std::error::Error for AnalysisError {}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_display() {
        let e = AnalysisError::StackMismatch {
            index: 4,
            expected: 1,
            found: 2,
        };
        assert_eq!(e.to_string(), "inconsistent stack depth at instruction 4: expected 1, found 2");
        assert_eq!(
            AnalysisError::StackUnderflow { index: 0 }.to_string(),
            "stack underflow at instruction 0"
        );
    }
}
