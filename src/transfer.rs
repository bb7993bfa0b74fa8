//! Non-local control transfers.
//!
//! Exceptions, `return` from nested blocks and similar jumps leave the
//! regular fallthrough/branch structure of the flow. Transfer functions hand
//! such jumps to a [`ControlTransferHandler`], which decides where the state
//! continues.

use std::fmt;

use crate::fact::Ty;
use crate::instruction::InstructionState;
use crate::state::MemoryState;
use crate::value::ValueFactory;

/// A `catch` clause reachable from the transfer point, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchClause {
    pub caught: Ty,
    pub target: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    /// Leave the analyzed block.
    Exit,
    /// Jump to a statement-level instruction, discarding the operand stack.
    Goto(usize),
    /// Throw an exception of the given type.
    Throw { exception: Ty, catches: Vec<CatchClause> },
}

impl Transfer {
    /// Indices this transfer may continue at.
    pub fn targets(&self) -> Vec<usize> {
        match self {
            Transfer::Exit => Vec::new(),
            Transfer::Goto(target) => vec![*target],
            Transfer::Throw { catches, .. } => catches.iter().map(|c| c.target).collect(),
        }
    }

    pub fn throw(exception: Ty) -> Self {
        Transfer::Throw {
            exception,
            catches: Vec::new(),
        }
    }
}

impl fmt::Display for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transfer::Exit => write!(f, "exit"),
            Transfer::Goto(target) => write!(f, "goto {}", target),
            Transfer::Throw { exception, catches } => {
                write!(f, "throw {}", exception)?;
                for c in catches {
                    write!(f, " [{} -> {}]", c.caught, c.target)?;
                }
                Ok(())
            }
        }
    }
}

/// Resolves a transfer into successor states.
pub trait ControlTransferHandler {
    fn dispatch(&mut self, state: MemoryState, transfer: &Transfer, factory: &mut ValueFactory) -> Vec<InstructionState>;
}

/// Resolves transfers using only the catch clauses listed in the transfer.
///
/// A clause catching a supertype of the thrown type definitely catches it
/// and ends the search; a clause catching a subtype may catch it, so both
/// that clause and the outer ones are explored.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransferHandler;

impl ControlTransferHandler for DefaultTransferHandler {
    fn dispatch(&mut self, mut state: MemoryState, transfer: &Transfer, _factory: &mut ValueFactory) -> Vec<InstructionState> {
        state.clear_stack();
        match transfer {
            Transfer::Exit => Vec::new(),
            Transfer::Goto(target) => vec![InstructionState::new(*target, state)],
            Transfer::Throw { exception, catches } => {
                let mut result = Vec::new();
                for clause in catches {
                    if exception.is_subtype_of(&clause.caught) {
                        result.push(InstructionState::new(clause.target, state));
                        return result;
                    }
                    if clause.caught.is_subtype_of(exception) {
                        result.push(InstructionState::new(clause.target, state.clone()));
                    }
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn runtime_exception() -> Ty {
        Ty::class("java.lang.RuntimeException", &["java.lang.Exception", "java.lang.Throwable"])
    }

    fn npe() -> Ty {
        Ty::class(
            "java.lang.NullPointerException",
            &["java.lang.RuntimeException", "java.lang.Exception", "java.lang.Throwable"],
        )
    }

    #[test]
    fn test_definite_catch_stops_search() {
        let mut factory = ValueFactory::new();
        let transfer = Transfer::Throw {
            exception: npe(),
            catches: vec![
                CatchClause {
                    caught: runtime_exception(),
                    target: 7,
                },
                CatchClause {
                    caught: Ty::class("java.lang.Throwable", &[]),
                    target: 9,
                },
            ],
        };
        let mut state = MemoryState::new();
        state.push(factory.unknown());
        let result = DefaultTransferHandler.dispatch(state, &transfer, &mut factory);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].index, 7);
        assert!(result[0].state.is_empty_stack());
    }

    #[test]
    fn test_possible_catch_continues() {
        let mut factory = ValueFactory::new();
        let transfer = Transfer::Throw {
            exception: runtime_exception(),
            catches: vec![CatchClause { caught: npe(), target: 3 }],
        };
        let result = DefaultTransferHandler.dispatch(MemoryState::new(), &transfer, &mut factory);
        assert_eq!(result.iter().map(|s| s.index).collect::<Vec<_>>(), vec![3]);
        assert!(DefaultTransferHandler
            .dispatch(MemoryState::new(), &Transfer::Exit, &mut factory)
            .is_empty());
    }
}
