//! Flat, jump-based intermediate representation.
//!
//! A [`ControlFlow`] is a sequence of [`Instruction`]s operating on an
//! operand stack. Execution falls through to `index + 1` unless the
//! instruction jumps; reaching index `len()` ends the path normally.
//!
//! The flow is validated once before a run ([`ControlFlow::validate`]): all
//! jump targets must lie in `0..=len()`, no instruction may pop more values
//! than the stack holds, and every instruction must be reached with a single
//! consistent stack depth. After validation, transfer functions can rely on
//! the stack shape.

use std::collections::VecDeque;
use std::fmt;

use crate::error::AnalysisError;
use crate::fact::{Fact, SpecialField, Ty};
use crate::relation::RelationType;
use crate::state::MemoryState;
use crate::transfer::Transfer;
use crate::types::{Anchor, ClosureId, MethodId, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanOp {
    Relation(RelationType),
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericOp {
    Plus,
    Minus,
    Mul,
    Div,
    Rem,
}

/// Kind of nullability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullCheck {
    /// The value is dereferenced: a null value throws.
    Dereference,
    /// The value is passed where null is not expected; nothing is thrown.
    Argument,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInstruction {
    pub method: Option<MethodId>,
    /// Arguments on the stack, above the qualifier. Static calls push the unknown value as qualifier.
    pub arg_count: usize,
    /// `None` for void calls.
    pub return_type: Option<Ty>,
    pub is_constructor: bool,
    pub anchor: Option<Anchor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Push {
        value: ValueId,
        anchor: Option<Anchor>,
    },
    Pop,
    Dup,
    Goto {
        target: usize,
    },
    /// Pops a boolean; jumps to `target` if it equals `!negated`.
    ConditionalGoto {
        target: usize,
        negated: bool,
        anchor: Option<Anchor>,
    },
    Not {
        anchor: Option<Anchor>,
    },
    Return,
    EndOfInitializer {
        is_static: bool,
    },
    BooleanBinary {
        op: BooleanOp,
        anchor: Option<Anchor>,
    },
    NumericBinary {
        op: NumericOp,
        long: bool,
    },
    Negate {
        long: bool,
    },
    StringConcat,
    /// Pops the source and the destination, pushes the destination.
    Assign {
        /// Destination to restore when a flush replaced it on the stack.
        assigned: Option<ValueId>,
        initializer: bool,
        /// The array written into, for `a[i] = v`.
        array: Option<ValueId>,
        anchor: Option<Anchor>,
    },
    FlushVariable(ValueId),
    FlushFields,
    Escape(Vec<ValueId>),
    Call(CallInstruction),
    /// Pops the qualifier, pushes the functional object.
    MethodReference {
        method: Option<MethodId>,
        interface: Ty,
        anchor: Option<Anchor>,
    },
    Closure(Vec<ClosureId>),
    ControlTransfer(Transfer),
    /// Pops the length, pushes the new array.
    NewArray {
        ty: Ty,
    },
    /// Pops index and array, pushes the element.
    ArrayAccess {
        /// Fallback result when the element is not trackable.
        value: Option<ValueId>,
        out_of_bounds: Option<Transfer>,
        anchor: Option<Anchor>,
    },
    SpecialFieldRead {
        field: SpecialField,
    },
    TypeCast {
        ty: Ty,
        /// Whether the static type of the operand is convertible to `ty` at all.
        convertible: bool,
        transfer: Option<Transfer>,
        anchor: Option<Anchor>,
    },
    /// Pops the type operand and the value, pushes the boolean result.
    Instanceof {
        /// The type operand is a `Class` object rather than a type literal.
        class_object_check: bool,
        anchor: Option<Anchor>,
    },
    CheckNotNull {
        kind: NullCheck,
        transfer: Option<Transfer>,
        anchor: Option<Anchor>,
    },
    /// Checks `top relation value` without popping.
    Ensure {
        relation: RelationType,
        value: Fact,
        transfer: Option<Transfer>,
        make_ephemeral: bool,
        anchor: Option<Anchor>,
    },
}

impl Instruction {
    /// Instructions that may split a state; the runner deduplicates states there.
    pub fn is_branching(&self) -> bool {
        matches!(
            self,
            Instruction::ConditionalGoto { .. }
                | Instruction::BooleanBinary { .. }
                | Instruction::Not { .. }
                | Instruction::Instanceof { .. }
                | Instruction::Call(_)
        )
    }

    pub fn anchor(&self) -> Option<Anchor> {
        match self {
            Instruction::Push { anchor, .. }
            | Instruction::ConditionalGoto { anchor, .. }
            | Instruction::Not { anchor }
            | Instruction::BooleanBinary { anchor, .. }
            | Instruction::Assign { anchor, .. }
            | Instruction::MethodReference { anchor, .. }
            | Instruction::ArrayAccess { anchor, .. }
            | Instruction::TypeCast { anchor, .. }
            | Instruction::Instanceof { anchor, .. }
            | Instruction::CheckNotNull { anchor, .. }
            | Instruction::Ensure { anchor, .. } => *anchor,
            Instruction::Call(call) => call.anchor,
            _ => None,
        }
    }

    /// `(pops, pushes)` on the operand stack.
    pub fn stack_effect(&self) -> (usize, usize) {
        match self {
            Instruction::Push { .. } => (0, 1),
            Instruction::Pop => (1, 0),
            Instruction::Dup => (1, 2),
            Instruction::ConditionalGoto { .. } => (1, 0),
            Instruction::Not { .. }
            | Instruction::Negate { .. }
            | Instruction::MethodReference { .. }
            | Instruction::NewArray { .. }
            | Instruction::SpecialFieldRead { .. }
            | Instruction::TypeCast { .. }
            | Instruction::CheckNotNull { .. } => (1, 1),
            Instruction::BooleanBinary { .. }
            | Instruction::NumericBinary { .. }
            | Instruction::StringConcat
            | Instruction::Assign { .. }
            | Instruction::ArrayAccess { .. }
            | Instruction::Instanceof { .. } => (2, 1),
            Instruction::Call(call) => (call.arg_count + 1, 1),
            Instruction::Goto { .. }
            | Instruction::Return
            | Instruction::EndOfInitializer { .. }
            | Instruction::FlushVariable(_)
            | Instruction::FlushFields
            | Instruction::Escape(_)
            | Instruction::Closure(_)
            | Instruction::ControlTransfer(_)
            | Instruction::Ensure { .. } => (0, 0),
        }
    }

    /// Regular successors (the stack is carried over).
    pub(crate) fn successors(&self, index: usize) -> Vec<usize> {
        match self {
            Instruction::Goto { target } => vec![*target],
            Instruction::ConditionalGoto { target, .. } => vec![*target, index + 1],
            Instruction::Return | Instruction::ControlTransfer(_) => Vec::new(),
            _ => vec![index + 1],
        }
    }

    /// Transfer targets (the stack is discarded).
    pub(crate) fn transfer_targets(&self) -> Vec<usize> {
        match self {
            Instruction::ControlTransfer(t) => t.targets(),
            Instruction::ArrayAccess {
                out_of_bounds: Some(t), ..
            }
            | Instruction::TypeCast { transfer: Some(t), .. }
            | Instruction::CheckNotNull { transfer: Some(t), .. }
            | Instruction::Ensure { transfer: Some(t), .. } => t.targets(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Push { value, .. } => write!(f, "PUSH {}", value),
            Instruction::Pop => write!(f, "POP"),
            Instruction::Dup => write!(f, "DUP"),
            Instruction::Goto { target } => write!(f, "GOTO {}", target),
            Instruction::ConditionalGoto { target, negated, .. } => {
                write!(f, "IF_{} GOTO {}", if *negated { "NE" } else { "EQ" }, target)
            }
            Instruction::Not { .. } => write!(f, "NOT"),
            Instruction::Return => write!(f, "RETURN"),
            Instruction::EndOfInitializer { is_static } => {
                write!(f, "END_OF_{}INITIALIZER", if *is_static { "STATIC_" } else { "" })
            }
            Instruction::BooleanBinary { op, .. } => match op {
                BooleanOp::Relation(r) => write!(f, "BINOP {}", r),
                BooleanOp::And => write!(f, "BINOP &"),
                BooleanOp::Or => write!(f, "BINOP |"),
            },
            Instruction::NumericBinary { op, long } => {
                write!(f, "NUMOP {:?}{}", op, if *long { " (long)" } else { "" })
            }
            Instruction::Negate { .. } => write!(f, "NEGATE"),
            Instruction::StringConcat => write!(f, "STRING_CONCAT"),
            Instruction::Assign { .. } => write!(f, "ASSIGN"),
            Instruction::FlushVariable(v) => write!(f, "FLUSH {}", v),
            Instruction::FlushFields => write!(f, "FLUSH_ALL_FIELDS"),
            Instruction::Escape(vars) => {
                let names: Vec<String> = vars.iter().map(|v| v.to_string()).collect();
                write!(f, "ESCAPE [{}]", names.join(", "))
            }
            Instruction::Call(call) => {
                write!(f, "CALL")?;
                if let Some(m) = call.method {
                    write!(f, " {}", m)?;
                }
                write!(f, " ({} args)", call.arg_count)
            }
            Instruction::MethodReference { interface, .. } => write!(f, "METHOD_REF {}", interface),
            Instruction::Closure(ids) => {
                let names: Vec<String> = ids.iter().map(|c| c.to_string()).collect();
                write!(f, "CLOSURE [{}]", names.join(", "))
            }
            Instruction::ControlTransfer(t) => write!(f, "TRANSFER {}", t),
            Instruction::NewArray { ty } => write!(f, "NEW_ARRAY {}", ty),
            Instruction::ArrayAccess { .. } => write!(f, "ARRAY_ACCESS"),
            Instruction::SpecialFieldRead { field } => write!(f, "GET {}", field),
            Instruction::TypeCast { ty, .. } => write!(f, "CAST_TO {}", ty),
            Instruction::Instanceof { .. } => write!(f, "INSTANCEOF"),
            Instruction::CheckNotNull { kind, .. } => write!(f, "CHECK_NOT_NULL {:?}", kind),
            Instruction::Ensure { relation, value, .. } => write!(f, "ENSURE {} {}", relation, value),
        }
    }
}

/// One work item of the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionState {
    pub index: usize,
    pub state: MemoryState,
    pub distance: u64,
}

impl InstructionState {
    pub fn new(index: usize, state: MemoryState) -> Self {
        Self {
            index,
            state,
            distance: 0,
        }
    }
}

impl fmt::Display for InstructionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} (distance {})", self.index, self.state, self.distance)
    }
}

/// The analyzed block.
#[derive(Debug, Clone, Default)]
pub struct ControlFlow {
    instructions: Vec<Instruction>,
    not_null_params: Vec<ValueId>,
}

impl ControlFlow {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self {
            instructions,
            not_null_params: Vec::new(),
        }
    }

    /// Declares parameters annotated not-null; their facts are narrowed at entry.
    pub fn with_not_null_params(mut self, params: Vec<ValueId>) -> Self {
        self.not_null_params = params;
        self
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Instruction> {
        self.instructions.get(index)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn not_null_params(&self) -> &[ValueId] {
        &self.not_null_params
    }

    pub fn branch_count(&self) -> usize {
        self.instructions.iter().filter(|i| i.is_branching()).count()
    }

    /// Checks jump targets and stack discipline of every reachable instruction.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if self.instructions.is_empty() {
            return Err(AnalysisError::EmptyFlow);
        }
        let len = self.instructions.len();
        let mut depth: Vec<Option<usize>> = vec![None; len];
        let mut queue = VecDeque::new();
        depth[0] = Some(0);
        queue.push_back(0);

        while let Some(index) = queue.pop_front() {
            let instruction = &self.instructions[index];
            let current = depth[index].unwrap_or(0);
            let (pops, pushes) = instruction.stack_effect();
            if pops > current {
                return Err(AnalysisError::StackUnderflow { index });
            }
            let after = current - pops + pushes;

            let regular = instruction.successors(index).into_iter().map(|t| (t, after));
            let transfers = instruction.transfer_targets().into_iter().map(|t| (t, 0));
            for (target, expected) in regular.chain(transfers) {
                if target > len {
                    return Err(AnalysisError::InvalidJump { index, target });
                }
                if target == len {
                    continue;
                }
                match depth[target] {
                    None => {
                        depth[target] = Some(expected);
                        queue.push_back(target);
                    }
                    Some(found) if found != expected => {
                        return Err(AnalysisError::StackMismatch {
                            index: target,
                            expected,
                            found,
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ControlFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, instruction) in self.instructions.iter().enumerate() {
            writeln!(f, "{}: {}", i, instruction)?;
        }
        Ok(())
    }
}
