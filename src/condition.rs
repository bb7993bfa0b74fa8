//! Conditions over values.
//!
//! A [`Condition`] is what transfer functions hand to
//! [`MemoryState::apply_condition`][crate::state::MemoryState::apply_condition].
//! Construction folds conditions whose outcome does not depend on any memory
//! state (both operands are typed values with deciding facts) into
//! [`Condition::True`] or [`Condition::False`].

use std::fmt;

use crate::relation::RelationType;
use crate::types::ValueId;
use crate::value::ValueFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    True,
    False,
    Relation {
        left: ValueId,
        relation: RelationType,
        right: ValueId,
    },
}

impl Condition {
    /// Builds `left relation right`, folding it when statically decided.
    pub fn new(factory: &ValueFactory, left: ValueId, relation: RelationType, right: ValueId) -> Condition {
        if !factory.is_variable(left) && !factory.is_variable(right) {
            let l = factory.inherent(left);
            let r = factory.inherent(right);
            if let Some(result) = l.decide(relation, &r) {
                return Condition::from_bool(result);
            }
        }
        Condition::Relation { left, relation, right }
    }

    /// `value == constant`.
    pub fn eq(factory: &ValueFactory, value: ValueId, constant: ValueId) -> Condition {
        Condition::new(factory, value, RelationType::Eq, constant)
    }

    pub fn from_bool(value: bool) -> Condition {
        if value {
            Condition::True
        } else {
            Condition::False
        }
    }

    pub fn negate(self) -> Condition {
        match self {
            Condition::True => Condition::False,
            Condition::False => Condition::True,
            Condition::Relation { left, relation, right } => Condition::Relation {
                left,
                relation: relation.negated(),
                right,
            },
        }
    }

    /// Whether the condition involves the unknown value, so that applying it
    /// can never narrow anything.
    pub fn is_unknown(&self, factory: &ValueFactory) -> bool {
        match self {
            Condition::Relation { left, right, .. } => factory.is_unknown(*left) || factory.is_unknown(*right),
            _ => false,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::True => write!(f, "TRUE"),
            Condition::False => write!(f, "FALSE"),
            Condition::Relation { left, relation, right } => write!(f, "{} {} {}", left, relation, right),
        }
    }
}
