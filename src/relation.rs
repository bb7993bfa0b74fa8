//! Binary relations used in conditions.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RelationType {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Type membership: `x instanceof T`.
    Is,
    IsNot,
}

impl RelationType {
    /// Logical negation: `!(a R b) == a R' b`.
    pub fn negated(self) -> RelationType {
        match self {
            RelationType::Eq => RelationType::Ne,
            RelationType::Ne => RelationType::Eq,
            RelationType::Lt => RelationType::Ge,
            RelationType::Le => RelationType::Gt,
            RelationType::Gt => RelationType::Le,
            RelationType::Ge => RelationType::Lt,
            RelationType::Is => RelationType::IsNot,
            RelationType::IsNot => RelationType::Is,
        }
    }

    /// Swapped operands: `a R b == b R' a`.
    ///
    /// Returns `None` for type relations, which are not symmetric.
    pub fn flipped(self) -> Option<RelationType> {
        match self {
            RelationType::Eq | RelationType::Ne => Some(self),
            RelationType::Lt => Some(RelationType::Gt),
            RelationType::Le => Some(RelationType::Ge),
            RelationType::Gt => Some(RelationType::Lt),
            RelationType::Ge => Some(RelationType::Le),
            RelationType::Is | RelationType::IsNot => None,
        }
    }

    /// Whether `other` implies `self` (e.g. `<` is a sub-relation of `<=`).
    pub fn is_sub_relation(self, other: RelationType) -> bool {
        if self == other {
            return true;
        }
        match self {
            RelationType::Le => matches!(other, RelationType::Lt | RelationType::Eq),
            RelationType::Ge => matches!(other, RelationType::Gt | RelationType::Eq),
            RelationType::Ne => matches!(other, RelationType::Lt | RelationType::Gt),
            _ => false,
        }
    }

    /// Whether this is one of the ordering relations.
    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            RelationType::Lt | RelationType::Le | RelationType::Gt | RelationType::Ge
        )
    }

    /// Minimal set of primitive relations covering both outcomes of `self`.
    pub fn split(self) -> Vec<RelationType> {
        if self.is_ordering() {
            vec![RelationType::Lt, RelationType::Gt, RelationType::Eq]
        } else {
            vec![self, self.negated()]
        }
    }

    /// Whether `a self b` and `a other b` can hold together.
    pub fn is_compatible(self, other: RelationType) -> bool {
        use RelationType::*;
        match (self, other) {
            (Is, _) | (IsNot, _) | (_, Is) | (_, IsNot) => true,
            _ => {
                let a = self.primitives();
                let b = other.primitives();
                a.iter().any(|r| b.contains(r))
            }
        }
    }

    fn primitives(self) -> &'static [RelationType] {
        use RelationType::*;
        match self {
            Eq => &[Eq],
            Ne => &[Lt, Gt],
            Lt => &[Lt],
            Gt => &[Gt],
            Le => &[Lt, Eq],
            Ge => &[Gt, Eq],
            Is | IsNot => &[],
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelationType::Eq => "==",
            RelationType::Ne => "!=",
            RelationType::Lt => "<",
            RelationType::Le => "<=",
            RelationType::Gt => ">",
            RelationType::Ge => ">=",
            RelationType::Is => "instanceof",
            RelationType::IsNot => "!instanceof",
        };
        write!(f, "{}", s)
    }
}
