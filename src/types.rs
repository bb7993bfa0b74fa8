//! Type-safe handles used throughout the analysis.
//!
//! Values, source anchors, call targets and closures are all referenced by
//! small copyable indices. The newtypes keep them from being mixed up.
use std::fmt;

/// Handle of an interned value in a [`ValueFactory`][crate::value::ValueFactory].
///
/// # Invariants
///
/// - A handle is only meaningful for the factory (and thus the run) that created it.
/// - Two handles are equal iff they denote the same canonical value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValueId(u32);

impl ValueId {
    pub(crate) fn new(index: usize) -> Self {
        ValueId(index as u32)
    }

    /// Returns the arena index of this value.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Opaque source anchor supplied by the front-end.
///
/// The core never interprets anchors; it only hands them back to the
/// [`Observer`][crate::observer::Observer].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Anchor(pub u32);

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Identifier of a call target known to the [`MetadataOracle`][crate::contract::MetadataOracle].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MethodId(pub u32);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Identifier of a closure (lambda or local class body) created inside the analyzed block.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClosureId(pub u32);

impl fmt::Display for ClosureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "closure#{}", self.0)
    }
}

/// Three-valued logic answer.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ThreeState {
    Yes,
    No,
    Unsure,
}

impl ThreeState {
    pub fn from_bool(value: bool) -> Self {
        if value {
            ThreeState::Yes
        } else {
            ThreeState::No
        }
    }

    /// Returns the definite boolean, if any.
    pub fn to_bool(self) -> Option<bool> {
        match self {
            ThreeState::Yes => Some(true),
            ThreeState::No => Some(false),
            ThreeState::Unsure => None,
        }
    }
}
