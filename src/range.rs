//! Integer range lattice.
//!
//! A [`LongRange`] is a closed interval `[lo, hi]` of 64-bit integers, or the
//! empty range. It backs the numeric part of a [`Fact`][crate::fact::Fact]:
//! `int` values live in the 32-bit sub-range, `long` values use the full one.
//!
//! Arithmetic follows JVM semantics: when a result may overflow the operand
//! width, it wraps around, so the abstract result widens to the whole type
//! range.

use std::cmp::{max, min};
use std::fmt;

use crate::relation::RelationType;

/// Closed integer interval, or empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LongRange {
    lo: i64,
    hi: i64,
}

impl LongRange {
    /// The empty range (bottom).
    pub const EMPTY: LongRange = LongRange { lo: 1, hi: 0 };

    /// Creates `[lo, hi]`; an inverted pair yields the empty range.
    pub fn new(lo: i64, hi: i64) -> Self {
        if lo > hi {
            Self::EMPTY
        } else {
            Self { lo, hi }
        }
    }

    pub fn point(value: i64) -> Self {
        Self { lo: value, hi: value }
    }

    /// Range of a JVM `int`.
    pub fn int() -> Self {
        Self::new(i32::MIN as i64, i32::MAX as i64)
    }

    /// Range of a JVM `long`.
    pub fn long() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    /// Range for a type of the given width.
    pub fn of_width(long: bool) -> Self {
        if long {
            Self::long()
        } else {
            Self::int()
        }
    }

    /// Non-negative ints: the range of array and string lengths.
    pub fn index_range() -> Self {
        Self::new(0, i32::MAX as i64)
    }

    pub fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    pub fn lo(&self) -> i64 {
        self.lo
    }

    pub fn hi(&self) -> i64 {
        self.hi
    }

    /// Returns the single value if the range has exactly one element.
    pub fn as_const(&self) -> Option<i64> {
        if !self.is_empty() && self.lo == self.hi {
            Some(self.lo)
        } else {
            None
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.lo <= value && value <= self.hi
    }

    /// `self ⊆ other`
    pub fn is_subset_of(&self, other: &LongRange) -> bool {
        self.is_empty() || (other.lo <= self.lo && self.hi <= other.hi)
    }

    pub fn meet(&self, other: &LongRange) -> LongRange {
        LongRange::new(max(self.lo, other.lo), min(self.hi, other.hi))
    }

    pub fn join(&self, other: &LongRange) -> LongRange {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        LongRange::new(min(self.lo, other.lo), max(self.hi, other.hi))
    }

    /// Removes a single value. Only endpoints can be removed exactly;
    /// an interior point leaves the range unchanged.
    pub fn without(&self, value: i64) -> LongRange {
        if self.is_empty() || !self.contains(value) {
            return *self;
        }
        if self.lo == value && self.hi == value {
            LongRange::EMPTY
        } else if self.lo == value {
            LongRange::new(value + 1, self.hi)
        } else if self.hi == value {
            LongRange::new(self.lo, value - 1)
        } else {
            *self
        }
    }

    /// All values `x` such that `x relation y` holds for some `y` in `self`.
    ///
    /// `!=` is only exact against a single point; otherwise the result is unconstrained.
    pub fn from_relation(&self, relation: RelationType) -> LongRange {
        if self.is_empty() {
            return LongRange::EMPTY;
        }
        match relation {
            RelationType::Eq => *self,
            RelationType::Lt => LongRange::new(i64::MIN, self.hi.saturating_sub(1)),
            RelationType::Le => LongRange::new(i64::MIN, self.hi),
            RelationType::Gt => LongRange::new(self.lo.saturating_add(1), i64::MAX),
            RelationType::Ge => LongRange::new(self.lo, i64::MAX),
            RelationType::Ne => match self.as_const() {
                Some(c) if c == i64::MIN => LongRange::new(i64::MIN + 1, i64::MAX),
                Some(c) if c == i64::MAX => LongRange::new(i64::MIN, i64::MAX - 1),
                _ => LongRange::long(),
            },
            RelationType::Is | RelationType::IsNot => LongRange::long(),
        }
    }

    /// Decides `self relation other` if every pair of elements agrees.
    pub fn decide(&self, relation: RelationType, other: &LongRange) -> Option<bool> {
        if self.is_empty() || other.is_empty() {
            return None;
        }
        let always = match relation {
            RelationType::Eq => self.as_const().is_some() && self.as_const() == other.as_const(),
            RelationType::Ne => self.meet(other).is_empty(),
            RelationType::Lt => self.hi < other.lo,
            RelationType::Le => self.hi <= other.lo,
            RelationType::Gt => self.lo > other.hi,
            RelationType::Ge => self.lo >= other.hi,
            RelationType::Is | RelationType::IsNot => return None,
        };
        if always {
            return Some(true);
        }
        let never = match relation {
            RelationType::Eq => self.meet(other).is_empty(),
            RelationType::Ne => self.as_const().is_some() && self.as_const() == other.as_const(),
            RelationType::Lt => self.lo >= other.hi,
            RelationType::Le => self.lo > other.hi,
            RelationType::Gt => self.hi <= other.lo,
            RelationType::Ge => self.hi < other.lo,
            RelationType::Is | RelationType::IsNot => false,
        };
        if never {
            Some(false)
        } else {
            None
        }
    }

    fn wrap(lo: i128, hi: i128, long: bool) -> LongRange {
        let full = LongRange::of_width(long);
        if lo < full.lo as i128 || hi > full.hi as i128 {
            full
        } else {
            LongRange::new(lo as i64, hi as i64)
        }
    }

    pub fn plus(&self, other: &LongRange, long: bool) -> LongRange {
        if self.is_empty() || other.is_empty() {
            return LongRange::EMPTY;
        }
        Self::wrap(
            self.lo as i128 + other.lo as i128,
            self.hi as i128 + other.hi as i128,
            long,
        )
    }

    pub fn minus(&self, other: &LongRange, long: bool) -> LongRange {
        if self.is_empty() || other.is_empty() {
            return LongRange::EMPTY;
        }
        Self::wrap(
            self.lo as i128 - other.hi as i128,
            self.hi as i128 - other.lo as i128,
            long,
        )
    }

    pub fn mul(&self, other: &LongRange, long: bool) -> LongRange {
        if self.is_empty() || other.is_empty() {
            return LongRange::EMPTY;
        }
        let products = [
            self.lo as i128 * other.lo as i128,
            self.lo as i128 * other.hi as i128,
            self.hi as i128 * other.lo as i128,
            self.hi as i128 * other.hi as i128,
        ];
        let lo = products.iter().copied().min().unwrap_or(0);
        let hi = products.iter().copied().max().unwrap_or(0);
        Self::wrap(lo, hi, long)
    }

    /// Integer division; a divisor range containing only zero yields empty.
    pub fn div(&self, other: &LongRange, long: bool) -> LongRange {
        if self.is_empty() || other.is_empty() {
            return LongRange::EMPTY;
        }
        let divisor = other.without(0);
        if divisor.is_empty() {
            return LongRange::EMPTY;
        }
        if divisor.contains(0) {
            // Divisor crosses zero: magnitude is bounded by the dividend.
            let bound = max(self.lo.unsigned_abs(), self.hi.unsigned_abs()) as i128;
            return Self::wrap(-bound, bound, long);
        }
        let quotients = [
            self.lo as i128 / divisor.lo as i128,
            self.lo as i128 / divisor.hi as i128,
            self.hi as i128 / divisor.lo as i128,
            self.hi as i128 / divisor.hi as i128,
        ];
        let lo = quotients.iter().copied().min().unwrap_or(0);
        let hi = quotients.iter().copied().max().unwrap_or(0);
        Self::wrap(lo, hi, long)
    }

    /// Remainder; the sign follows the dividend.
    pub fn rem(&self, other: &LongRange, long: bool) -> LongRange {
        if self.is_empty() || other.is_empty() {
            return LongRange::EMPTY;
        }
        if let (Some(a), Some(b)) = (self.as_const(), other.as_const()) {
            if b == 0 {
                return LongRange::EMPTY;
            }
            return Self::wrap(a as i128 % b as i128, a as i128 % b as i128, long);
        }
        let modulus = max(other.lo.unsigned_abs(), other.hi.unsigned_abs()) as i128;
        if modulus == 0 {
            return LongRange::EMPTY;
        }
        let lo = if self.lo < 0 { -(modulus - 1) } else { 0 };
        let hi = if self.hi > 0 { modulus - 1 } else { 0 };
        Self::wrap(lo, hi, long)
    }

    pub fn negate(&self, long: bool) -> LongRange {
        if self.is_empty() {
            return LongRange::EMPTY;
        }
        Self::wrap(-(self.hi as i128), -(self.lo as i128), long)
    }
}

impl fmt::Display for LongRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "{{}}");
        }
        if let Some(c) = self.as_const() {
            return write!(f, "{{{}}}", c);
        }
        let bound = |v: i64| match v {
            i64::MIN => "-∞".to_string(),
            i64::MAX => "+∞".to_string(),
            v => v.to_string(),
        };
        write!(f, "[{}, {}]", bound(self.lo), bound(self.hi))
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_meet_and_empty() {
        let a = LongRange::new(0, 10);
        let b = LongRange::new(5, 20);
        assert_eq!(a.meet(&b), LongRange::new(5, 10));
        assert!(a.meet(&LongRange::new(11, 12)).is_empty());
        assert_eq!(LongRange::new(3, 1), LongRange::EMPTY);
    }

    #[test]
    fn test_without_endpoints() {
        let r = LongRange::new(0, 5);
        assert_eq!(r.without(0), LongRange::new(1, 5));
        assert_eq!(r.without(5), LongRange::new(0, 4));
        assert_eq!(r.without(3), r);
        assert!(LongRange::point(7).without(7).is_empty());
    }

    #[test]
    fn test_decide() {
        let zero = LongRange::point(0);
        let pos = LongRange::new(1, 100);
        assert_eq!(zero.decide(RelationType::Lt, &pos), Some(true));
        assert_eq!(pos.decide(RelationType::Eq, &zero), Some(false));
        assert_eq!(LongRange::new(0, 5).decide(RelationType::Lt, &LongRange::new(3, 4)), None);
        assert_eq!(zero.decide(RelationType::Gt, &zero), Some(false));
    }

    #[test]
    fn test_plus_wraps_on_overflow() {
        let big = LongRange::point(i32::MAX as i64);
        assert_eq!(big.plus(&LongRange::point(1), false), LongRange::int());
        assert_eq!(
            big.plus(&LongRange::point(1), true),
            LongRange::point(i32::MAX as i64 + 1)
        );
    }

    #[test]
    fn test_div_and_rem() {
        let r = LongRange::new(10, 20);
        assert_eq!(r.div(&LongRange::point(2), false), LongRange::new(5, 10));
        assert!(r.div(&LongRange::point(0), false).is_empty());
        assert_eq!(r.rem(&LongRange::point(3), false), LongRange::new(0, 2));
        assert_eq!(LongRange::point(7).rem(&LongRange::point(3), false), LongRange::point(1));
    }

    #[test]
    fn test_from_relation() {
        let five = LongRange::point(5);
        assert_eq!(five.from_relation(RelationType::Lt).hi(), 4);
        assert_eq!(five.from_relation(RelationType::Ge).lo(), 5);
    }
}
