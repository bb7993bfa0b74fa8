//! Memory state of one explored path.
//!
//! A [`MemoryState`] holds the operand stack, the facts known about
//! variables, and the relations recorded between pairs of variables. It is
//! a plain value: cloning it yields a fully independent copy, and its derived
//! equality and hash are the structural equality used by the runner to
//! deduplicate states at branching instructions.
//!
//! Facts are stored only for variables. The fact of a variable is the meet
//! of its inherent fact, the fact derived from its qualifier (for special
//! fields such as array length) and the stored fact. Typed values are
//! immutable: conditions over them are checked but never recorded.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::condition::Condition;
use crate::fact::{Fact, FloatFact};
use crate::relation::RelationType;
use crate::types::ValueId;
use crate::value::{Descriptor, Value, ValueFactory};

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MemoryState {
    stack: Vec<ValueId>,
    facts: BTreeMap<ValueId, Fact>,
    /// Canonical form: `(a, r, b)` with `a < b`.
    relations: BTreeSet<(ValueId, RelationType, ValueId)>,
    ephemeral: bool,
}

impl MemoryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: ValueId) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Option<ValueId> {
        self.stack.pop()
    }

    pub fn peek(&self) -> Option<ValueId> {
        self.stack.last().copied()
    }

    pub fn stack(&self) -> &[ValueId] {
        &self.stack
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty_stack(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Marks the state as reachable only through a forced-failure divert.
    pub fn mark_ephemeral(&mut self) {
        self.ephemeral = true;
    }

    /// Copy of this state as seen by a closure created at this point.
    pub fn closure_snapshot(&self) -> MemoryState {
        MemoryState {
            stack: Vec::new(),
            facts: self.facts.clone(),
            relations: self.relations.clone(),
            ephemeral: false,
        }
    }

    /// The fact of `id` in this state.
    pub fn fact(&self, factory: &ValueFactory, id: ValueId) -> Fact {
        let Value::Variable(info) = factory.get(id) else {
            return factory.inherent(id);
        };
        let mut fact = info.inherent.clone();
        if let (Descriptor::Special(field), Some(qualifier)) = (&info.descriptor, info.qualifier) {
            fact = fact.meet(&field.from_qualifier(&self.fact(factory, qualifier)));
        }
        if let Some(stored) = self.facts.get(&id) {
            fact = fact.meet(stored);
        }
        fact
    }

    pub fn is_null(&self, factory: &ValueFactory, id: ValueId) -> bool {
        self.fact(factory, id).is_null()
    }

    /// Overwrites the stored fact of a variable. Non-variables are ignored.
    pub fn set_fact(&mut self, factory: &ValueFactory, id: ValueId, fact: Fact) {
        if !factory.is_variable(id) {
            return;
        }
        if fact == factory.inherent(id) || fact.is_top() {
            self.facts.remove(&id);
        } else {
            self.facts.insert(id, fact);
        }
    }

    /// Narrows `id` (and every variable known equal to it) by `fact`.
    ///
    /// Returns `false` if the result is bottom; the state must then be discarded.
    pub fn meet_fact(&mut self, factory: &ValueFactory, id: ValueId, fact: &Fact) -> bool {
        if !factory.is_variable(id) {
            return !self.fact(factory, id).meet(fact).is_bottom();
        }
        for var in self.equal_class(id) {
            let narrowed = self.fact(factory, var).meet(fact);
            if narrowed.is_bottom() {
                return false;
            }
            self.set_fact(factory, var, narrowed);
        }
        true
    }

    fn equal_class(&self, id: ValueId) -> Vec<ValueId> {
        let mut class = vec![id];
        let mut i = 0;
        while i < class.len() {
            let current = class[i];
            for &(a, r, b) in &self.relations {
                if r != RelationType::Eq {
                    continue;
                }
                let other = if a == current {
                    b
                } else if b == current {
                    a
                } else {
                    continue;
                };
                if !class.contains(&other) {
                    class.push(other);
                }
            }
            i += 1;
        }
        class
    }

    fn add_relation(&mut self, left: ValueId, relation: RelationType, right: ValueId) {
        if left < right {
            self.relations.insert((left, relation, right));
        } else if let Some(flipped) = relation.flipped() {
            self.relations.insert((right, flipped, left));
        }
    }

    /// Relations recorded between `left` and `right`, oriented left-to-right.
    pub fn relations_between(&self, left: ValueId, right: ValueId) -> Vec<RelationType> {
        self.relations
            .iter()
            .filter_map(|&(a, r, b)| {
                if a == left && b == right {
                    Some(r)
                } else if a == right && b == left {
                    r.flipped()
                } else {
                    None
                }
            })
            .collect()
    }

    fn forget(&mut self, id: ValueId) {
        self.facts.remove(&id);
        self.relations.retain(|&(a, _, b)| a != id && b != id);
    }

    /// Forgets everything known about a variable and the variables it qualifies.
    pub fn flush_variable(&mut self, factory: &ValueFactory, var: ValueId) {
        self.forget(var);
        for &dependent in factory.dependents(var) {
            self.forget(dependent);
        }
    }

    /// Forgets every variable a call could change, except those owned by local objects.
    pub fn flush_fields(&mut self, factory: &ValueFactory) {
        let mut tracked: BTreeSet<ValueId> = self.facts.keys().copied().collect();
        for &(a, _, b) in &self.relations {
            tracked.insert(a);
            tracked.insert(b);
        }
        for var in tracked {
            if factory.is_flushable_by_calls(var) && !self.is_owned_by_local(factory, var) {
                self.forget(var);
            }
        }
    }

    fn is_owned_by_local(&self, factory: &ValueFactory, var: ValueId) -> bool {
        let mut qualifier = factory.qualifier(var);
        while let Some(q) = qualifier {
            if self.fact(factory, q).is_local() {
                return true;
            }
            qualifier = factory.qualifier(q);
        }
        false
    }

    /// Binds `var` to the value of `source` (copy semantics plus an equality relation).
    pub fn set_var_value(&mut self, factory: &ValueFactory, var: ValueId, source: ValueId) {
        if var == source {
            return;
        }
        let source_fact = self.fact(factory, source);
        self.flush_variable(factory, var);
        let merged = factory.inherent(var).meet(&source_fact);
        let stored = if merged.is_bottom() { source_fact } else { merged };
        self.set_fact(factory, var, stored);
        if factory.is_variable(source) {
            self.add_relation(var, RelationType::Eq, source);
        }
    }

    /// Removes the "local object" flag from a value, returning the value to use
    /// from now on (typed values are immutable and get replaced).
    pub fn drop_locality(&mut self, factory: &mut ValueFactory, id: ValueId) -> ValueId {
        match factory.get(id).clone() {
            Value::Variable(_) => {
                let mut affected = vec![id];
                affected.extend_from_slice(factory.dependents(id));
                for var in affected {
                    let fact = self.fact(factory, var);
                    if fact.is_local() {
                        self.set_fact(factory, var, fact.drop_locality());
                    }
                }
                id
            }
            Value::Typed(fact) if fact.is_local() => factory.typed(fact.drop_locality()),
            Value::Wrapped { field, inner, fact } if fact.is_local() => {
                factory.wrapped(field, inner, fact.drop_locality())
            }
            _ => id,
        }
    }

    /// Narrows the state assuming `condition` holds.
    ///
    /// Returns `false` if the condition is unsatisfiable in this state; the
    /// caller then discards the state (its facts are unspecified).
    pub fn apply_condition(&mut self, factory: &ValueFactory, condition: Condition) -> bool {
        let (left, relation, right) = match condition {
            Condition::True => return true,
            Condition::False => return false,
            Condition::Relation { left, relation, right } => (left, relation, right),
        };
        let left_fact = self.fact(factory, left);
        let right_fact = self.fact(factory, right);
        if left_fact.is_bottom() || right_fact.is_bottom() {
            return false;
        }
        let nan = Fact::Float(FloatFact::NaN);
        if left_fact == nan || right_fact == nan {
            return relation == RelationType::Ne;
        }
        let typed_relation = matches!(relation, RelationType::Is | RelationType::IsNot);
        if left == right && !typed_relation {
            if left_fact == Fact::Float(FloatFact::Any) {
                // NaN is the only value unequal to itself.
                return match relation {
                    RelationType::Ne => self.meet_fact(factory, left, &nan),
                    RelationType::Lt | RelationType::Gt => false,
                    _ => true,
                };
            }
            return matches!(relation, RelationType::Eq | RelationType::Le | RelationType::Ge);
        }
        if let Some(result) = left_fact.decide(relation, &right_fact) {
            return result;
        }

        let both_variables = factory.is_variable(left) && factory.is_variable(right) && !typed_relation;
        if both_variables
            && self
                .relations_between(left, right)
                .into_iter()
                .any(|existing| !existing.is_compatible(relation))
        {
            return false;
        }

        let narrowed_left = left_fact.narrow(relation, &right_fact);
        if !self.meet_fact(factory, left, &narrowed_left) {
            return false;
        }
        if let Some(flipped) = relation.flipped() {
            let left_fact = self.fact(factory, left);
            let narrowed_right = right_fact.narrow(flipped, &left_fact);
            if !self.meet_fact(factory, right, &narrowed_right) {
                return false;
            }
        }
        if both_variables {
            self.add_relation(left, relation, right);
        }
        true
    }

    /// Renders the state with value names, for logging.
    pub fn render(&self, factory: &ValueFactory) -> String {
        let stack: Vec<String> = self.stack.iter().map(|&v| factory.describe(v)).collect();
        let facts: Vec<String> = self
            .facts
            .iter()
            .map(|(&v, f)| format!("{}: {}", factory.describe(v), f))
            .collect();
        let relations: Vec<String> = self
            .relations
            .iter()
            .map(|&(a, r, b)| format!("{} {} {}", factory.describe(a), r, factory.describe(b)))
            .collect();
        format!(
            "{}<{}> {{{}}} [{}]",
            if self.ephemeral { "(ephemeral) " } else { "" },
            stack.join(", "),
            facts.join(", "),
            relations.join(", ")
        )
    }
}

impl fmt::Display for MemoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stack: Vec<String> = self.stack.iter().map(|v| v.to_string()).collect();
        write!(f, "<{}> {} facts", stack.join(", "), self.facts.len())?;
        if self.ephemeral {
            write!(f, " (ephemeral)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::fact::{Nullability, SpecialField, Ty};
    use crate::range::LongRange;

    #[test]
    fn test_null_check_narrows() {
        let mut f = ValueFactory::new();
        let x = f.parameter("x", 0, Fact::unknown_ref());
        let null = f.null();

        let mut s = MemoryState::new();
        let mut copy = s.clone();
        assert!(s.apply_condition(&f, Condition::eq(&f, x, null)));
        assert!(s.is_null(&f, x));
        assert!(copy.apply_condition(&f, Condition::eq(&f, x, null).negate()));
        assert_eq!(copy.fact(&f, x).nullability(), Nullability::NotNull);

        // Contradiction is detected, never recorded.
        assert!(!copy.apply_condition(&f, Condition::eq(&f, x, null)));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut f = ValueFactory::new();
        let x = f.local("x", Fact::Int(LongRange::int()));
        let zero = f.int_value(0);
        let s = MemoryState::new();
        let mut a = s.clone();
        assert!(a.apply_condition(&f, Condition::new(&f, x, RelationType::Gt, zero)));
        assert_ne!(a, s);
        assert_eq!(s.fact(&f, x), Fact::Int(LongRange::int()));
    }

    #[test]
    fn test_variable_relations_detect_contradiction() {
        let mut f = ValueFactory::new();
        let a = f.local("a", Fact::Int(LongRange::int()));
        let b = f.local("b", Fact::Int(LongRange::int()));
        let mut s = MemoryState::new();
        assert!(s.apply_condition(&f, Condition::new(&f, a, RelationType::Lt, b)));
        assert!(!s.clone().apply_condition(&f, Condition::new(&f, a, RelationType::Eq, b)));
        assert!(!s.clone().apply_condition(&f, Condition::new(&f, b, RelationType::Lt, a)));
        assert!(s.apply_condition(&f, Condition::new(&f, a, RelationType::Ne, b)));
    }

    #[test]
    fn test_nan_makes_ordering_unsatisfiable() {
        let mut f = ValueFactory::new();
        let x = f.local("x", Fact::Float(FloatFact::Any));
        let nan = f.typed(Fact::float(f64::NAN));
        let mut s = MemoryState::new();
        assert!(!s.clone().apply_condition(&f, Condition::new(&f, x, RelationType::Lt, nan)));
        assert!(!s.clone().apply_condition(&f, Condition::new(&f, x, RelationType::Eq, nan)));
        assert!(s.apply_condition(&f, Condition::new(&f, x, RelationType::Ne, nan)));
    }

    #[test]
    fn test_self_comparison_of_possible_nan() {
        let mut f = ValueFactory::new();
        let x = f.local("x", Fact::Float(FloatFact::Any));
        let s = MemoryState::new();
        assert!(s.clone().apply_condition(&f, Condition::new(&f, x, RelationType::Eq, x)));
        assert!(s.clone().apply_condition(&f, Condition::new(&f, x, RelationType::Le, x)));
        assert!(!s.clone().apply_condition(&f, Condition::new(&f, x, RelationType::Lt, x)));

        let mut unequal = s.clone();
        assert!(unequal.apply_condition(&f, Condition::new(&f, x, RelationType::Ne, x)));
        assert_eq!(unequal.fact(&f, x), Fact::Float(FloatFact::NaN));
    }

    #[test]
    fn test_self_comparison_of_int() {
        let mut f = ValueFactory::new();
        let i = f.local("i", Fact::Int(LongRange::int()));
        let s = MemoryState::new();
        assert!(s.clone().apply_condition(&f, Condition::new(&f, i, RelationType::Ge, i)));
        assert!(!s.clone().apply_condition(&f, Condition::new(&f, i, RelationType::Ne, i)));
    }

    #[test]
    fn test_array_length_derived_from_qualifier() {
        let mut f = ValueFactory::new();
        let int_array = Ty::array(Ty::primitive("int"));
        let a = f.local("a", Fact::typed(&int_array, Nullability::Unknown));
        let empty = f.typed(Fact::exact(&int_array, Nullability::NotNull).with_special(SpecialField::ArrayLength, Fact::int(0)));
        let mut s = MemoryState::new();
        s.set_var_value(&f, a, empty);

        let length = f.special(SpecialField::ArrayLength, a);
        let zero = f.int_value(0);
        assert_eq!(s.fact(&f, length), Fact::int(0));
        assert!(!s.clone().apply_condition(&f, Condition::new(&f, length, RelationType::Gt, zero)));
    }

    #[test]
    fn test_assignment_links_variables() {
        let mut f = ValueFactory::new();
        let x = f.parameter("x", 0, Fact::unknown_ref());
        let y = f.local("y", Fact::unknown_ref());
        let null = f.null();
        let mut s = MemoryState::new();
        s.set_var_value(&f, y, x);
        assert!(s.apply_condition(&f, Condition::eq(&f, x, null).negate()));
        assert_eq!(s.fact(&f, y).nullability(), Nullability::NotNull);

        s.flush_variable(&f, y);
        assert_eq!(s.fact(&f, y).nullability(), Nullability::Unknown);
        assert_eq!(s.fact(&f, x).nullability(), Nullability::NotNull);
    }

    #[test]
    fn test_flush_fields_keeps_locals() {
        let mut f = ValueFactory::new();
        let this = f.parameter("this", 0, Fact::not_null());
        let field = f.field(this, "count", Fact::Int(LongRange::int()));
        let obj = f.local("obj", Fact::unknown_ref());
        let obj_field = f.field(obj, "count", Fact::Int(LongRange::int()));
        let local_object = f.typed(Fact::local_object());
        let five = f.int_value(5);

        let mut s = MemoryState::new();
        s.set_var_value(&f, obj, local_object);
        s.set_var_value(&f, field, five);
        s.set_var_value(&f, obj_field, five);
        s.flush_fields(&f);
        assert_eq!(s.fact(&f, field), Fact::Int(LongRange::int()));
        assert_eq!(s.fact(&f, obj_field), Fact::int(5));
    }

    #[test]
    fn test_drop_locality() {
        let mut f = ValueFactory::new();
        let obj = f.local("obj", Fact::unknown_ref());
        let local_object = f.typed(Fact::local_object());
        let mut s = MemoryState::new();
        s.set_var_value(&f, obj, local_object);
        assert!(s.fact(&f, obj).is_local());
        assert_eq!(s.drop_locality(&mut f, obj), obj);
        assert!(!s.fact(&f, obj).is_local());

        let replaced = s.drop_locality(&mut f, local_object);
        assert_ne!(replaced, local_object);
        assert!(!f.inherent(replaced).is_local());
    }
}
