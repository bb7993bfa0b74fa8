//! Value registry.
//!
//! Every symbolic value seen during one run is interned in a [`ValueFactory`]
//! arena and referenced by a [`ValueId`] handle. Interning makes handle
//! equality coincide with value identity, so memory states can key their
//! maps by handle and still compare structurally.

use std::collections::HashMap;
use std::fmt;

use crate::fact::{Fact, Nullability, SpecialField};
use crate::range::LongRange;
use crate::types::ValueId;

/// What a variable stands for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Descriptor {
    /// A local variable; `temp` marks synthetic temporaries introduced by the front-end.
    Local { name: String, temp: bool },
    Parameter { name: String, index: usize },
    Field {
        name: String,
        is_static: bool,
        is_volatile: bool,
        is_final: bool,
    },
    Special(SpecialField),
    /// Element of the qualifying array at a constant index.
    ArrayElement(i64),
    /// Result of a getter-like call, stable while its qualifier is unchanged.
    CallResult(String),
}

impl Descriptor {
    /// Whether the value may change without an explicit assignment
    /// (by a call or by another alias).
    pub fn is_call_flushable(&self) -> bool {
        match self {
            Descriptor::Field { is_final, .. } => !is_final,
            Descriptor::ArrayElement(_) | Descriptor::CallResult(_) => true,
            Descriptor::Local { .. } | Descriptor::Parameter { .. } | Descriptor::Special(_) => false,
        }
    }

    pub fn is_volatile(&self) -> bool {
        matches!(self, Descriptor::Field { is_volatile: true, .. })
    }

    pub fn is_static_field(&self) -> bool {
        matches!(self, Descriptor::Field { is_static: true, .. })
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Local { name, .. } | Descriptor::Parameter { name, .. } => write!(f, "{}", name),
            Descriptor::Field { name, .. } => write!(f, "{}", name),
            Descriptor::Special(field) => write!(f, "{}", field),
            Descriptor::ArrayElement(i) => write!(f, "[{}]", i),
            Descriptor::CallResult(name) => write!(f, "{}()", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarInfo {
    pub descriptor: Descriptor,
    pub qualifier: Option<ValueId>,
    /// Fact implied by the declaration (type, annotated nullability).
    pub inherent: Fact,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    Variable(VarInfo),
    /// A value known only by its fact; constants are typed values with a constant fact.
    Typed(Fact),
    /// A value boxing `inner` through a special field (e.g. a string of known length).
    Wrapped {
        field: SpecialField,
        inner: ValueId,
        fact: Fact,
    },
    Unknown,
}

/// Per-run arena of interned values.
#[derive(Debug, Clone)]
pub struct ValueFactory {
    values: Vec<Value>,
    dependents: Vec<Vec<ValueId>>,
    vars: HashMap<(Descriptor, Option<ValueId>), ValueId>,
    typed: HashMap<Fact, ValueId>,
    wrapped: HashMap<(SpecialField, ValueId, Fact), ValueId>,
}

impl Default for ValueFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueFactory {
    pub fn new() -> Self {
        let mut factory = Self {
            values: Vec::new(),
            dependents: Vec::new(),
            vars: HashMap::new(),
            typed: HashMap::new(),
            wrapped: HashMap::new(),
        };
        factory.alloc(Value::Unknown);
        factory
    }

    fn alloc(&mut self, value: Value) -> ValueId {
        let id = ValueId::new(self.values.len());
        self.values.push(value);
        self.dependents.push(Vec::new());
        id
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    pub fn unknown(&self) -> ValueId {
        ValueId::new(0)
    }

    pub fn is_unknown(&self, id: ValueId) -> bool {
        matches!(self.get(id), Value::Unknown)
    }

    pub fn typed(&mut self, fact: Fact) -> ValueId {
        if let Some(&id) = self.typed.get(&fact) {
            return id;
        }
        let id = self.alloc(Value::Typed(fact.clone()));
        self.typed.insert(fact, id);
        id
    }

    pub fn bool_value(&mut self, value: bool) -> ValueId {
        self.typed(Fact::bool(value))
    }

    pub fn int_value(&mut self, value: i64) -> ValueId {
        self.typed(Fact::int(value))
    }

    pub fn null(&mut self) -> ValueId {
        self.typed(Fact::null())
    }

    pub fn string(&mut self, value: &str) -> ValueId {
        self.typed(Fact::string(value))
    }

    /// Interns a variable. The inherent fact is fixed by the first call.
    pub fn var(&mut self, descriptor: Descriptor, qualifier: Option<ValueId>, inherent: Fact) -> ValueId {
        let key = (descriptor, qualifier);
        if let Some(&id) = self.vars.get(&key) {
            return id;
        }
        let (descriptor, qualifier) = key.clone();
        let id = self.alloc(Value::Variable(VarInfo {
            descriptor,
            qualifier,
            inherent,
        }));
        self.vars.insert(key, id);
        // Register with the whole qualifier chain.
        let mut q = qualifier;
        while let Some(owner) = q {
            self.dependents[owner.index()].push(id);
            q = self.qualifier(owner);
        }
        id
    }

    pub fn local(&mut self, name: &str, inherent: Fact) -> ValueId {
        let descriptor = Descriptor::Local {
            name: name.to_string(),
            temp: false,
        };
        self.var(descriptor, None, inherent)
    }

    pub fn temp(&mut self, name: &str, inherent: Fact) -> ValueId {
        let descriptor = Descriptor::Local {
            name: name.to_string(),
            temp: true,
        };
        self.var(descriptor, None, inherent)
    }

    pub fn parameter(&mut self, name: &str, index: usize, inherent: Fact) -> ValueId {
        let descriptor = Descriptor::Parameter {
            name: name.to_string(),
            index,
        };
        self.var(descriptor, None, inherent)
    }

    /// A mutable instance field of `qualifier`.
    pub fn field(&mut self, qualifier: ValueId, name: &str, inherent: Fact) -> ValueId {
        let descriptor = Descriptor::Field {
            name: name.to_string(),
            is_static: false,
            is_volatile: false,
            is_final: false,
        };
        self.var(descriptor, Some(qualifier), inherent)
    }

    pub fn wrapped(&mut self, field: SpecialField, inner: ValueId, fact: Fact) -> ValueId {
        let key = (field, inner, fact);
        if let Some(&id) = self.wrapped.get(&key) {
            return id;
        }
        let (field, inner, fact) = key.clone();
        let id = self.alloc(Value::Wrapped { field, inner, fact });
        self.wrapped.insert(key, id);
        id
    }

    /// The special field `field` of `qualifier`: a variable when the qualifier
    /// is one, otherwise a typed value derived from the qualifier's fact.
    pub fn special(&mut self, field: SpecialField, qualifier: ValueId) -> ValueId {
        match self.get(qualifier).clone() {
            Value::Variable(_) => self.var(Descriptor::Special(field), Some(qualifier), field.inherent()),
            Value::Wrapped { field: f, inner, .. } if f == field => inner,
            Value::Wrapped { fact, .. } | Value::Typed(fact) => self.typed(field.from_qualifier(&fact)),
            Value::Unknown => self.typed(field.inherent()),
        }
    }

    /// Element of `array` at the given index range, when it denotes a single
    /// trackable slot.
    pub fn array_element(&mut self, array: ValueId, index: LongRange) -> Option<ValueId> {
        let i = index.as_const()?;
        if !(0..=i32::MAX as i64).contains(&i) {
            return None;
        }
        let inherent = match self.get(array) {
            Value::Variable(info) => match info.inherent.constraint().most_specific().and_then(|t| t.component()) {
                Some(component) => Fact::typed(component, Nullability::Unknown),
                None => Fact::Top,
            },
            _ => return None,
        };
        Some(self.var(Descriptor::ArrayElement(i), Some(array), inherent))
    }

    pub fn is_variable(&self, id: ValueId) -> bool {
        matches!(self.get(id), Value::Variable(_))
    }

    pub fn var_info(&self, id: ValueId) -> Option<&VarInfo> {
        match self.get(id) {
            Value::Variable(info) => Some(info),
            _ => None,
        }
    }

    pub fn qualifier(&self, id: ValueId) -> Option<ValueId> {
        self.var_info(id).and_then(|info| info.qualifier)
    }

    /// Variables (transitively) qualified by `id`.
    pub fn dependents(&self, id: ValueId) -> &[ValueId] {
        &self.dependents[id.index()]
    }

    /// Fact of a value independent of any memory state.
    pub fn inherent(&self, id: ValueId) -> Fact {
        match self.get(id) {
            Value::Variable(info) => info.inherent.clone(),
            Value::Typed(fact) | Value::Wrapped { fact, .. } => fact.clone(),
            Value::Unknown => Fact::Top,
        }
    }

    /// Whether the variable may change behind the analysis' back on a call.
    pub fn is_flushable_by_calls(&self, id: ValueId) -> bool {
        match self.var_info(id) {
            Some(info) => {
                info.descriptor.is_call_flushable() || info.qualifier.is_some_and(|q| self.is_flushable_by_calls(q))
            }
            None => false,
        }
    }

    /// All interned variables.
    pub fn variables(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| matches!(v, Value::Variable(_)))
            .map(|(i, _)| ValueId::new(i))
    }

    /// Human-readable rendering of a value, used in logs and DOT labels.
    pub fn describe(&self, id: ValueId) -> String {
        match self.get(id) {
            Value::Variable(info) => match info.qualifier {
                Some(q) => format!("{}.{}", self.describe(q), info.descriptor),
                None => info.descriptor.to_string(),
            },
            Value::Typed(fact) => fact.to_string(),
            Value::Wrapped { field, inner, .. } => format!("wrap({}, {})", field, self.describe(*inner)),
            Value::Unknown => "?".to_string(),
        }
    }
}
