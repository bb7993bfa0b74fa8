//! Lattice facts about runtime values.
//!
//! A [`Fact`] constrains the possible runtime values of one symbolic value:
//! nullability, numeric range, type constraint, locality, mutability and the
//! derived "special fields" (array length, string length).
//!
//! # Lattice Structure
//!
//! *   **Top** (`⊤`): nothing is known.
//! *   **Bottom** (`⊥`): no runtime value satisfies the fact; a memory state
//!     holding a bottom fact is infeasible.
//! *   **Meet** (`⊓`): intersection of the described value sets, defined per
//!     variant pair. Facts of different kinds (a boolean and a reference, say)
//!     meet to bottom.
//!
//! No join is provided: the analysis never merges paths, it keeps them apart
//! and deduplicates structurally equal states instead.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use crate::range::LongRange;
use crate::relation::RelationType;

/// Well-known class names.
pub const OBJECT: &str = "java.lang.Object";
pub const STRING: &str = "java.lang.String";

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct TyData {
    name: String,
    supers: BTreeSet<String>,
    is_final: bool,
    primitive: bool,
    component: Option<Ty>,
}

/// A reference or primitive type as seen by the front-end.
///
/// Types carry their own (transitive) supertype names and finality, which is
/// everything the lattice needs to decide subtyping without a class oracle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ty(Rc<TyData>);

impl Ty {
    /// A non-final class or interface with the given transitive supertypes.
    pub fn class(name: &str, supers: &[&str]) -> Ty {
        Ty::new(name, supers, false)
    }

    /// A final class with the given transitive supertypes.
    pub fn final_class(name: &str, supers: &[&str]) -> Ty {
        Ty::new(name, supers, true)
    }

    fn new(name: &str, supers: &[&str], is_final: bool) -> Ty {
        let mut all: BTreeSet<String> = supers.iter().map(|s| s.to_string()).collect();
        if name != OBJECT {
            all.insert(OBJECT.to_string());
        }
        Ty(Rc::new(TyData {
            name: name.to_string(),
            supers: all,
            is_final,
            primitive: false,
            component: None,
        }))
    }

    pub fn object() -> Ty {
        Ty::class(OBJECT, &[])
    }

    pub fn string() -> Ty {
        Ty::final_class(STRING, &["java.lang.CharSequence", "java.lang.Comparable", "java.io.Serializable"])
    }

    pub fn primitive(name: &str) -> Ty {
        Ty(Rc::new(TyData {
            name: name.to_string(),
            supers: BTreeSet::new(),
            is_final: true,
            primitive: true,
            component: None,
        }))
    }

    /// Array type over the given component.
    pub fn array(component: Ty) -> Ty {
        let supers = ["java.lang.Cloneable", "java.io.Serializable", OBJECT]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Ty(Rc::new(TyData {
            name: format!("{}[]", component.name()),
            supers,
            // Arrays of final (or primitive) components cannot have subtypes.
            is_final: component.is_final(),
            primitive: false,
            component: Some(component),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_final(&self) -> bool {
        self.0.is_final
    }

    pub fn is_primitive(&self) -> bool {
        self.0.primitive
    }

    pub fn component(&self) -> Option<&Ty> {
        self.0.component.as_ref()
    }

    pub fn is_array(&self) -> bool {
        self.0.component.is_some()
    }

    /// Reflexive subtyping: `self <: other`.
    pub fn is_subtype_of(&self, other: &Ty) -> bool {
        if self.name() == other.name() {
            return true;
        }
        if self.is_primitive() || other.is_primitive() {
            return false;
        }
        if let (Some(a), Some(b)) = (self.component(), other.component()) {
            return !a.is_primitive() && !b.is_primitive() && a.is_subtype_of(b);
        }
        self.0.supers.contains(other.name())
    }

    /// Whether some runtime class can be a subtype of both.
    pub fn may_intersect(&self, other: &Ty) -> bool {
        if self.is_subtype_of(other) || other.is_subtype_of(self) {
            return true;
        }
        !(self.is_final() || other.is_final() || self.is_array() || other.is_array())
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Type constraint of a reference value.
///
/// Invariant: `instance_of` never contains a type that is a supertype of
/// another member (it is kept minimal); if `exact` is set, `instance_of` is
/// empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeConstraint {
    exact: Option<Ty>,
    instance_of: BTreeSet<Ty>,
    not_instance_of: BTreeSet<Ty>,
}

impl TypeConstraint {
    pub fn top() -> Self {
        Self::default()
    }

    pub fn exact(ty: Ty) -> Self {
        Self {
            exact: Some(ty),
            ..Self::default()
        }
    }

    pub fn instance_of(ty: Ty) -> Self {
        if ty.name() == OBJECT {
            return Self::top();
        }
        if ty.is_final() {
            return Self::exact(ty);
        }
        let mut instance_of = BTreeSet::new();
        instance_of.insert(ty);
        Self {
            instance_of,
            ..Self::default()
        }
    }

    pub fn not_instance_of(ty: Ty) -> Self {
        let mut not_instance_of = BTreeSet::new();
        not_instance_of.insert(ty);
        Self {
            not_instance_of,
            ..Self::default()
        }
    }

    pub fn is_top(&self) -> bool {
        self.exact.is_none() && self.instance_of.is_empty() && self.not_instance_of.is_empty()
    }

    pub fn exact_type(&self) -> Option<&Ty> {
        self.exact.as_ref()
    }

    /// The most specific known type, if any.
    pub fn most_specific(&self) -> Option<&Ty> {
        self.exact.as_ref().or_else(|| self.instance_of.iter().next())
    }

    pub fn is_exact(&self, name: &str) -> bool {
        self.exact.as_ref().is_some_and(|t| t.name() == name)
    }

    pub fn is_array(&self) -> bool {
        self.most_specific().is_some_and(|t| t.is_array())
    }

    /// Values of these types are usually compared with `equals`, so reference
    /// equality says little about content.
    pub fn is_compared_by_equals(&self) -> bool {
        const BY_EQUALS: [&str; 9] = [
            STRING,
            "java.lang.Integer",
            "java.lang.Long",
            "java.lang.Short",
            "java.lang.Byte",
            "java.lang.Character",
            "java.lang.Boolean",
            "java.lang.Double",
            "java.lang.Float",
        ];
        self.most_specific().is_some_and(|t| BY_EQUALS.contains(&t.name()))
    }

    /// Meet of two constraints; `None` if no class satisfies both.
    pub fn meet(&self, other: &TypeConstraint) -> Option<TypeConstraint> {
        let exact = match (&self.exact, &other.exact) {
            (Some(a), Some(b)) if a != b => return None,
            (Some(a), _) | (_, Some(a)) => Some(a.clone()),
            (None, None) => None,
        };
        let not_instance_of: BTreeSet<Ty> = self
            .not_instance_of
            .union(&other.not_instance_of)
            .cloned()
            .collect();
        let instance_of: BTreeSet<Ty> = self.instance_of.union(&other.instance_of).cloned().collect();

        if let Some(e) = exact {
            if instance_of.iter().any(|i| !e.is_subtype_of(i)) {
                return None;
            }
            if not_instance_of.iter().any(|n| e.is_subtype_of(n)) {
                return None;
            }
            return Some(TypeConstraint::exact(e));
        }

        for a in &instance_of {
            if not_instance_of.iter().any(|n| a.is_subtype_of(n)) {
                return None;
            }
            if instance_of.iter().any(|b| !a.may_intersect(b)) {
                return None;
            }
        }
        // Keep only the most specific members.
        let minimal: BTreeSet<Ty> = instance_of
            .iter()
            .filter(|a| !instance_of.iter().any(|b| b != *a && b.is_subtype_of(a)))
            .cloned()
            .collect();
        Some(TypeConstraint {
            exact: None,
            instance_of: minimal,
            not_instance_of,
        })
    }

    /// Whether every value satisfying `other` also satisfies `self`.
    pub fn is_super_constraint_of(&self, other: &TypeConstraint) -> bool {
        let covers = |required: &Ty| match &other.exact {
            Some(e) => e.is_subtype_of(required),
            None => other.instance_of.iter().any(|i| i.is_subtype_of(required)),
        };
        if let Some(e) = &self.exact {
            if other.exact.as_ref() != Some(e) {
                return false;
            }
        }
        if !self.instance_of.iter().all(covers) {
            return false;
        }
        self.not_instance_of.iter().all(|n| {
            other.not_instance_of.iter().any(|o| n.is_subtype_of(o))
                || other.exact.as_ref().is_some_and(|e| !e.is_subtype_of(n))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Nullability {
    Null,
    NotNull,
    /// Declared or inferred as possibly null: dereferencing is a problem.
    Nullable,
    Unknown,
}

impl Nullability {
    pub fn meet(self, other: Nullability) -> Option<Nullability> {
        use Nullability::*;
        match (self, other) {
            (Null, NotNull) | (NotNull, Null) => None,
            (Null, _) | (_, Null) => Some(Null),
            (NotNull, _) | (_, NotNull) => Some(NotNull),
            (Nullable, _) | (_, Nullable) => Some(Nullable),
            (Unknown, Unknown) => Some(Unknown),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Mutability {
    Unknown,
    Mutable,
    Unmodifiable,
}

impl Mutability {
    pub fn can_be_modified(self) -> bool {
        self != Mutability::Unmodifiable
    }

    pub fn meet(self, other: Mutability) -> Option<Mutability> {
        match (self, other) {
            (Mutability::Unknown, m) | (m, Mutability::Unknown) => Some(m),
            (a, b) if a == b => Some(a),
            _ => None,
        }
    }
}

/// Derived integer properties of a reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpecialField {
    ArrayLength,
    StringLength,
}

impl SpecialField {
    /// The fact every value of this field satisfies.
    pub fn inherent(self) -> Fact {
        Fact::Int(LongRange::index_range())
    }

    /// The field's fact as implied by the qualifier's fact.
    pub fn from_qualifier(self, qualifier: &Fact) -> Fact {
        let Fact::Ref(r) = qualifier else {
            return self.inherent();
        };
        if let (SpecialField::StringLength, Some(RefConst::Str(s))) = (self, &r.constant) {
            return Fact::int(s.encode_utf16().count() as i64);
        }
        match r.special.get(&self) {
            Some(f) => f.meet(&self.inherent()),
            None => self.inherent(),
        }
    }
}

impl fmt::Display for SpecialField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecialField::ArrayLength => write!(f, "length"),
            SpecialField::StringLength => write!(f, "length()"),
        }
    }
}

/// Reference constants other than `null`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RefConst {
    Str(Rc<str>),
    /// A class literal such as `String.class`.
    Class(Ty),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefFact {
    pub nullability: Nullability,
    pub constraint: TypeConstraint,
    pub local: bool,
    pub mutability: Mutability,
    pub special: BTreeMap<SpecialField, Fact>,
    pub constant: Option<RefConst>,
}

impl RefFact {
    fn with_nullability(nullability: Nullability) -> Self {
        RefFact {
            nullability,
            constraint: TypeConstraint::top(),
            local: false,
            mutability: Mutability::Unknown,
            special: BTreeMap::new(),
            constant: None,
        }
    }

    fn meet(&self, other: &RefFact) -> Option<RefFact> {
        let nullability = self.nullability.meet(other.nullability)?;
        let constant = match (&self.constant, &other.constant) {
            (Some(a), Some(b)) if a != b => return None,
            (Some(a), _) | (_, Some(a)) => Some(a.clone()),
            (None, None) => None,
        };
        if nullability == Nullability::Null {
            if constant.is_some() {
                return None;
            }
            return Some(RefFact::with_nullability(Nullability::Null));
        }
        let constraint = self.constraint.meet(&other.constraint)?;
        let mutability = self.mutability.meet(other.mutability)?;
        let mut special = self.special.clone();
        for (field, fact) in &other.special {
            let merged = match special.get(field) {
                Some(existing) => existing.meet(fact),
                None => fact.clone(),
            };
            if merged.is_bottom() {
                return None;
            }
            special.insert(*field, merged);
        }
        Some(RefFact {
            nullability,
            constraint,
            local: self.local || other.local,
            mutability,
            special,
            constant,
        })
    }
}

/// Floating point facts: only constants and NaN are tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FloatFact {
    Any,
    /// Bit pattern of a non-NaN constant.
    Const(u64),
    NaN,
}

impl FloatFact {
    pub fn of(value: f64) -> Self {
        if value.is_nan() {
            FloatFact::NaN
        } else {
            // Normalize -0.0 so that the two zeros compare equal.
            FloatFact::Const((value + 0.0).to_bits())
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            FloatFact::Const(bits) => Some(f64::from_bits(bits)),
            _ => None,
        }
    }
}

/// Lattice element constraining one value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Fact {
    Bottom,
    Top,
    /// `None` means any boolean.
    Bool(Option<bool>),
    Int(LongRange),
    Float(FloatFact),
    Ref(RefFact),
}

impl Fact {
    pub fn null() -> Fact {
        Fact::Ref(RefFact::with_nullability(Nullability::Null))
    }

    pub fn not_null() -> Fact {
        Fact::Ref(RefFact::with_nullability(Nullability::NotNull))
    }

    pub fn nullable() -> Fact {
        Fact::Ref(RefFact::with_nullability(Nullability::Nullable))
    }

    pub fn unknown_ref() -> Fact {
        Fact::Ref(RefFact::with_nullability(Nullability::Unknown))
    }

    pub fn local_object() -> Fact {
        let mut r = RefFact::with_nullability(Nullability::Unknown);
        r.local = true;
        Fact::Ref(r)
    }

    pub fn bool(value: bool) -> Fact {
        Fact::Bool(Some(value))
    }

    pub fn int(value: i64) -> Fact {
        Fact::Int(LongRange::point(value))
    }

    pub fn range(range: LongRange) -> Fact {
        if range.is_empty() {
            Fact::Bottom
        } else {
            Fact::Int(range)
        }
    }

    pub fn float(value: f64) -> Fact {
        Fact::Float(FloatFact::of(value))
    }

    pub fn string(value: &str) -> Fact {
        let mut r = RefFact::with_nullability(Nullability::NotNull);
        r.constraint = TypeConstraint::exact(Ty::string());
        r.constant = Some(RefConst::Str(Rc::from(value)));
        Fact::Ref(r)
    }

    pub fn class_literal(ty: Ty) -> Fact {
        let mut r = RefFact::with_nullability(Nullability::NotNull);
        r.constraint = TypeConstraint::exact(Ty::final_class("java.lang.Class", &[]));
        r.constant = Some(RefConst::Class(ty));
        Fact::Ref(r)
    }

    /// A value of the given declared type.
    pub fn typed(ty: &Ty, nullability: Nullability) -> Fact {
        if ty.is_primitive() {
            return match ty.name() {
                "boolean" => Fact::Bool(None),
                "long" => Fact::Int(LongRange::long()),
                "int" => Fact::Int(LongRange::int()),
                "short" => Fact::Int(LongRange::new(i16::MIN as i64, i16::MAX as i64)),
                "char" => Fact::Int(LongRange::new(0, u16::MAX as i64)),
                "byte" => Fact::Int(LongRange::new(i8::MIN as i64, i8::MAX as i64)),
                "float" | "double" => Fact::Float(FloatFact::Any),
                _ => Fact::Top,
            };
        }
        let mut r = RefFact::with_nullability(nullability);
        r.constraint = TypeConstraint::instance_of(ty.clone());
        Fact::Ref(r)
    }

    /// A value whose runtime class is exactly `ty`.
    pub fn exact(ty: &Ty, nullability: Nullability) -> Fact {
        let mut r = RefFact::with_nullability(nullability);
        r.constraint = TypeConstraint::exact(ty.clone());
        Fact::Ref(r)
    }

    pub fn is_bottom(&self) -> bool {
        matches!(self, Fact::Bottom)
    }

    pub fn is_top(&self) -> bool {
        matches!(self, Fact::Top)
    }

    pub fn meet(&self, other: &Fact) -> Fact {
        match (self, other) {
            (Fact::Bottom, _) | (_, Fact::Bottom) => Fact::Bottom,
            (Fact::Top, f) | (f, Fact::Top) => f.clone(),
            (Fact::Bool(a), Fact::Bool(b)) => match (a, b) {
                (Some(x), Some(y)) if x != y => Fact::Bottom,
                (Some(x), _) | (_, Some(x)) => Fact::Bool(Some(*x)),
                (None, None) => Fact::Bool(None),
            },
            (Fact::Int(a), Fact::Int(b)) => Fact::range(a.meet(b)),
            (Fact::Float(a), Fact::Float(b)) => match (a, b) {
                (FloatFact::Any, f) | (f, FloatFact::Any) => Fact::Float(*f),
                (x, y) if x == y => Fact::Float(*x),
                _ => Fact::Bottom,
            },
            (Fact::Ref(a), Fact::Ref(b)) => match a.meet(b) {
                Some(r) => Fact::Ref(r),
                None => Fact::Bottom,
            },
            _ => Fact::Bottom,
        }
    }

    pub fn as_ref_fact(&self) -> Option<&RefFact> {
        match self {
            Fact::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn nullability(&self) -> Nullability {
        match self {
            Fact::Ref(r) => r.nullability,
            Fact::Top => Nullability::Unknown,
            _ => Nullability::NotNull,
        }
    }

    pub fn is_null(&self) -> bool {
        self.nullability() == Nullability::Null
    }

    pub fn is_local(&self) -> bool {
        self.as_ref_fact().is_some_and(|r| r.local)
    }

    pub fn mutability(&self) -> Mutability {
        self.as_ref_fact().map_or(Mutability::Unknown, |r| r.mutability)
    }

    pub fn constraint(&self) -> TypeConstraint {
        self.as_ref_fact()
            .map(|r| r.constraint.clone())
            .unwrap_or_default()
    }

    pub fn const_bool(&self) -> Option<bool> {
        match self {
            Fact::Bool(b) => *b,
            _ => None,
        }
    }

    pub fn const_int(&self) -> Option<i64> {
        match self {
            Fact::Int(r) => r.as_const(),
            _ => None,
        }
    }

    pub fn int_range(&self) -> Option<LongRange> {
        match self {
            Fact::Int(r) => Some(*r),
            _ => None,
        }
    }

    pub fn const_str(&self) -> Option<&str> {
        match self.as_ref_fact().and_then(|r| r.constant.as_ref()) {
            Some(RefConst::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn const_class(&self) -> Option<&Ty> {
        match self.as_ref_fact().and_then(|r| r.constant.as_ref()) {
            Some(RefConst::Class(t)) => Some(t),
            _ => None,
        }
    }

    /// Whether this fact pins down a single runtime value.
    pub fn is_constant(&self) -> bool {
        match self {
            Fact::Bool(b) => b.is_some(),
            Fact::Int(r) => r.as_const().is_some(),
            Fact::Float(f) => matches!(f, FloatFact::Const(_) | FloatFact::NaN),
            Fact::Ref(r) => r.nullability == Nullability::Null || r.constant.is_some(),
            _ => false,
        }
    }

    pub fn special(&self, field: SpecialField) -> Fact {
        field.from_qualifier(self)
    }

    pub fn with_special(&self, field: SpecialField, value: Fact) -> Fact {
        match self {
            Fact::Ref(r) => {
                let mut r = r.clone();
                r.special.insert(field, value);
                Fact::Ref(r)
            }
            Fact::Top => {
                let mut r = RefFact::with_nullability(Nullability::Unknown);
                r.special.insert(field, value);
                Fact::Ref(r)
            }
            other => other.clone(),
        }
    }

    pub fn drop_locality(&self) -> Fact {
        match self {
            Fact::Ref(r) if r.local => {
                let mut r = r.clone();
                r.local = false;
                Fact::Ref(r)
            }
            other => other.clone(),
        }
    }

    pub fn with_mutability(&self, mutability: Mutability) -> Fact {
        match self {
            Fact::Ref(r) => {
                let mut r = r.clone();
                r.mutability = mutability;
                Fact::Ref(r)
            }
            other => other.clone(),
        }
    }

    /// A reference that has been dereferenced once is known not to be null.
    pub fn not_null_version(&self) -> Fact {
        match self {
            Fact::Ref(r) if r.nullability == Nullability::Null => Fact::not_null(),
            Fact::Ref(r) => {
                let mut r = r.clone();
                r.nullability = Nullability::NotNull;
                Fact::Ref(r)
            }
            Fact::Top => Fact::not_null(),
            other => other.clone(),
        }
    }

    /// Whether an object described by this fact may hold a back-reference
    /// to its owner (everything except primitives and exact strings).
    pub fn may_leak(&self) -> bool {
        match self {
            Fact::Bottom | Fact::Bool(_) | Fact::Int(_) | Fact::Float(_) => false,
            Fact::Top => true,
            Fact::Ref(r) => {
                let mut ty = r.constraint.most_specific().cloned();
                while let Some(t) = ty {
                    match t.component() {
                        Some(c) if c.is_primitive() => return false,
                        Some(c) => ty = Some(c.clone()),
                        None => return t.name() != STRING || r.constraint.exact_type().is_none(),
                    }
                }
                true
            }
        }
    }

    /// Statically decides `self relation other` where both facts describe
    /// fully known operands.
    pub fn decide(&self, relation: RelationType, other: &Fact) -> Option<bool> {
        match relation {
            RelationType::Ne => return self.decide(RelationType::Eq, other).map(|b| !b),
            RelationType::IsNot => return self.decide(RelationType::Is, other).map(|b| !b),
            _ => {}
        }
        if self.is_bottom() || other.is_bottom() {
            return None;
        }
        if relation == RelationType::Is {
            return self.decide_instanceof(other);
        }
        match (self, other) {
            (Fact::Int(a), Fact::Int(b)) => a.decide(relation, b),
            (Fact::Bool(a), Fact::Bool(b)) if relation == RelationType::Eq => match (a, b) {
                (Some(x), Some(y)) => Some(x == y),
                _ => None,
            },
            (Fact::Float(a), Fact::Float(b)) => {
                if *a == FloatFact::NaN || *b == FloatFact::NaN {
                    return Some(false);
                }
                let (x, y) = (a.value()?, b.value()?);
                Some(match relation {
                    RelationType::Eq => x == y,
                    RelationType::Lt => x < y,
                    RelationType::Le => x <= y,
                    RelationType::Gt => x > y,
                    RelationType::Ge => x >= y,
                    _ => return None,
                })
            }
            (Fact::Ref(a), Fact::Ref(b)) if relation == RelationType::Eq => {
                use Nullability::*;
                match (a.nullability, b.nullability) {
                    (Null, Null) => Some(true),
                    (Null, NotNull) | (NotNull, Null) => Some(false),
                    _ if self.meet(other).is_bottom() => Some(false),
                    _ => None,
                }
            }
            _ if !self.is_top() && !other.is_top() && self.meet(other).is_bottom() => {
                if relation == RelationType::Eq {
                    Some(false)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn decide_instanceof(&self, target: &Fact) -> Option<bool> {
        let target_constraint = target.constraint();
        if target_constraint.is_top() {
            return None;
        }
        let Fact::Ref(r) = self else {
            return None;
        };
        if r.nullability == Nullability::Null {
            return Some(false);
        }
        if r.constraint.meet(&target_constraint).is_none() {
            return Some(false);
        }
        if r.nullability == Nullability::NotNull && target_constraint.is_super_constraint_of(&r.constraint) {
            return Some(true);
        }
        None
    }

    /// Narrows `self` assuming `self relation other` holds, where `other` is
    /// the fact of the opposite operand. Returns bottom if impossible.
    pub fn narrow(&self, relation: RelationType, other: &Fact) -> Fact {
        match relation {
            RelationType::Eq => self.meet(other),
            RelationType::Ne => {
                if !other.is_constant() {
                    return self.clone();
                }
                match other {
                    Fact::Ref(o) if o.nullability == Nullability::Null => self.meet(&Fact::not_null()),
                    Fact::Int(o) => match (self, o.as_const()) {
                        (Fact::Int(s), Some(c)) => Fact::range(s.without(c)),
                        _ => self.clone(),
                    },
                    Fact::Bool(Some(b)) => self.meet(&Fact::bool(!b)),
                    Fact::Float(FloatFact::Const(_)) if self == other => Fact::Bottom,
                    _ if self.is_constant() && self == other => Fact::Bottom,
                    _ => self.clone(),
                }
            }
            RelationType::Lt | RelationType::Le | RelationType::Gt | RelationType::Ge => match (self, other) {
                (Fact::Float(FloatFact::NaN), _) | (_, Fact::Float(FloatFact::NaN)) => Fact::Bottom,
                (Fact::Int(_) | Fact::Top, Fact::Int(o)) => self.meet(&Fact::range(o.from_relation(relation))),
                (Fact::Float(_), Fact::Float(_)) => match self.decide(relation, other) {
                    Some(false) => Fact::Bottom,
                    _ => self.clone(),
                },
                _ => self.clone(),
            },
            RelationType::Is => {
                let mut r = RefFact::with_nullability(Nullability::NotNull);
                r.constraint = other.constraint();
                self.meet(&Fact::Ref(r))
            }
            RelationType::IsNot => {
                if self.is_null() {
                    return self.clone();
                }
                let target = other.constraint();
                match target.most_specific() {
                    Some(ty) => {
                        let mut r = RefFact::with_nullability(Nullability::Unknown);
                        r.constraint = TypeConstraint::not_instance_of(ty.clone());
                        let narrowed = self.meet(&Fact::Ref(r));
                        if narrowed.is_bottom() && self.nullability() != Nullability::NotNull {
                            // Only null remains.
                            return self.meet(&Fact::null());
                        }
                        narrowed
                    }
                    None => self.clone(),
                }
            }
        }
    }
}

impl fmt::Display for Fact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fact::Bottom => write!(f, "⊥"),
            Fact::Top => write!(f, "⊤"),
            Fact::Bool(None) => write!(f, "boolean"),
            Fact::Bool(Some(b)) => write!(f, "{}", b),
            Fact::Int(r) => write!(f, "int {}", r),
            Fact::Float(FloatFact::Any) => write!(f, "double"),
            Fact::Float(FloatFact::NaN) => write!(f, "NaN"),
            Fact::Float(c) => write!(f, "{}", c.value().unwrap_or(f64::NAN)),
            Fact::Ref(r) => {
                if r.nullability == Nullability::Null {
                    return write!(f, "null");
                }
                if let Some(RefConst::Str(s)) = &r.constant {
                    return write!(f, "{:?}", s);
                }
                if let Some(RefConst::Class(t)) = &r.constant {
                    return write!(f, "{}.class", t);
                }
                let mut parts = Vec::new();
                match r.nullability {
                    Nullability::NotNull => parts.push("!null".to_string()),
                    Nullability::Nullable => parts.push("nullable".to_string()),
                    _ => {}
                }
                if let Some(t) = r.constraint.exact_type() {
                    parts.push(format!("exactly {}", t));
                } else if let Some(t) = r.constraint.most_specific() {
                    parts.push(format!("instanceof {}", t));
                }
                if r.local {
                    parts.push("local".to_string());
                }
                if r.mutability == Mutability::Unmodifiable {
                    parts.push("unmodifiable".to_string());
                }
                for (field, fact) in &r.special {
                    parts.push(format!("{}={}", field, fact));
                }
                if parts.is_empty() {
                    write!(f, "Object")
                } else {
                    write!(f, "{}", parts.join(" "))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn list() -> Ty {
        Ty::class("java.util.List", &["java.util.Collection"])
    }

    fn array_list() -> Ty {
        Ty::class("java.util.ArrayList", &["java.util.List", "java.util.Collection"])
    }

    #[test]
    fn test_null_meets_not_null_to_bottom() {
        assert!(Fact::null().meet(&Fact::not_null()).is_bottom());
        assert_eq!(Fact::null().meet(&Fact::nullable()), Fact::null());
        assert!(Fact::null().meet(&Fact::string("x")).is_bottom());
    }

    #[test]
    fn test_kind_mismatch_is_bottom() {
        assert!(Fact::bool(true).meet(&Fact::int(1)).is_bottom());
        assert_eq!(Fact::Top.meet(&Fact::int(3)), Fact::int(3));
    }

    #[test]
    fn test_type_constraint_meet() {
        let exact_string = TypeConstraint::exact(Ty::string());
        let not_string = TypeConstraint::not_instance_of(Ty::string());
        assert!(exact_string.meet(&not_string).is_none());

        let a = TypeConstraint::instance_of(list());
        let b = TypeConstraint::instance_of(array_list());
        let m = a.meet(&b).unwrap();
        assert_eq!(m.most_specific().map(|t| t.name().to_string()), Some("java.util.ArrayList".to_string()));

        let exact_list = TypeConstraint::exact(array_list());
        assert!(exact_list.meet(&TypeConstraint::instance_of(Ty::string())).is_none());
    }

    #[test]
    fn test_decide_instanceof() {
        let s = Fact::string("abc");
        let target = Fact::typed(&Ty::class("java.lang.CharSequence", &[]), Nullability::NotNull);
        assert_eq!(s.decide(RelationType::Is, &target), Some(true));
        assert_eq!(Fact::null().decide(RelationType::Is, &target), Some(false));
        let list_value = Fact::typed(&list(), Nullability::Unknown);
        assert_eq!(list_value.decide(RelationType::Is, &target), None);
    }

    #[test]
    fn test_narrow_not_equal_null() {
        let narrowed = Fact::nullable().narrow(RelationType::Ne, &Fact::null());
        assert_eq!(narrowed.nullability(), Nullability::NotNull);
        assert!(Fact::null().narrow(RelationType::Ne, &Fact::null()).is_bottom());
    }

    #[test]
    fn test_narrow_ordering() {
        let x = Fact::range(LongRange::new(0, 10));
        assert_eq!(x.narrow(RelationType::Lt, &Fact::int(5)), Fact::range(LongRange::new(0, 4)));
        assert!(x.narrow(RelationType::Gt, &Fact::int(10)).is_bottom());
        assert!(Fact::float(f64::NAN).narrow(RelationType::Lt, &Fact::float(1.0)).is_bottom());
    }

    #[test]
    fn test_special_field_from_string_constant() {
        assert_eq!(Fact::string("hello").special(SpecialField::StringLength), Fact::int(5));
        // Lengths are counted in UTF-16 code units.
        assert_eq!(Fact::string("a\u{1F600}").special(SpecialField::StringLength), Fact::int(3));
        let arr = Fact::exact(&Ty::array(Ty::primitive("int")), Nullability::NotNull)
            .with_special(SpecialField::ArrayLength, Fact::int(0));
        assert_eq!(arr.special(SpecialField::ArrayLength), Fact::int(0));
    }

    #[test]
    fn test_may_leak() {
        assert!(!Fact::int(1).may_leak());
        assert!(!Fact::string("s").may_leak());
        assert!(Fact::typed(&list(), Nullability::Unknown).may_leak());
        assert!(!Fact::exact(&Ty::array(Ty::primitive("int")), Nullability::NotNull).may_leak());
    }
}
