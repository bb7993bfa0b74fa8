//! Call metadata: contracts, mutation signatures and the oracle that supplies them.
//!
//! The core never inspects method declarations itself. Everything it knows
//! about a call target comes from a [`MetadataOracle`], queried by
//! [`MethodId`] during dispatch.

use std::collections::HashMap;
use std::fmt;

use crate::bitset::BitSet;
use crate::fact::{Fact, Mutability, Nullability, SpecialField};
use crate::range::LongRange;
use crate::relation::RelationType;
use crate::state::MemoryState;
use crate::types::{MethodId, ValueId};
use crate::value::{Descriptor, ValueFactory};

/// Which values a call may modify.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MutationSignature {
    this: bool,
    args: BitSet,
    unknown: bool,
}

impl Default for MutationSignature {
    fn default() -> Self {
        Self::unknown()
    }
}

impl MutationSignature {
    /// The call may modify anything reachable.
    pub fn unknown() -> Self {
        Self {
            this: true,
            args: BitSet::empty(),
            unknown: true,
        }
    }

    /// The call modifies nothing.
    pub fn pure() -> Self {
        Self {
            this: false,
            args: BitSet::empty(),
            unknown: false,
        }
    }

    pub fn also_mutates_this(mut self) -> Self {
        self.this = true;
        self
    }

    pub fn also_mutates_arg(mut self, index: usize) -> Self {
        self.args.insert(index);
        self
    }

    pub fn is_unknown(&self) -> bool {
        self.unknown
    }

    pub fn is_pure(&self) -> bool {
        !self.unknown && !self.this && self.args.is_empty()
    }

    pub fn mutates_this(&self) -> bool {
        self.this
    }

    pub fn mutates_arg(&self, index: usize) -> bool {
        self.unknown || self.args.contains(index)
    }
}

/// Operand of a contract condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractValue {
    Qualifier,
    Arg(usize),
    Constant(Fact),
}

impl ContractValue {
    pub fn null() -> Self {
        ContractValue::Constant(Fact::null())
    }

    fn resolve(&self, args: &CallArguments, factory: &mut ValueFactory) -> ValueId {
        match self {
            ContractValue::Qualifier => args.qualifier,
            ContractValue::Arg(i) => args.args.get(*i).copied().unwrap_or_else(|| factory.unknown()),
            ContractValue::Constant(fact) => factory.typed(fact.clone()),
        }
    }
}

impl fmt::Display for ContractValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractValue::Qualifier => write!(f, "this"),
            ContractValue::Arg(i) => write!(f, "param{}", i + 1),
            ContractValue::Constant(fact) => write!(f, "{}", fact),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractCondition {
    pub left: ContractValue,
    pub relation: RelationType,
    pub right: ContractValue,
}

impl ContractCondition {
    pub fn new(left: ContractValue, relation: RelationType, right: ContractValue) -> Self {
        Self { left, relation, right }
    }

    /// `param == null`
    pub fn arg_is_null(index: usize) -> Self {
        Self::new(ContractValue::Arg(index), RelationType::Eq, ContractValue::null())
    }

    /// `param != null`
    pub fn arg_not_null(index: usize) -> Self {
        Self::new(ContractValue::Arg(index), RelationType::Ne, ContractValue::null())
    }

    pub(crate) fn resolve(&self, args: &CallArguments, factory: &mut ValueFactory) -> (ValueId, RelationType, ValueId) {
        let left = self.left.resolve(args, factory);
        let right = self.right.resolve(args, factory);
        (left, self.relation, right)
    }
}

/// What the call returns when a contract's conditions hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractReturn {
    Value(Fact),
    /// The call throws.
    Fail,
    Qualifier,
    Arg(usize),
}

impl ContractReturn {
    pub fn is_fail(&self) -> bool {
        matches!(self, ContractReturn::Fail)
    }

    /// The returned value, or `None` for a failing contract.
    pub(crate) fn value(&self, args: &CallArguments, factory: &mut ValueFactory) -> Option<ValueId> {
        match self {
            ContractReturn::Value(fact) => Some(factory.typed(fact.clone())),
            ContractReturn::Fail => None,
            ContractReturn::Qualifier => Some(args.qualifier),
            ContractReturn::Arg(i) => Some(args.args.get(*i).copied().unwrap_or_else(|| factory.unknown())),
        }
    }
}

/// Declared rule: if every condition holds, the call returns `result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub conditions: Vec<ContractCondition>,
    pub result: ContractReturn,
}

impl Contract {
    pub fn new(conditions: Vec<ContractCondition>, result: ContractReturn) -> Self {
        Self { conditions, result }
    }

    /// A contract without conditions applies to every call.
    pub fn is_trivial(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let conditions: Vec<String> = self
            .conditions
            .iter()
            .map(|c| format!("{} {} {}", c.left, c.relation, c.right))
            .collect();
        let result = match &self.result {
            ContractReturn::Value(fact) => fact.to_string(),
            ContractReturn::Fail => "fail".to_string(),
            ContractReturn::Qualifier => "this".to_string(),
            ContractReturn::Arg(i) => format!("param{}", i + 1),
        };
        write!(f, "{} -> {}", conditions.join(" && "), result)
    }
}

/// Values popped for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallArguments {
    pub qualifier: ValueId,
    pub args: Vec<ValueId>,
    pub mutation: MutationSignature,
}

/// Computes a call result from the arguments, overriding the generic chain.
pub trait CustomHandler {
    fn result(&self, args: &CallArguments, state: &MemoryState, factory: &mut ValueFactory) -> Option<ValueId>;
}

/// Everything known about a call target.
#[derive(Debug, Clone, Default)]
pub struct MethodInfo {
    pub return_nullability: Option<Nullability>,
    pub mutation: MutationSignature,
    /// The mutation signature was declared rather than inferred.
    pub explicit_mutation: bool,
    pub contracts: Vec<Contract>,
    /// The call reads a special field of its qualifier (e.g. `String.length()`).
    pub special_field: Option<SpecialField>,
    /// The call is a plain getter of the described field.
    pub getter: Option<Descriptor>,
    /// Known constant result.
    pub precomputed: Option<Fact>,
    /// Declared range of an integral result.
    pub range: Option<LongRange>,
    pub mutability: Option<Mutability>,
    /// Arguments never escape through this call.
    pub no_parameter_leak: bool,
}

impl MethodInfo {
    pub fn pure() -> Self {
        Self {
            mutation: MutationSignature::pure(),
            ..Self::default()
        }
    }

    pub fn with_contracts(mut self, contracts: Vec<Contract>) -> Self {
        self.contracts = contracts;
        self
    }

    pub fn with_return_nullability(mut self, nullability: Nullability) -> Self {
        self.return_nullability = Some(nullability);
        self
    }

    pub fn with_mutation(mut self, mutation: MutationSignature, explicit: bool) -> Self {
        self.mutation = mutation;
        self.explicit_mutation = explicit;
        self
    }

    pub fn with_special_field(mut self, field: SpecialField) -> Self {
        self.special_field = Some(field);
        self
    }

    pub fn with_range(mut self, range: LongRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// Read-only source of call metadata.
pub trait MetadataOracle {
    fn method_info(&self, method: MethodId) -> Option<&MethodInfo>;

    fn custom_handler(&self, _method: MethodId) -> Option<&dyn CustomHandler> {
        None
    }
}

/// Oracle backed by an in-memory table.
#[derive(Default)]
pub struct StaticMetadata {
    methods: HashMap<MethodId, MethodInfo>,
    handlers: HashMap<MethodId, Box<dyn CustomHandler>>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, method: MethodId, info: MethodInfo) {
        self.methods.insert(method, info);
    }

    pub fn insert_handler(&mut self, method: MethodId, handler: Box<dyn CustomHandler>) {
        self.handlers.insert(method, handler);
    }
}

impl MetadataOracle for StaticMetadata {
    fn method_info(&self, method: MethodId) -> Option<&MethodInfo> {
        self.methods.get(&method)
    }

    fn custom_handler(&self, method: MethodId) -> Option<&dyn CustomHandler> {
        self.handlers.get(&method).map(|h| h.as_ref())
    }
}
