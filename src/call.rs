//! Call evaluation.
//!
//! A call pops its arguments (right to left) and its qualifier, computes a
//! default result from the target's [`MethodInfo`], then expands declared
//! [`Contract`]s: each contract splits the live states into those where all
//! of its conditions hold (finalized with the contract's result) and those
//! where some condition fails (passed on to the next contract). States left
//! after the last contract get the default result.
//!
//! Expansion is abandoned in favor of the single default result when the
//! number of live plus finalized states exceeds
//! [`RunnerConfig::contract_complexity_limit`](crate::config::RunnerConfig).

use log::debug;

use crate::condition::Condition;
use crate::contract::{CallArguments, Contract, MethodInfo, MutationSignature};
use crate::error::AnalysisError;
use crate::fact::{Fact, Mutability, Nullability, SpecialField};
use crate::instruction::{CallInstruction, InstructionState};
use crate::observer::{Problem, Verdict};
use crate::state::MemoryState;
use crate::types::ValueId;
use crate::value::{Value, ValueFactory};
use crate::visitor::{pop, InstructionVisitor};

impl InstructionVisitor<'_> {
    pub(crate) fn visit_call(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        call: &CallInstruction,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let oracle = self.oracle;
        let unknown_info;
        let info: &MethodInfo = match call.method.and_then(|m| oracle.method_info(m)) {
            Some(info) => info,
            None => {
                unknown_info = MethodInfo::default();
                &unknown_info
            }
        };

        let args = self.pop_call_arguments(factory, index, call, info, &mut state)?;
        let default_result = self.default_result(factory, call, info, &args, &state);

        let mut finals: Vec<MemoryState> = Vec::new();
        let mut live = vec![state.clone()];
        if !factory.inherent(default_result).is_constant() {
            for contract in &info.contracts {
                live = add_contract_results(factory, contract, live, &args, &mut finals);
                if live.len() + finals.len() > self.config.contract_complexity_limit {
                    debug!("Contract expansion at #{} too complex, using the default result", index);
                    finals.clear();
                    live = vec![state];
                    break;
                }
            }
        }
        for mut s in live {
            s.push(default_result);
            finals.push(s);
        }

        let mut unique: Vec<MemoryState> = Vec::with_capacity(finals.len());
        for s in finals {
            if !unique.contains(&s) {
                unique.push(s);
            }
        }

        let mut result = Vec::with_capacity(unique.len());
        for mut s in unique {
            flush_after_call(factory, &mut s, &args);
            let value = pop(&mut s, index)?;
            self.push_result(call.anchor, value, &mut s);
            result.push(InstructionState::new(index + 1, s));
        }
        Ok(result)
    }

    fn pop_call_arguments(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        call: &CallInstruction,
        info: &MethodInfo,
        state: &mut MemoryState,
    ) -> Result<CallArguments, AnalysisError> {
        let mutation = &info.mutation;
        let result_may_leak = call
            .return_type
            .as_ref()
            .is_some_and(|ty| Fact::typed(ty, Nullability::Unknown).may_leak());

        let mut args = vec![factory.unknown(); call.arg_count];
        for i in (0..call.arg_count).rev() {
            let mut arg = pop(state, index)?;
            let only_self_mutated = mutation.is_pure() || *mutation == MutationSignature::pure().also_mutates_arg(i);
            let may_not_leak = info.no_parameter_leak || (only_self_mutated && !result_may_leak);
            if !may_not_leak {
                arg = state.drop_locality(factory, arg);
            }
            if !mutation.is_unknown() && mutation.mutates_arg(i) {
                self.check_mutable(factory, state, arg, call, false);
            }
            args[i] = arg;
        }

        let mut qualifier = pop(state, index)?;
        if info.explicit_mutation && mutation.mutates_this() {
            self.check_mutable(factory, state, qualifier, call, true);
        }
        let constraint = state.fact(factory, qualifier).constraint();
        if !constraint.is_array()
            && (constraint.is_compared_by_equals() || may_leak_this(factory, state, mutation, result_may_leak, &args))
        {
            qualifier = state.drop_locality(factory, qualifier);
        }

        Ok(CallArguments {
            qualifier,
            args,
            mutation: mutation.clone(),
        })
    }

    /// Reports modification of an unmodifiable value, then treats it as mutable.
    fn check_mutable(
        &mut self,
        factory: &mut ValueFactory,
        state: &mut MemoryState,
        value: ValueId,
        call: &CallInstruction,
        receiver: bool,
    ) {
        let fact = state.fact(factory, value);
        if fact.mutability().can_be_modified() {
            return;
        }
        if fact.constraint().is_array() {
            // Empty arrays cannot be modified anyway.
            let length = factory.special(SpecialField::ArrayLength, value);
            if state.fact(factory, length).const_int() == Some(0) {
                return;
            }
        }
        if let Some(anchor) = call.anchor {
            let problem = Problem::Mutability { anchor, receiver };
            self.observer
                .on_condition(problem, value, &fact, Verdict::AlwaysFails, state);
        }
        state.set_fact(factory, value, fact.with_mutability(Mutability::Mutable));
    }

    fn default_result(
        &self,
        factory: &mut ValueFactory,
        call: &CallInstruction,
        info: &MethodInfo,
        args: &CallArguments,
        state: &MemoryState,
    ) -> ValueId {
        let oracle = self.oracle;
        if let Some(handler) = call.method.and_then(|m| oracle.custom_handler(m)) {
            if let Some(value) = handler.result(args, state, factory) {
                return value;
            }
        }
        let qualifier = args.qualifier;
        if let (Value::Wrapped { field, inner, .. }, Some(special)) = (factory.get(qualifier), info.special_field) {
            if *field == special {
                return *inner;
            }
        }
        if let Some(fact) = &info.precomputed {
            return factory.typed(fact.clone());
        }
        if let Some(field) = info.special_field {
            return factory.special(field, qualifier);
        }
        if let Some(getter) = &info.getter {
            if factory.is_variable(qualifier) {
                let inherent = match &call.return_type {
                    Some(ty) => Fact::typed(ty, info.return_nullability.unwrap_or(Nullability::Unknown)),
                    None => Fact::Top,
                };
                return factory.var(getter.clone(), Some(qualifier), inherent);
            }
        }

        let Some(ty) = &call.return_type else {
            return factory.unknown();
        };
        if ty.is_primitive() {
            let mut fact = Fact::typed(ty, Nullability::NotNull);
            if let (Fact::Int(declared), Some(range)) = (&fact, info.range) {
                let narrowed = declared.meet(&range);
                if !narrowed.is_empty() {
                    fact = Fact::Int(narrowed);
                }
            }
            return factory.typed(fact);
        }
        let mut fact = if call.is_constructor {
            Fact::exact(ty, Nullability::NotNull)
        } else {
            Fact::typed(ty, info.return_nullability.unwrap_or(Nullability::Unknown))
        };
        if call.is_constructor && info.mutation.is_pure() && !fact.constraint().is_compared_by_equals() {
            fact = fact.meet(&Fact::local_object());
        }
        if let Some(mutability) = info.mutability {
            fact = fact.with_mutability(mutability);
        }
        factory.typed(fact)
    }
}

/// Whether the call may store a reference to its receiver somewhere reachable.
fn may_leak_this(
    factory: &ValueFactory,
    state: &MemoryState,
    mutation: &MutationSignature,
    result_may_leak: bool,
    args: &[ValueId],
) -> bool {
    if mutation.is_unknown() || result_may_leak {
        return true;
    }
    args.iter()
        .enumerate()
        .any(|(i, &arg)| mutation.mutates_arg(i) && state.fact(factory, arg).may_leak())
}

/// Applies one contract to every live state.
///
/// States in which all conditions hold are finalized with the contract's
/// result (or dropped, for a failing contract); the negation of each
/// condition yields a state that continues to the next contract.
fn add_contract_results(
    factory: &mut ValueFactory,
    contract: &Contract,
    states: Vec<MemoryState>,
    args: &CallArguments,
    finals: &mut Vec<MemoryState>,
) -> Vec<MemoryState> {
    if contract.is_trivial() {
        for mut state in states {
            if let Some(value) = contract.result.value(args, factory) {
                state.push(value);
                finals.push(state);
            }
        }
        return Vec::new();
    }

    let mut rest: Vec<MemoryState> = Vec::new();
    for state in states {
        let mut live = Some(state);
        for condition in &contract.conditions {
            let Some(mut current) = live.take() else {
                break;
            };
            let (left, relation, right) = condition.resolve(args, factory);
            let condition = Condition::new(factory, left, relation, right);
            let mut negated = current.clone();
            if negated.apply_condition(factory, condition.negate()) && !rest.contains(&negated) {
                rest.push(negated);
            }
            if current.apply_condition(factory, condition) {
                live = Some(current);
            }
        }
        if let Some(mut state) = live {
            if let Some(value) = contract.result.value(args, factory) {
                state.push(value);
                finals.push(state);
            }
        }
    }
    rest
}

/// Forgets what the call may have changed.
fn flush_after_call(factory: &ValueFactory, state: &mut MemoryState, args: &CallArguments) {
    if args.mutation.is_unknown() {
        state.flush_fields(factory);
        for &value in std::iter::once(&args.qualifier).chain(args.args.iter()) {
            if factory.is_variable(value) && !state.fact(factory, value).is_local() {
                flush_dependents(factory, state, value);
            }
        }
        return;
    }
    if args.mutation.mutates_this() {
        flush_dependents(factory, state, args.qualifier);
    }
    for (i, &arg) in args.args.iter().enumerate() {
        if args.mutation.mutates_arg(i) {
            flush_dependents(factory, state, arg);
        }
    }
}

fn flush_dependents(factory: &ValueFactory, state: &mut MemoryState, value: ValueId) {
    for &dependent in factory.dependents(value) {
        state.flush_variable(factory, dependent);
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::config::RunnerConfig;
    use crate::contract::{ContractCondition, ContractReturn, StaticMetadata};
    use crate::fact::Ty;
    use crate::instruction::{ControlFlow, Instruction};
    use crate::observer::{NullObserver, ProblemCollector, Severity};
    use crate::transfer::DefaultTransferHandler;
    use crate::types::{Anchor, MethodId};

    fn call(method: u32, arg_count: usize, return_type: Option<Ty>) -> Instruction {
        Instruction::Call(CallInstruction {
            method: Some(MethodId(method)),
            arg_count,
            return_type,
            is_constructor: false,
            anchor: Some(Anchor(method)),
        })
    }

    fn visit(
        oracle: &StaticMetadata,
        config: &RunnerConfig,
        factory: &mut ValueFactory,
        observer: &mut dyn crate::observer::Observer,
        instruction: Instruction,
        state: MemoryState,
    ) -> Vec<InstructionState> {
        let flow = ControlFlow::new(vec![instruction]);
        let mut handler = DefaultTransferHandler;
        let mut visitor = InstructionVisitor::new(config, oracle, &mut handler, observer);
        visitor.visit(factory, &flow, 0, state).unwrap()
    }

    fn null_check_contracts() -> Vec<Contract> {
        vec![
            Contract::new(vec![ContractCondition::arg_is_null(0)], ContractReturn::Value(Fact::bool(false))),
            Contract::new(vec![ContractCondition::arg_not_null(0)], ContractReturn::Value(Fact::bool(true))),
        ]
    }

    #[test]
    fn test_contracts_split_on_argument() {
        let mut factory = ValueFactory::new();
        let mut oracle = StaticMetadata::new();
        oracle.insert(MethodId(1), MethodInfo::pure().with_contracts(null_check_contracts()));
        let p = factory.parameter("p", 0, Fact::unknown_ref());
        let mut state = MemoryState::new();
        state.push(factory.unknown());
        state.push(p);

        let config = RunnerConfig::default();
        let result = visit(
            &oracle,
            &config,
            &mut factory,
            &mut NullObserver,
            call(1, 1, Some(Ty::primitive("boolean"))),
            state,
        );
        assert_eq!(result.len(), 2);
        let f = factory.bool_value(false);
        let t = factory.bool_value(true);
        assert_eq!(result[0].state.peek(), Some(f));
        assert!(result[0].state.is_null(&factory, p));
        assert_eq!(result[1].state.peek(), Some(t));
        assert_eq!(result[1].state.fact(&factory, p).nullability(), Nullability::NotNull);
    }

    #[test]
    fn test_contract_complexity_limit_reverts_to_default() {
        let mut factory = ValueFactory::new();
        let mut oracle = StaticMetadata::new();
        oracle.insert(MethodId(1), MethodInfo::pure().with_contracts(null_check_contracts()));
        let p = factory.parameter("p", 0, Fact::unknown_ref());
        let mut state = MemoryState::new();
        state.push(factory.unknown());
        state.push(p);

        let config = RunnerConfig::default().with_contract_complexity_limit(1);
        let result = visit(
            &oracle,
            &config,
            &mut factory,
            &mut NullObserver,
            call(1, 1, Some(Ty::primitive("boolean"))),
            state,
        );
        assert_eq!(result.len(), 1);
        let top = result[0].state.peek().unwrap();
        assert_eq!(factory.inherent(top), Fact::Bool(None));
    }

    #[test]
    fn test_unknown_call_flushes_fields() {
        let mut factory = ValueFactory::new();
        let this = factory.parameter("this", 0, Fact::not_null());
        let field = factory.field(this, "f", Fact::unknown_ref());
        let mut state = MemoryState::new();
        state.meet_fact(&factory, field, &Fact::not_null());
        state.push(factory.unknown());

        let oracle = StaticMetadata::new();
        let config = RunnerConfig::default();
        let result = visit(&oracle, &config, &mut factory, &mut NullObserver, call(9, 0, None), state);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].state.fact(&factory, field).nullability(), Nullability::Unknown);
    }

    #[test]
    fn test_pure_call_keeps_fields() {
        let mut factory = ValueFactory::new();
        let this = factory.parameter("this", 0, Fact::not_null());
        let field = factory.field(this, "f", Fact::unknown_ref());
        let mut state = MemoryState::new();
        state.meet_fact(&factory, field, &Fact::not_null());
        state.push(factory.unknown());

        let mut oracle = StaticMetadata::new();
        oracle.insert(MethodId(2), MethodInfo::pure().with_return_nullability(Nullability::NotNull));
        let config = RunnerConfig::default();
        let result = visit(
            &oracle,
            &config,
            &mut factory,
            &mut NullObserver,
            call(2, 0, Some(Ty::object())),
            state,
        );
        assert_eq!(result[0].state.fact(&factory, field).nullability(), Nullability::NotNull);
        let top = result[0].state.peek().unwrap();
        assert_eq!(factory.inherent(top).nullability(), Nullability::NotNull);
    }

    #[test]
    fn test_mutating_unmodifiable_receiver_is_reported() {
        let mut factory = ValueFactory::new();
        let list_fact = Fact::typed(&Ty::class("java.util.List", &[]), Nullability::NotNull);
        let list = factory.local("list", list_fact.clone());
        let mut state = MemoryState::new();
        state.set_fact(&factory, list, list_fact.with_mutability(Mutability::Unmodifiable));
        state.push(list);

        let mut oracle = StaticMetadata::new();
        oracle.insert(
            MethodId(3),
            MethodInfo::default().with_mutation(MutationSignature::pure().also_mutates_this(), true),
        );
        let config = RunnerConfig::default();
        let mut collector = ProblemCollector::new();
        let result = visit(&oracle, &config, &mut factory, &mut collector, call(3, 0, None), state);
        let problem = Problem::Mutability {
            anchor: Anchor(3),
            receiver: true,
        };
        assert_eq!(collector.severity(&problem), Some(Severity::Definite));
        assert_eq!(result[0].state.fact(&factory, list).mutability(), Mutability::Mutable);
    }

    #[test]
    fn test_range_from_metadata() {
        let mut factory = ValueFactory::new();
        let mut state = MemoryState::new();
        state.push(factory.unknown());
        let mut oracle = StaticMetadata::new();
        oracle.insert(MethodId(4), MethodInfo::pure().with_range(crate::range::LongRange::new(0, 9)));
        let config = RunnerConfig::default();
        let result = visit(
            &oracle,
            &config,
            &mut factory,
            &mut NullObserver,
            call(4, 0, Some(Ty::primitive("int"))),
            state,
        );
        let top = result[0].state.peek().unwrap();
        assert_eq!(factory.inherent(top).int_range(), Some(crate::range::LongRange::new(0, 9)));
    }
}
