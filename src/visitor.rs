//! Instruction dispatcher.
//!
//! [`InstructionVisitor`] holds one transfer function per [`Instruction`]
//! kind. A transfer function consumes the incoming [`MemoryState`] and
//! returns the successor work items; an empty result means the path ends
//! here (normal exit, infeasible condition or a definite failure).
//!
//! Every state split is gated by [`MemoryState::apply_condition`]: an arm
//! whose condition is unsatisfiable in the split copy is not produced. A
//! statically decided condition produces exactly one arm without copying.
//!
//! Besides successors, the visitor records what the runner reports after
//! the run: which boolean outcomes each branching instruction produced on
//! non-ephemeral paths, which `instanceof` checks are useful, and the state
//! snapshots seen by closures.

use std::collections::{BTreeMap, BTreeSet};

use crate::condition::Condition;
use crate::config::RunnerConfig;
use crate::contract::MetadataOracle;
use crate::error::AnalysisError;
use crate::fact::{Fact, FloatFact, Nullability, SpecialField, Ty, TypeConstraint};
use crate::instruction::{BooleanOp, ControlFlow, Instruction, InstructionState, NullCheck, NumericOp};
use crate::observer::{Observer, Problem, Verdict};
use crate::range::LongRange;
use crate::relation::RelationType;
use crate::state::MemoryState;
use crate::transfer::{ControlTransferHandler, Transfer};
use crate::types::{Anchor, ClosureId, ThreeState, ValueId};
use crate::value::{Descriptor, ValueFactory};

/// Boolean outcomes produced by one branching instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchReach {
    pub true_reached: bool,
    pub false_reached: bool,
}

/// Bookkeeping accumulated over a run.
#[derive(Debug, Clone, Default)]
pub struct RunRecord {
    pub reach: BTreeMap<usize, BranchReach>,
    pub useful_instanceofs: BTreeSet<usize>,
    pub closures: BTreeMap<ClosureId, Vec<MemoryState>>,
}

pub struct InstructionVisitor<'a> {
    pub(crate) config: &'a RunnerConfig,
    pub(crate) oracle: &'a dyn MetadataOracle,
    handler: &'a mut dyn ControlTransferHandler,
    pub(crate) observer: &'a mut dyn Observer,
    record: RunRecord,
}

impl<'a> InstructionVisitor<'a> {
    pub fn new(
        config: &'a RunnerConfig,
        oracle: &'a dyn MetadataOracle,
        handler: &'a mut dyn ControlTransferHandler,
        observer: &'a mut dyn Observer,
    ) -> Self {
        Self {
            config,
            oracle,
            handler,
            observer,
            record: RunRecord::default(),
        }
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    pub fn into_record(self) -> RunRecord {
        self.record
    }

    /// Applies the instruction at `index` to `state`.
    pub fn visit(
        &mut self,
        factory: &mut ValueFactory,
        flow: &ControlFlow,
        index: usize,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let Some(instruction) = flow.get(index) else {
            // Falling off the end is a normal exit.
            return Ok(Vec::new());
        };
        match instruction {
            Instruction::Push { value, anchor } => {
                self.push_result(*anchor, *value, &mut state);
                Ok(next(index, state))
            }
            Instruction::Pop => {
                pop(&mut state, index)?;
                Ok(next(index, state))
            }
            Instruction::Dup => {
                let value = peek(&state, index)?;
                state.push(value);
                Ok(next(index, state))
            }
            Instruction::Goto { target } => Ok(vec![InstructionState::new(*target, state)]),
            Instruction::Return => Ok(Vec::new()),
            Instruction::EndOfInitializer { is_static } => {
                self.observer.before_initializer_end(*is_static, &state);
                Ok(next(index, state))
            }
            Instruction::ConditionalGoto { target, negated, anchor } => {
                self.visit_conditional_goto(factory, index, *target, *negated, *anchor, state)
            }
            Instruction::Not { anchor } => self.visit_not(factory, index, *anchor, state),
            Instruction::BooleanBinary { op, anchor } => self.visit_boolean_binary(factory, index, *op, *anchor, state),
            Instruction::NumericBinary { op, long } => self.visit_numeric_binary(factory, index, *op, *long, state),
            Instruction::Negate { long } => self.visit_negate(factory, index, *long, state),
            Instruction::StringConcat => self.visit_string_concat(factory, index, state),
            Instruction::Assign {
                assigned,
                initializer,
                array,
                anchor,
            } => self.visit_assign(factory, index, *assigned, *initializer, *array, *anchor, state),
            Instruction::FlushVariable(var) => {
                state.flush_variable(factory, *var);
                Ok(next(index, state))
            }
            Instruction::FlushFields => {
                state.flush_fields(factory);
                Ok(next(index, state))
            }
            Instruction::Escape(vars) => {
                for &var in vars {
                    state.drop_locality(factory, var);
                }
                Ok(next(index, state))
            }
            Instruction::Call(call) => self.visit_call(factory, index, call, state),
            Instruction::MethodReference { interface, anchor, .. } => {
                self.visit_method_reference(factory, index, interface, *anchor, state)
            }
            Instruction::Closure(ids) => {
                for &id in ids {
                    let snapshot = state.closure_snapshot();
                    let snapshots = self.record.closures.entry(id).or_default();
                    if !snapshots.contains(&snapshot) {
                        snapshots.push(snapshot);
                    }
                }
                Ok(next(index, state))
            }
            Instruction::ControlTransfer(transfer) => Ok(self.dispatch(factory, state, transfer, false)),
            Instruction::NewArray { ty } => self.visit_new_array(factory, index, ty, state),
            Instruction::ArrayAccess {
                value,
                out_of_bounds,
                anchor,
            } => self.visit_array_access(factory, index, *value, out_of_bounds.as_ref(), *anchor, state),
            Instruction::SpecialFieldRead { field } => {
                let qualifier = pop(&mut state, index)?;
                let value = factory.special(*field, qualifier);
                state.push(value);
                Ok(next(index, state))
            }
            Instruction::TypeCast {
                ty,
                convertible,
                transfer,
                anchor,
            } => self.visit_type_cast(factory, index, ty, *convertible, transfer.as_ref(), *anchor, state),
            Instruction::Instanceof {
                class_object_check,
                anchor,
            } => self.visit_instanceof(factory, index, *class_object_check, *anchor, state),
            Instruction::CheckNotNull { kind, transfer, anchor } => {
                self.visit_check_not_null(factory, index, *kind, transfer.as_ref(), *anchor, state)
            }
            Instruction::Ensure {
                relation,
                value,
                transfer,
                make_ephemeral,
                anchor,
            } => self.visit_ensure(
                factory,
                index,
                *relation,
                value,
                transfer.as_ref(),
                *make_ephemeral,
                *anchor,
                state,
            ),
        }
    }

    fn visit_conditional_goto(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        target: usize,
        negated: bool,
        anchor: Option<Anchor>,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let value = pop(&mut state, index)?;
        let expected = factory.bool_value(!negated);
        let jump = Condition::eq(factory, value, expected);
        let fallthrough = jump.negate();

        if jump == Condition::True {
            self.reach(index, &state, Some(true));
            self.before_jump(anchor, true);
            return Ok(vec![InstructionState::new(target, state)]);
        }
        if fallthrough == Condition::True {
            self.reach(index, &state, Some(false));
            self.before_jump(anchor, false);
            return Ok(next(index, state));
        }

        let mut result = Vec::new();
        let mut else_state = state.clone();
        if state.apply_condition(factory, jump) {
            self.reach(index, &state, Some(true));
            self.before_jump(anchor, true);
            result.push(InstructionState::new(target, state));
        }
        if else_state.apply_condition(factory, fallthrough) {
            self.reach(index, &else_state, Some(false));
            self.before_jump(anchor, false);
            result.push(InstructionState::new(index + 1, else_state));
        }
        Ok(result)
    }

    fn visit_not(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        anchor: Option<Anchor>,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let value = pop(&mut state, index)?;
        let f = factory.bool_value(false);
        let is_false = Condition::eq(factory, value, f);
        let mut result = Vec::new();
        let mut true_state = state.clone();
        if true_state.apply_condition(factory, is_false) {
            result.push(self.boolean_result(factory, index, anchor, true_state, ThreeState::Yes));
        }
        if state.apply_condition(factory, is_false.negate()) {
            result.push(self.boolean_result(factory, index, anchor, state, ThreeState::No));
        }
        Ok(result)
    }

    fn visit_boolean_binary(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        op: BooleanOp,
        anchor: Option<Anchor>,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let right = pop(&mut state, index)?;
        let left = pop(&mut state, index)?;
        match op {
            BooleanOp::Relation(relation) => Ok(self.visit_relation(factory, index, relation, left, right, anchor, state)),
            BooleanOp::And | BooleanOp::Or => {
                let or = op == BooleanOp::Or;
                let constant = factory.bool_value(or);
                let short_circuit = Condition::eq(factory, right, constant);
                let mut result = Vec::new();
                let mut copy = state.clone();
                if copy.apply_condition(factory, short_circuit) {
                    result.push(self.boolean_result(factory, index, anchor, copy, ThreeState::from_bool(or)));
                }
                if state.apply_condition(factory, short_circuit.negate()) {
                    let known = state.fact(factory, left).const_bool();
                    self.reach(index, &state, known);
                    self.push_result(anchor, left, &mut state);
                    result.push(InstructionState::new(index + 1, state));
                }
                Ok(result)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_relation(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        relation: RelationType,
        left: ValueId,
        right: ValueId,
        anchor: Option<Anchor>,
        mut state: MemoryState,
    ) -> Vec<InstructionState> {
        let equality = matches!(relation, RelationType::Eq | RelationType::Ne);
        if equality
            && state.fact(factory, left).constraint().is_compared_by_equals()
            && state.fact(factory, right).constraint().is_compared_by_equals()
        {
            // Reference equality of such values says little: distinct references
            // give a known result, equal ones do not.
            let mut result = Vec::new();
            let condition = Condition::new(factory, left, RelationType::Eq, right);
            let mut equal_state = state.clone();
            if equal_state.apply_condition(factory, condition) {
                result.push(self.boolean_result(factory, index, anchor, equal_state, ThreeState::Unsure));
            }
            if state.apply_condition(factory, condition.negate()) {
                let value = ThreeState::from_bool(relation == RelationType::Ne);
                result.push(self.boolean_result(factory, index, anchor, state, value));
            }
            return result;
        }

        let mut result = Vec::new();
        if relation.is_ordering() {
            if let Some(unordered) = unordered_state(factory, &state, left, right) {
                result.push(self.boolean_result(factory, index, anchor, unordered, ThreeState::No));
            }
        }
        let relations = relation.split();
        for (i, &sub) in relations.iter().enumerate() {
            let condition = Condition::new(factory, left, sub, right);
            let value = ThreeState::from_bool(relation.is_sub_relation(sub));
            match condition {
                Condition::False => continue,
                Condition::True => return vec![self.boolean_result(factory, index, anchor, state, value)],
                Condition::Relation { .. } => {}
            }
            let mut copy = if i == relations.len() - 1 && !result.is_empty() {
                std::mem::take(&mut state)
            } else {
                state.clone()
            };
            if copy.apply_condition(factory, condition) {
                result.push(self.boolean_result(factory, index, anchor, copy, value));
            }
        }
        if result.is_empty() {
            // No relation holds, e.g. an ordered comparison with NaN.
            result.push(self.boolean_result(factory, index, anchor, state, ThreeState::No));
        }
        result
    }

    fn visit_numeric_binary(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        op: NumericOp,
        long: bool,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let right = pop(&mut state, index)?;
        let left = pop(&mut state, index)?;
        let left_fact = state.fact(factory, left);
        let right_fact = state.fact(factory, right);
        let fact = match (&left_fact, &right_fact) {
            (Fact::Int(a), Fact::Int(b)) => {
                let range = match op {
                    NumericOp::Plus => a.plus(b, long),
                    NumericOp::Minus => a.minus(b, long),
                    NumericOp::Mul => a.mul(b, long),
                    NumericOp::Div => a.div(b, long),
                    NumericOp::Rem => a.rem(b, long),
                };
                if range.is_empty() {
                    // Integral division by a definite zero always throws.
                    return Ok(Vec::new());
                }
                Fact::Int(range)
            }
            (Fact::Float(a), Fact::Float(b)) => match (a.value(), b.value()) {
                (Some(x), Some(y)) => Fact::float(match op {
                    NumericOp::Plus => x + y,
                    NumericOp::Minus => x - y,
                    NumericOp::Mul => x * y,
                    NumericOp::Div => x / y,
                    NumericOp::Rem => x % y,
                }),
                _ => Fact::Float(FloatFact::Any),
            },
            _ => Fact::Top,
        };
        let result = if fact.is_top() { factory.unknown() } else { factory.typed(fact) };
        state.push(result);
        Ok(next(index, state))
    }

    fn visit_negate(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        long: bool,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let value = pop(&mut state, index)?;
        let result = match state.fact(factory, value) {
            Fact::Int(range) => factory.typed(Fact::Int(range.negate(long))),
            Fact::Float(f) => match f.value() {
                Some(x) => factory.typed(Fact::float(-x)),
                None => factory.typed(Fact::Float(f)),
            },
            _ => factory.unknown(),
        };
        state.push(result);
        Ok(next(index, state))
    }

    fn visit_string_concat(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let right = pop(&mut state, index)?;
        let left = pop(&mut state, index)?;
        let left_fact = state.fact(factory, left);
        let right_fact = state.fact(factory, right);
        if let (Some(l), Some(r)) = (left_fact.const_str(), right_fact.const_str()) {
            if l.encode_utf16().count() + r.encode_utf16().count() <= self.config.max_string_length_to_track {
                let folded = format!("{}{}", l, r);
                let result = factory.string(&folded);
                state.push(result);
                return Ok(next(index, state));
            }
        }

        let left_length = factory.special(SpecialField::StringLength, left);
        let right_length = factory.special(SpecialField::StringLength, right);
        let length = match (state.fact(factory, left_length), state.fact(factory, right_length)) {
            (Fact::Int(a), Fact::Int(b)) => a.plus(&b, false),
            _ => LongRange::int(),
        };
        let length = length.meet(&LongRange::index_range());
        let result = if length.as_const() == Some(0) {
            factory.string("")
        } else {
            let fact = Fact::exact(&Ty::string(), Nullability::NotNull).with_special(SpecialField::StringLength, Fact::range(length));
            factory.typed(fact)
        };
        state.push(result);
        Ok(next(index, state))
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_assign(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        assigned: Option<ValueId>,
        initializer: bool,
        array: Option<ValueId>,
        anchor: Option<Anchor>,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let mut source = pop(&mut state, index)?;
        let mut dest = pop(&mut state, index)?;
        if !factory.is_variable(dest) {
            if let Some(var) = assigned {
                dest = var;
            }
        }
        self.observer.before_assignment(source, dest, &state);

        if source == dest {
            self.push_result(anchor, dest, &mut state);
            flush_unknown_element_write(factory, &mut state, array, dest);
            return Ok(next(index, state));
        }

        if !keeps_locality(factory, source, dest) {
            source = state.drop_locality(factory, source);
        }

        if let Some(info) = factory.var_info(dest).cloned() {
            let escapes = info.descriptor.is_static_field()
                || info.qualifier.is_some_and(|q| !state.fact(factory, q).is_local());
            if escapes {
                source = state.drop_locality(factory, source);
            }
            if !info.descriptor.is_volatile() {
                state.set_var_value(factory, dest, source);
            }
            if initializer
                && info.inherent.nullability() == Nullability::Nullable
                && state.fact(factory, dest).nullability() == Nullability::Unknown
            {
                state.meet_fact(factory, dest, &Fact::nullable());
            }
        }

        self.push_result(anchor, dest, &mut state);
        flush_unknown_element_write(factory, &mut state, array, dest);
        Ok(next(index, state))
    }

    fn visit_method_reference(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        interface: &Ty,
        anchor: Option<Anchor>,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let qualifier = pop(&mut state, index)?;
        let qualifier = state.drop_locality(factory, qualifier);
        self.dereference(factory, &mut state, qualifier, anchor.map(Problem::NullDereference));
        let result = factory.typed(Fact::typed(interface, Nullability::NotNull));
        self.push_result(anchor, result, &mut state);
        Ok(next(index, state))
    }

    fn visit_new_array(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        ty: &Ty,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let length = pop(&mut state, index)?;
        let range = state
            .fact(factory, length)
            .int_range()
            .unwrap_or_else(LongRange::index_range)
            .meet(&LongRange::index_range());
        if range.is_empty() {
            // Negative size always throws.
            return Ok(Vec::new());
        }
        let fact = Fact::exact(ty, Nullability::NotNull)
            .meet(&Fact::local_object())
            .with_special(SpecialField::ArrayLength, Fact::Int(range));
        let array = factory.typed(fact);
        state.push(array);
        Ok(next(index, state))
    }

    fn visit_array_access(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        fallback: Option<ValueId>,
        out_of_bounds: Option<&Transfer>,
        anchor: Option<Anchor>,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let element_index = pop(&mut state, index)?;
        let array = pop(&mut state, index)?;
        let before = state.clone();
        let in_bounds = apply_bounds_check(factory, &mut state, array, element_index);
        if let Some(anchor) = anchor {
            let fact = state.fact(factory, element_index);
            let verdict = if in_bounds { Verdict::Unsure } else { Verdict::AlwaysFails };
            self.observer
                .on_condition(Problem::ArrayIndex(anchor), element_index, &fact, verdict, &state);
        }
        if !in_bounds {
            return Ok(match out_of_bounds {
                Some(transfer) => self.dispatch(factory, before, transfer, true),
                None => Vec::new(),
            });
        }

        let mut result = fallback.unwrap_or_else(|| factory.unknown());
        if let Some(range) = state.fact(factory, element_index).int_range() {
            if let Some(element) = factory.array_element(array, range) {
                result = element;
            }
        }
        if !factory.is_variable(result) && factory.is_variable(array) {
            let elements: Vec<ValueId> = factory
                .dependents(array)
                .iter()
                .copied()
                .filter(|&d| factory.qualifier(d) == Some(array))
                .collect();
            for element in elements {
                state.drop_locality(factory, element);
            }
        }
        self.push_result(anchor, result, &mut state);
        Ok(next(index, state))
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_type_cast(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        ty: &Ty,
        convertible: bool,
        transfer: Option<&Transfer>,
        anchor: Option<Anchor>,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let cast_fact = Fact::typed(ty, Nullability::Unknown);
        let mut result = Vec::new();
        let mut cast_possible = true;

        let mut success = true;
        let mut cast_fail = transfer.map(|_| state.clone());
        if convertible && !cast_top_of_stack(factory, &mut state, &cast_fact, index)? {
            cast_possible = false;
            success = transfer.is_none();
        } else if !convertible {
            success = transfer.is_none();
        }

        if let Some(anchor) = anchor {
            let value = peek(&state, index)?;
            let fact = state.fact(factory, value);
            let verdict = if cast_possible { Verdict::Unsure } else { Verdict::AlwaysFails };
            self.observer.on_condition(Problem::ClassCast(anchor), value, &fact, verdict, &state);
        }
        if success {
            result.push(InstructionState::new(index + 1, state));
        }

        if let (Some(transfer), Some(mut fail_state)) = (transfer, cast_fail.take()) {
            let value = peek(&fail_state, index)?;
            let null = factory.null();
            let target = factory.typed(Fact::typed(ty, Nullability::NotNull));
            let not_null = Condition::new(factory, value, RelationType::Ne, null);
            let not_instance = Condition::new(factory, value, RelationType::IsNot, target);
            if fail_state.apply_condition(factory, not_null) && fail_state.apply_condition(factory, not_instance) {
                result.extend(self.dispatch(factory, fail_state, transfer, true));
            }
        }
        Ok(result)
    }

    fn visit_instanceof(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        class_object_check: bool,
        anchor: Option<Anchor>,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let mut right = pop(&mut state, index)?;
        let left = pop(&mut state, index)?;
        let mut unknown_target = false;
        let mut condition = None;
        if class_object_check {
            match state.fact(factory, right).const_class().cloned() {
                Some(ty) if !ty.is_primitive() => {
                    right = factory.typed(Fact::typed(&ty, Nullability::NotNull));
                }
                _ => {
                    unknown_target = true;
                    let null = factory.null();
                    condition = Some(Condition::new(factory, left, RelationType::Ne, null));
                }
            }
        }
        let condition = match condition {
            Some(c) => c,
            None => Condition::new(factory, left, RelationType::Is, right),
        };

        let left_fact = state.fact(factory, left);
        let mut result = Vec::new();
        let mut useful = unknown_target;
        if condition.is_unknown(factory) {
            useful = if !left_fact.is_top() && !factory.is_variable(left) && !factory.is_variable(right) {
                let right_constraint: TypeConstraint = state.fact(factory, right).constraint();
                !right_constraint.is_super_constraint_of(&left_fact.constraint())
            } else {
                true
            };
            result.push(self.boolean_result(factory, index, anchor, state, ThreeState::Unsure));
        } else {
            let mut true_state = state.clone();
            if true_state.apply_condition(factory, condition) {
                let value = if unknown_target { ThreeState::Unsure } else { ThreeState::Yes };
                result.push(self.boolean_result(factory, index, anchor, true_state, value));
            }
            if state.apply_condition(factory, condition.negate()) {
                if !state.is_null(factory, left) {
                    useful = true;
                } else if left_fact.nullability() == Nullability::Unknown {
                    // Only null fails the check; that arm is not a real outcome.
                    state.mark_ephemeral();
                }
                result.push(self.boolean_result(factory, index, anchor, state, ThreeState::No));
            }
        }
        if useful {
            self.record.useful_instanceofs.insert(index);
        }
        Ok(result)
    }

    fn visit_check_not_null(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        kind: NullCheck,
        transfer: Option<&Transfer>,
        anchor: Option<Anchor>,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        match kind {
            NullCheck::Argument => {
                let value = peek(&state, index)?;
                if let Some(anchor) = anchor {
                    self.check_not_nullable(factory, &state, value, Problem::NullableArgument(anchor));
                }
                Ok(next(index, state))
            }
            NullCheck::Dereference => {
                let value = pop(&mut state, index)?;
                let definitely_null = self.config.stop_on_null_dereference && state.is_null(factory, value);
                let problem = anchor.map(Problem::NullDereference);
                let mut null_state = transfer.map(|_| state.clone());
                let dereferenced = self.dereference(factory, &mut state, value, problem);
                state.push(dereferenced);

                let mut result = Vec::new();
                if !definitely_null {
                    result.push(InstructionState::new(index + 1, state));
                }
                if let (Some(transfer), Some(mut null_state)) = (transfer, null_state.take()) {
                    let null = factory.null();
                    let is_null = Condition::eq(factory, value, null);
                    if null_state.apply_condition(factory, is_null) {
                        result.extend(self.dispatch(factory, null_state, transfer, true));
                    }
                }
                Ok(result)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn visit_ensure(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        relation: RelationType,
        value: &Fact,
        transfer: Option<&Transfer>,
        make_ephemeral: bool,
        anchor: Option<Anchor>,
        mut state: MemoryState,
    ) -> Result<Vec<InstructionState>, AnalysisError> {
        let top = peek(&state, index)?;
        let expected = factory.typed(value.clone());
        let condition = Condition::new(factory, top, relation, expected);
        let problem = anchor.map(Problem::UnsatisfiedCondition);

        if condition == Condition::True {
            self.report(factory, problem, top, Verdict::NeverFails, &state);
            return Ok(next(index, state));
        }

        let Some(transfer) = transfer else {
            let satisfied = state.apply_condition(factory, condition);
            let verdict = if satisfied { Verdict::Unsure } else { Verdict::AlwaysFails };
            self.report(factory, problem, top, verdict, &state);
            return Ok(if satisfied { next(index, state) } else { Vec::new() });
        };

        let mut false_state = state.clone();
        let holds = state.apply_condition(factory, condition);
        let fails = false_state.apply_condition(factory, condition.negate());
        let verdict = if !holds {
            Verdict::AlwaysFails
        } else if !fails {
            Verdict::NeverFails
        } else {
            Verdict::Unsure
        };
        self.report(factory, problem, top, verdict, &state);

        let mut result = Vec::new();
        if holds {
            result.push(InstructionState::new(index + 1, state));
        }
        if fails {
            result.extend(self.dispatch(factory, false_state, transfer, make_ephemeral));
        }
        Ok(result)
    }

    /// Reports a nullability problem and returns the value known not to be null afterwards.
    pub(crate) fn dereference(
        &mut self,
        factory: &mut ValueFactory,
        state: &mut MemoryState,
        value: ValueId,
        problem: Option<Problem>,
    ) -> ValueId {
        if let Some(problem) = problem {
            self.check_not_nullable(factory, state, value, problem);
        }
        let fact = state.fact(factory, value);
        if factory.is_variable(value) {
            if fact.is_null() {
                state.set_fact(factory, value, fact.not_null_version());
            } else {
                state.meet_fact(factory, value, &Fact::not_null());
            }
            value
        } else {
            let narrowed = fact.meet(&Fact::not_null());
            let narrowed = if narrowed.is_bottom() { fact.not_null_version() } else { narrowed };
            if narrowed == fact {
                value
            } else {
                factory.typed(narrowed)
            }
        }
    }

    fn check_not_nullable(&mut self, factory: &ValueFactory, state: &MemoryState, value: ValueId, problem: Problem) {
        let fact = state.fact(factory, value);
        let verdict = match fact.nullability() {
            Nullability::NotNull => Verdict::NeverFails,
            Nullability::Null => Verdict::AlwaysFails,
            Nullability::Nullable | Nullability::Unknown => Verdict::Unsure,
        };
        self.observer.on_condition(problem, value, &fact, verdict, state);
    }

    fn report(
        &mut self,
        factory: &ValueFactory,
        problem: Option<Problem>,
        value: ValueId,
        verdict: Verdict,
        state: &MemoryState,
    ) {
        if let Some(problem) = problem {
            let fact = state.fact(factory, value);
            self.observer.on_condition(problem, value, &fact, verdict, state);
        }
    }

    /// Hands a state to the control-transfer resolver.
    fn dispatch(
        &mut self,
        factory: &mut ValueFactory,
        mut state: MemoryState,
        transfer: &Transfer,
        ephemeral: bool,
    ) -> Vec<InstructionState> {
        if ephemeral {
            state.mark_ephemeral();
        }
        self.handler.dispatch(state, transfer, factory)
    }

    fn boolean_result(
        &mut self,
        factory: &mut ValueFactory,
        index: usize,
        anchor: Option<Anchor>,
        mut state: MemoryState,
        value: ThreeState,
    ) -> InstructionState {
        let known = value.to_bool();
        let result = match known {
            Some(b) => factory.bool_value(b),
            None => factory.unknown(),
        };
        self.reach(index, &state, known);
        self.push_result(anchor, result, &mut state);
        InstructionState::new(index + 1, state)
    }

    pub(crate) fn push_result(&mut self, anchor: Option<Anchor>, value: ValueId, state: &mut MemoryState) {
        if let Some(anchor) = anchor {
            self.observer.before_expression_push(value, anchor, state);
        }
        state.push(value);
    }

    fn before_jump(&mut self, anchor: Option<Anchor>, taken: bool) {
        if let Some(anchor) = anchor {
            self.observer.before_conditional_jump(anchor, taken);
        }
    }

    /// Records a boolean outcome of a branching instruction. `None` means both.
    fn reach(&mut self, index: usize, state: &MemoryState, outcome: Option<bool>) {
        if state.is_ephemeral() {
            return;
        }
        let reach = self.record.reach.entry(index).or_default();
        match outcome {
            Some(true) => reach.true_reached = true,
            Some(false) => reach.false_reached = true,
            None => {
                reach.true_reached = true;
                reach.false_reached = true;
            }
        }
    }
}

pub(crate) fn pop(state: &mut MemoryState, index: usize) -> Result<ValueId, AnalysisError> {
    state.pop().ok_or(AnalysisError::StackUnderflow { index })
}

fn peek(state: &MemoryState, index: usize) -> Result<ValueId, AnalysisError> {
    state.peek().ok_or(AnalysisError::StackUnderflow { index })
}

fn next(index: usize, state: MemoryState) -> Vec<InstructionState> {
    vec![InstructionState::new(index + 1, state)]
}

/// A fresh object stays local when it is moved from a temporary or a call
/// result into a local variable.
/// The state where a float operand that may be NaN is NaN, if feasible.
/// Every ordered comparison is false there.
fn unordered_state(factory: &ValueFactory, state: &MemoryState, left: ValueId, right: ValueId) -> Option<MemoryState> {
    let may_be_nan = |id| state.fact(factory, id) == Fact::Float(FloatFact::Any);
    let operand = if may_be_nan(left) {
        left
    } else if may_be_nan(right) {
        right
    } else {
        return None;
    };
    let mut copy = state.clone();
    copy.meet_fact(factory, operand, &Fact::Float(FloatFact::NaN)).then_some(copy)
}

fn keeps_locality(factory: &ValueFactory, source: ValueId, dest: ValueId) -> bool {
    let dest_is_local = matches!(
        factory.var_info(dest).map(|i| &i.descriptor),
        Some(Descriptor::Local { .. })
    );
    let source_is_transient = matches!(
        factory.var_info(source).map(|i| &i.descriptor),
        Some(Descriptor::Local { temp: true, .. }) | Some(Descriptor::CallResult(_))
    );
    dest_is_local && source_is_transient
}

/// A write to an array slot with unknown index invalidates every tracked slot.
fn flush_unknown_element_write(factory: &ValueFactory, state: &mut MemoryState, array: Option<ValueId>, dest: ValueId) {
    let Some(array) = array else {
        return;
    };
    if factory.is_variable(dest) || !factory.is_variable(array) {
        return;
    }
    for &dependent in factory.dependents(array) {
        if factory.is_flushable_by_calls(dependent) {
            state.flush_variable(factory, dependent);
        }
    }
}

/// Establishes `length > 0`, `index >= 0` and `index < length`, in this order.
fn apply_bounds_check(factory: &mut ValueFactory, state: &mut MemoryState, array: ValueId, index: ValueId) -> bool {
    let length = factory.special(SpecialField::ArrayLength, array);
    let zero = factory.int_value(0);
    let conditions = [
        Condition::new(factory, length, RelationType::Gt, zero),
        Condition::new(factory, index, RelationType::Ge, zero),
        Condition::new(factory, index, RelationType::Lt, length),
    ];
    conditions.into_iter().all(|c| state.apply_condition(factory, c))
}

/// Narrows the top of the stack to `cast`. Returns `false` if no non-null value survives.
fn cast_top_of_stack(
    factory: &mut ValueFactory,
    state: &mut MemoryState,
    cast: &Fact,
    index: usize,
) -> Result<bool, AnalysisError> {
    let value = peek(state, index)?;
    let fact = state.fact(factory, value);
    let narrowed = fact.meet(cast);
    if narrowed == fact {
        return Ok(true);
    }
    if narrowed.is_null() || !state.meet_fact(factory, value, &narrowed) {
        return Ok(false);
    }
    if !factory.is_variable(value) {
        pop(state, index)?;
        let replaced = factory.typed(narrowed);
        state.push(replaced);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::contract::StaticMetadata;
    use crate::observer::{NullObserver, ProblemCollector, Severity};
    use crate::transfer::DefaultTransferHandler;

    struct Fixture {
        config: RunnerConfig,
        oracle: StaticMetadata,
        handler: DefaultTransferHandler,
        factory: ValueFactory,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                config: RunnerConfig::default(),
                oracle: StaticMetadata::new(),
                handler: DefaultTransferHandler,
                factory: ValueFactory::new(),
            }
        }

        fn run_one(
            &mut self,
            observer: &mut dyn Observer,
            instructions: Vec<Instruction>,
            state: MemoryState,
        ) -> Vec<InstructionState> {
            let flow = ControlFlow::new(instructions);
            let mut visitor = InstructionVisitor::new(&self.config, &self.oracle, &mut self.handler, observer);
            visitor.visit(&mut self.factory, &flow, 0, state).unwrap()
        }
    }

    #[test]
    fn test_conditional_goto_splits_on_unknown() {
        let mut fx = Fixture::new();
        let b = fx.factory.local("b", Fact::Bool(None));
        let mut state = MemoryState::new();
        state.push(b);
        let goto = Instruction::ConditionalGoto {
            target: 5,
            negated: false,
            anchor: None,
        };
        let result = fx.run_one(&mut NullObserver, vec![goto], state);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].index, 5);
        assert_eq!(result[0].state.fact(&fx.factory, b), Fact::bool(true));
        assert_eq!(result[1].index, 1);
        assert_eq!(result[1].state.fact(&fx.factory, b), Fact::bool(false));
    }

    #[test]
    fn test_conditional_goto_decided_has_single_successor() {
        let mut fx = Fixture::new();
        let t = fx.factory.bool_value(true);
        let mut state = MemoryState::new();
        state.push(t);
        let goto = Instruction::ConditionalGoto {
            target: 5,
            negated: true,
            anchor: None,
        };
        let result = fx.run_one(&mut NullObserver, vec![goto], state);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].index, 1);
    }

    #[test]
    fn test_le_splits_into_lt_and_eq() {
        let mut fx = Fixture::new();
        let x = fx.factory.local("x", Fact::Int(LongRange::int()));
        let five = fx.factory.int_value(5);
        let mut state = MemoryState::new();
        state.push(x);
        state.push(five);
        let op = Instruction::BooleanBinary {
            op: BooleanOp::Relation(RelationType::Le),
            anchor: None,
        };
        let result = fx.run_one(&mut NullObserver, vec![op], state);
        // x < 5, x > 5, x == 5
        assert_eq!(result.len(), 3);
        let t = fx.factory.bool_value(true);
        let f = fx.factory.bool_value(false);
        let pushed: Vec<ValueId> = result.iter().map(|s| s.state.peek().unwrap()).collect();
        assert_eq!(pushed, vec![t, f, t]);
        assert_eq!(result[2].state.fact(&fx.factory, x), Fact::int(5));
    }

    #[test]
    fn test_new_array_then_access_fails() {
        let mut fx = Fixture::new();
        let zero = fx.factory.int_value(0);
        let mut state = MemoryState::new();
        state.push(zero);
        let result = fx.run_one(
            &mut NullObserver,
            vec![Instruction::NewArray {
                ty: Ty::array(Ty::primitive("int")),
            }],
            state,
        );
        let mut state = result.into_iter().next().unwrap().state;
        state.push(zero);
        let access = Instruction::ArrayAccess {
            value: None,
            out_of_bounds: None,
            anchor: Some(Anchor(1)),
        };
        let mut collector = ProblemCollector::new();
        let result = fx.run_one(&mut collector, vec![access], state);
        assert!(result.is_empty());
        assert_eq!(collector.severity(&Problem::ArrayIndex(Anchor(1))), Some(Severity::Definite));
    }

    #[test]
    fn test_dereference_narrows_to_not_null() {
        let mut fx = Fixture::new();
        let x = fx.factory.local("x", Fact::unknown_ref());
        let mut state = MemoryState::new();
        state.push(x);
        let check = Instruction::CheckNotNull {
            kind: NullCheck::Dereference,
            transfer: None,
            anchor: Some(Anchor(3)),
        };
        let mut collector = ProblemCollector::new();
        let result = fx.run_one(&mut collector, vec![check], state);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].state.fact(&fx.factory, x).nullability(), Nullability::NotNull);
        assert!(collector.was_checked(&Problem::NullDereference(Anchor(3))));
        assert_eq!(collector.severity(&Problem::NullDereference(Anchor(3))), None);
    }

    #[test]
    fn test_null_dereference_with_transfer_diverts_ephemeral() {
        let mut fx = Fixture::new();
        let x = fx.factory.local("x", Fact::nullable());
        let mut state = MemoryState::new();
        state.push(x);
        let check = Instruction::CheckNotNull {
            kind: NullCheck::Dereference,
            transfer: Some(Transfer::Goto(7)),
            anchor: None,
        };
        let result = fx.run_one(&mut NullObserver, vec![check], state);
        assert_eq!(result.len(), 2);
        assert!(!result[0].state.is_ephemeral());
        assert_eq!(result[1].index, 7);
        assert!(result[1].state.is_ephemeral());
        assert!(result[1].state.is_null(&fx.factory, x));
    }

    #[test]
    fn test_string_concat_folds_constants() {
        let mut fx = Fixture::new();
        let a = fx.factory.string("ab");
        let b = fx.factory.string("c");
        let mut state = MemoryState::new();
        state.push(a);
        state.push(b);
        let result = fx.run_one(&mut NullObserver, vec![Instruction::StringConcat], state);
        let top = result[0].state.peek().unwrap();
        assert_eq!(fx.factory.inherent(top).const_str(), Some("abc"));
    }

    #[test]
    fn test_string_reference_equality_is_unsure_when_equal() {
        let mut fx = Fixture::new();
        let s = fx.factory.local("s", Fact::exact(&Ty::string(), Nullability::NotNull));
        let t = fx.factory.local("t", Fact::exact(&Ty::string(), Nullability::NotNull));
        let mut state = MemoryState::new();
        state.push(s);
        state.push(t);
        let eq = Instruction::BooleanBinary {
            op: BooleanOp::Relation(RelationType::Eq),
            anchor: None,
        };
        let result = fx.run_one(&mut NullObserver, vec![eq], state);
        assert_eq!(result.len(), 2);
        let same = result[0].state.peek().unwrap();
        assert!(fx.factory.is_unknown(same));
        let distinct = result[1].state.peek().unwrap();
        assert_eq!(fx.factory.inherent(distinct).const_bool(), Some(false));
    }

    #[test]
    fn test_string_concat_budget_counts_utf16_units() {
        let mut fx = Fixture::new();
        fx.config = RunnerConfig::default().with_max_string_length_to_track(2);
        let a = fx.factory.string("a");
        let smiley = fx.factory.string("\u{1F600}");
        let mut state = MemoryState::new();
        state.push(a);
        state.push(smiley);
        let result = fx.run_one(&mut NullObserver, vec![Instruction::StringConcat], state);
        let top = result[0].state.peek().unwrap();
        let fact = fx.factory.inherent(top);
        assert_eq!(fact.const_str(), None);
        assert_eq!(fact.special(SpecialField::StringLength), Fact::int(3));
    }

    #[test]
    fn test_ordered_self_comparison_of_double_has_nan_arm() {
        let mut fx = Fixture::new();
        let x = fx.factory.local("x", Fact::Float(FloatFact::Any));
        let mut state = MemoryState::new();
        state.push(x);
        state.push(x);
        let le = Instruction::BooleanBinary {
            op: BooleanOp::Relation(RelationType::Le),
            anchor: None,
        };
        let result = fx.run_one(&mut NullObserver, vec![le], state);
        assert_eq!(result.len(), 2);
        let unordered = &result[0].state;
        assert_eq!(unordered.fact(&fx.factory, x), Fact::Float(FloatFact::NaN));
        let pushed = unordered.peek().unwrap();
        assert_eq!(fx.factory.inherent(pushed).const_bool(), Some(false));
        let ordered = &result[1].state;
        assert_eq!(fx.factory.inherent(ordered.peek().unwrap()).const_bool(), Some(true));
    }

    #[test]
    fn test_assign_binds_destination() {
        let mut fx = Fixture::new();
        let x = fx.factory.local("x", Fact::Int(LongRange::int()));
        let seven = fx.factory.int_value(7);
        let mut state = MemoryState::new();
        state.push(x);
        state.push(seven);
        let assign = Instruction::Assign {
            assigned: None,
            initializer: false,
            array: None,
            anchor: None,
        };
        let result = fx.run_one(&mut NullObserver, vec![assign], state);
        assert_eq!(result[0].state.peek(), Some(x));
        assert_eq!(result[0].state.fact(&fx.factory, x), Fact::int(7));
    }

    #[test]
    fn test_instanceof_records_usefulness() {
        let mut fx = Fixture::new();
        let number = Ty::class("java.lang.Number", &[]);
        let integer = Ty::final_class("java.lang.Integer", &["java.lang.Number"]);
        let n = fx.factory.local("n", Fact::typed(&number, Nullability::NotNull));
        let target = fx.factory.typed(Fact::typed(&integer, Nullability::NotNull));
        let mut state = MemoryState::new();
        state.push(n);
        state.push(target);
        let check = Instruction::Instanceof {
            class_object_check: false,
            anchor: None,
        };
        let flow = ControlFlow::new(vec![check]);
        let mut observer = NullObserver;
        let mut visitor = InstructionVisitor::new(&fx.config, &fx.oracle, &mut fx.handler, &mut observer);
        let result = visitor.visit(&mut fx.factory, &flow, 0, state).unwrap();
        assert_eq!(result.len(), 2);
        assert!(visitor.record().useful_instanceofs.contains(&0));
        let reach = visitor.record().reach[&0];
        assert!(reach.true_reached && reach.false_reached);
    }

    #[test]
    fn test_missing_operand_is_underflow() {
        let mut fx = Fixture::new();
        let flow = ControlFlow::new(vec![Instruction::Pop]);
        let mut observer = NullObserver;
        let mut visitor = InstructionVisitor::new(&fx.config, &fx.oracle, &mut fx.handler, &mut observer);
        let result = visitor.visit(&mut fx.factory, &flow, 0, MemoryState::new());
        assert_eq!(result, Err(AnalysisError::StackUnderflow { index: 0 }));
    }
}
