use std::fs;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use log::info;

use dfa_rs::config::RunnerConfig;
use dfa_rs::contract::{Contract, ContractCondition, ContractReturn, MethodInfo, StaticMetadata};
use dfa_rs::fact::{Fact, Nullability, Ty};
use dfa_rs::instruction::{BooleanOp, CallInstruction, ControlFlow, Instruction, NullCheck};
use dfa_rs::observer::{Diagnostics, ProblemCollector};
use dfa_rs::relation::RelationType;
use dfa_rs::runner::DataFlowRunner;
use dfa_rs::types::{Anchor, MethodId};
use dfa_rs::value::ValueFactory;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    /// `if (x == null) return; x.foo();`
    NullGuard,
    /// `int[] a = new int[0]; a[0] = 1;`
    EmptyArray,
    /// `if (check(p)) p.bar();` with a contract on `check`
    Contract,
    /// Many independent branches
    Wide,
    /// `x.foo(); x.bar();` with a nullable `x`
    Nullable,
}

#[derive(Debug, Parser)]
#[command(author, version)]
struct Cli {
    /// Scenario to analyze
    #[arg(value_enum, default_value = "null-guard")]
    scenario: Scenario,

    /// Number of branches in the `wide` scenario
    #[arg(long, default_value = "200")]
    branches: u32,

    /// Write the flow in DOT format to this file
    #[arg(long, value_name = "FILE")]
    dot: Option<PathBuf>,

    /// Log every processed instruction
    #[arg(short, long)]
    verbose: bool,
}

fn push(value: dfa_rs::types::ValueId) -> Instruction {
    Instruction::Push { value, anchor: None }
}

fn dereference(anchor: u32) -> Instruction {
    Instruction::CheckNotNull {
        kind: NullCheck::Dereference,
        transfer: None,
        anchor: Some(Anchor(anchor)),
    }
}

fn void_call(method: u32) -> Instruction {
    Instruction::Call(CallInstruction {
        method: Some(MethodId(method)),
        arg_count: 0,
        return_type: None,
        is_constructor: false,
        anchor: Some(Anchor(100 + method)),
    })
}

fn null_guard(f: &mut ValueFactory) -> Option<ControlFlow> {
    let x = f.parameter("x", 0, Fact::unknown_ref());
    let null = f.null();
    Some(ControlFlow::new(vec![
        push(x),
        push(null),
        Instruction::BooleanBinary {
            op: BooleanOp::Relation(RelationType::Eq),
            anchor: Some(Anchor(1)),
        },
        Instruction::ConditionalGoto {
            target: 5,
            negated: true,
            anchor: Some(Anchor(2)),
        },
        Instruction::Return,
        push(x),
        dereference(3),
        void_call(1),
        Instruction::Pop,
        Instruction::Return,
    ]))
}

fn empty_array(f: &mut ValueFactory) -> Option<ControlFlow> {
    let int_array = Ty::array(Ty::primitive("int"));
    let a = f.local("a", Fact::typed(&int_array, Nullability::Unknown));
    let zero = f.int_value(0);
    let one = f.int_value(1);
    Some(ControlFlow::new(vec![
        push(a),
        push(zero),
        Instruction::NewArray { ty: int_array },
        Instruction::Assign {
            assigned: None,
            initializer: true,
            array: None,
            anchor: None,
        },
        Instruction::Pop,
        push(a),
        push(zero),
        Instruction::ArrayAccess {
            value: None,
            out_of_bounds: None,
            anchor: Some(Anchor(1)),
        },
        push(one),
        Instruction::Assign {
            assigned: None,
            initializer: false,
            array: Some(a),
            anchor: None,
        },
        Instruction::Pop,
        Instruction::Return,
    ]))
}

fn contract(f: &mut ValueFactory) -> Option<ControlFlow> {
    let p = f.parameter("p", 0, Fact::nullable());
    let unknown = f.unknown();
    Some(ControlFlow::new(vec![
        push(unknown),
        push(p),
        Instruction::Call(CallInstruction {
            method: Some(MethodId(1)),
            arg_count: 1,
            return_type: Some(Ty::primitive("boolean")),
            is_constructor: false,
            anchor: Some(Anchor(101)),
        }),
        Instruction::ConditionalGoto {
            target: 8,
            negated: true,
            anchor: Some(Anchor(1)),
        },
        push(p),
        dereference(2),
        void_call(2),
        Instruction::Pop,
        Instruction::Return,
    ]))
}

fn nullable(f: &mut ValueFactory) -> Option<ControlFlow> {
    let x = f.parameter("x", 0, Fact::nullable());
    Some(ControlFlow::new(vec![
        push(x),
        dereference(1),
        void_call(1),
        Instruction::Pop,
        push(x),
        dereference(2),
        void_call(2),
        Instruction::Pop,
        Instruction::Return,
    ]))
}

fn wide(branches: u32) -> impl Fn(&mut ValueFactory) -> Option<ControlFlow> {
    move |f: &mut ValueFactory| {
        let mut instructions = Vec::new();
        for i in 0..branches {
            let b = f.local(&format!("b{}", i), Fact::Bool(None));
            instructions.push(push(b));
            let target = instructions.len() + 1;
            instructions.push(Instruction::ConditionalGoto {
                target,
                negated: false,
                anchor: Some(Anchor(i)),
            });
        }
        instructions.push(Instruction::Return);
        Some(ControlFlow::new(instructions))
    }
}

fn check_metadata() -> StaticMetadata {
    let mut oracle = StaticMetadata::new();
    oracle.insert(
        MethodId(1),
        MethodInfo::pure().with_contracts(vec![
            Contract::new(vec![ContractCondition::arg_is_null(0)], ContractReturn::Value(Fact::bool(false))),
            Contract::new(vec![ContractCondition::arg_not_null(0)], ContractReturn::Value(Fact::bool(true))),
        ]),
    );
    oracle
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Cli::parse();
    let level = if args.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    simplelog::TermLogger::init(
        level,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;
    info!("args = {:?}", args);

    let mut runner = DataFlowRunner::new(RunnerConfig::default());
    if let Scenario::Contract = args.scenario {
        runner = runner.with_oracle(Box::new(check_metadata()));
    }

    let mut collector = ProblemCollector::new();
    let outcome = match args.scenario {
        Scenario::NullGuard => runner.analyze(&null_guard, &mut collector),
        Scenario::EmptyArray => runner.analyze(&empty_array, &mut collector),
        Scenario::Contract => runner.analyze(&contract, &mut collector),
        Scenario::Wide => runner.analyze(&wide(args.branches), &mut collector),
        Scenario::Nullable => runner.analyze(&nullable, &mut collector),
    };
    println!("outcome: {}", outcome);

    let diagnostics = Diagnostics::for_outcome(outcome, &collector);
    if diagnostics.problems.is_empty() {
        println!("no problems");
    }
    for (problem, severity) in &diagnostics.problems {
        println!("{:?}: {:?}", problem, severity);
    }

    let conditions = runner.const_conditions();
    for index in &conditions.always_true {
        println!("condition at {} is always true", index);
    }
    for index in &conditions.always_false {
        println!("condition at {} is always false", index);
    }

    if let (Some(path), Some(flow)) = (&args.dot, runner.flow()) {
        fs::write(path, flow.to_dot(&conditions)?)?;
        info!("DOT written to '{}'", path.display());
    }

    Ok(())
}
