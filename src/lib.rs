//! # dfa-rs: path-sensitive data-flow analysis in Rust
//!
//! **`dfa-rs`** is an abstract-interpretation engine for intraprocedural
//! data-flow analysis. It runs over a method body lowered into a flat,
//! jump-based instruction sequence and tracks symbolic facts (nullability,
//! integer ranges, exact and instance-of types, locality, mutability, array
//! and string lengths) along every feasible path. It uses them to prove or
//! refute defect conditions without executing the program.
//!
//! ## How it works
//!
//! Paths are explored breadth-first and never merged. At every branch the
//! memory state is cloned and each copy is narrowed by the branch condition;
//! a copy whose condition is unsatisfiable is dropped. Termination comes from
//! deduplicating states at branching instructions, backed by hard complexity
//! bounds.
//!
//! ## Basic Usage
//!
//! ```rust
//! use dfa_rs::config::RunnerConfig;
//! use dfa_rs::fact::Fact;
//! use dfa_rs::instruction::{ControlFlow, Instruction, NullCheck};
//! use dfa_rs::observer::{Problem, ProblemCollector};
//! use dfa_rs::runner::{DataFlowRunner, Outcome};
//! use dfa_rs::types::Anchor;
//! use dfa_rs::value::ValueFactory;
//!
//! // x.foo() where x is a parameter known to be nullable
//! let builder = |f: &mut ValueFactory| {
//!     let x = f.parameter("x", 0, Fact::nullable());
//!     Some(ControlFlow::new(vec![
//!         Instruction::Push { value: x, anchor: None },
//!         Instruction::CheckNotNull { kind: NullCheck::Dereference, transfer: None, anchor: Some(Anchor(1)) },
//!         Instruction::Pop,
//!         Instruction::Return,
//!     ]))
//! };
//!
//! let mut runner = DataFlowRunner::new(RunnerConfig::default().with_deterministic(true));
//! let mut collector = ProblemCollector::new();
//! assert_eq!(runner.analyze(&builder, &mut collector), Outcome::Ok);
//! assert!(collector.severity(&Problem::NullDereference(Anchor(1))).is_some());
//! ```
//!
//! ## Core Components
//!
//! - **[`runner`]**: The worklist driver, [`DataFlowRunner`][crate::runner::DataFlowRunner].
//! - **[`visitor`]** and **[`call`]**: One transfer function per instruction kind.
//! - **[`state`]**: The per-path [`MemoryState`][crate::state::MemoryState] and condition application.
//! - **[`fact`]** and **[`value`]**: The fact lattice and the value arena.
//! - **[`observer`]**: The only diagnostics channel.
//! - **[`dot`]**: Visualizing flows using Graphviz.

pub mod bitset;
pub mod call;
pub mod condition;
pub mod config;
pub mod contract;
pub mod dot;
pub mod error;
pub mod fact;
pub mod instruction;
pub mod observer;
pub mod range;
pub mod relation;
pub mod runner;
pub mod state;
pub mod transfer;
pub mod types;
pub mod value;
pub mod visitor;
