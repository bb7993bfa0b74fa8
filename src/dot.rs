//! Flow to DOT (Graphviz) conversion.
//!
//! Renders a [`ControlFlow`] as a directed graph, one node per instruction,
//! annotated with the branch classification of a finished run.
//!
//! # DOT Format
//!
//! - **Instructions** are boxes labeled `index: instruction`
//! - **Branching instructions** are diamonds; always-true ones are filled
//!   green, always-false ones red
//! - **Edges**:
//!   - Solid lines are fallthrough edges
//!   - Dashed lines are jumps
//!   - Dotted lines are control transfers (the operand stack is discarded)
//! - The **exit** node collects every path leaving the flow
//!
//! # Examples
//!
//! ```
//! use dfa_rs::instruction::{ControlFlow, Instruction};
//! use dfa_rs::runner::ConstConditions;
//!
//! let flow = ControlFlow::new(vec![Instruction::Goto { target: 1 }, Instruction::Return]);
//! let dot = flow.to_dot(&ConstConditions::default()).unwrap();
//! // Write to file and render with: dot -Tpng output.dot -o output.png
//! assert!(dot.starts_with("digraph {"));
//! ```

use std::fmt::Write as _;

use crate::instruction::{ControlFlow, Instruction};
use crate::runner::ConstConditions;

/// Configuration options for DOT output generation.
///
/// ```
/// use dfa_rs::dot::DotConfig;
///
/// let config = DotConfig {
///     branch_shape: "hexagon",
///     ..DotConfig::default()
/// };
/// assert_eq!(config.node_shape, "box");
/// ```
#[derive(Debug, Clone)]
pub struct DotConfig {
    /// Shape for plain instructions (default: "box")
    pub node_shape: &'static str,
    /// Shape for branching instructions (default: "diamond")
    pub branch_shape: &'static str,
    /// Shape for the exit node (default: "doublecircle")
    pub exit_shape: &'static str,
    /// Style for fallthrough edges (default: "solid")
    pub fallthrough_style: &'static str,
    /// Style for jump edges (default: "dashed")
    pub jump_style: &'static str,
    /// Style for control-transfer edges (default: "dotted")
    pub transfer_style: &'static str,
    /// Fill color of always-true branches (default: "palegreen")
    pub always_true_color: &'static str,
    /// Fill color of always-false branches (default: "lightcoral")
    pub always_false_color: &'static str,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            node_shape: "box",
            branch_shape: "diamond",
            exit_shape: "doublecircle",
            fallthrough_style: "solid",
            jump_style: "dashed",
            transfer_style: "dotted",
            always_true_color: "palegreen",
            always_false_color: "lightcoral",
        }
    }
}

impl ControlFlow {
    /// Converts the flow to DOT format with the default configuration.
    pub fn to_dot(&self, conditions: &ConstConditions) -> Result<String, std::fmt::Error> {
        self.to_dot_with_config(conditions, &DotConfig::default())
    }

    pub fn to_dot_with_config(&self, conditions: &ConstConditions, config: &DotConfig) -> Result<String, std::fmt::Error> {
        let mut dot = String::new();
        writeln!(dot, "digraph {{")?;
        writeln!(dot, "node [shape={}];", config.node_shape)?;
        writeln!(dot, "exit [shape={}, label=\"exit\"];", config.exit_shape)?;

        for (index, instruction) in self.instructions().iter().enumerate() {
            let label = escape(&format!("{}: {}", index, instruction));
            if instruction.is_branching() {
                let fill = if conditions.always_true.contains(&index) {
                    Some(config.always_true_color)
                } else if conditions.always_false.contains(&index) {
                    Some(config.always_false_color)
                } else {
                    None
                };
                match fill {
                    Some(color) => writeln!(
                        dot,
                        "{} [shape={}, style=filled, fillcolor={}, label=\"{}\"];",
                        index, config.branch_shape, color, label
                    )?,
                    None => writeln!(dot, "{} [shape={}, label=\"{}\"];", index, config.branch_shape, label)?,
                }
            } else {
                writeln!(dot, "{} [label=\"{}\"];", index, label)?;
            }
        }

        for (index, instruction) in self.instructions().iter().enumerate() {
            for target in instruction.successors(index) {
                let style = if target == index + 1 && !matches!(instruction, Instruction::Goto { .. }) {
                    config.fallthrough_style
                } else {
                    config.jump_style
                };
                writeln!(dot, "{} -> {} [style={}];", index, self.node_name(target), style)?;
            }
            for target in instruction.transfer_targets() {
                writeln!(dot, "{} -> {} [style={}];", index, self.node_name(target), config.transfer_style)?;
            }
            let leaves = matches!(instruction, Instruction::Return)
                || matches!(instruction, Instruction::ControlTransfer(t) if t.targets().is_empty());
            if leaves {
                writeln!(dot, "{} -> exit [style={}];", index, config.transfer_style)?;
            }
        }

        writeln!(dot, "}}")?;
        Ok(dot)
    }

    fn node_name(&self, target: usize) -> String {
        if target >= self.len() {
            "exit".to_string()
        } else {
            target.to_string()
        }
    }
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use test_log::test;

    use super::*;
    use crate::types::Anchor;
    use crate::value::ValueFactory;

    fn branching_flow() -> ControlFlow {
        let mut f = ValueFactory::new();
        let t = f.bool_value(true);
        ControlFlow::new(vec![
            Instruction::Push { value: t, anchor: None },
            Instruction::ConditionalGoto {
                target: 3,
                negated: false,
                anchor: Some(Anchor(1)),
            },
            Instruction::Return,
            Instruction::Goto { target: 4 },
        ])
    }

    #[test]
    fn test_to_dot_basic() {
        let dot = branching_flow().to_dot(&ConstConditions::default()).unwrap();
        assert!(dot.starts_with("digraph {"));
        assert!(dot.ends_with("}\n"));
        assert!(dot.contains("1 -> 3 [style=dashed];"));
        assert!(dot.contains("1 -> 2 [style=solid];"));
        assert!(dot.contains("3 -> exit [style=dashed];"));
        assert!(dot.contains("2 -> exit [style=dotted];"));
    }

    #[test]
    fn test_to_dot_highlights_constant_branches() {
        let conditions = ConstConditions {
            always_true: BTreeSet::from([1]),
            always_false: BTreeSet::new(),
        };
        let dot = branching_flow().to_dot(&conditions).unwrap();
        assert!(dot.contains("fillcolor=palegreen"));
        assert!(!dot.contains("fillcolor=lightcoral"));
    }
}
