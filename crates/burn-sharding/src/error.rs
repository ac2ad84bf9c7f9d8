use alloc::string::String;
use thiserror::Error;

use crate::graph::{GraphError, NodeId};
use crate::rules::RuleError;
use crate::schema::{OpOverload, OpSchema};
use crate::sharding::SpecError;

/// Errors raised while propagating sharding through an operator.
///
/// Every variant is fatal: the only recoverable outcome of a rule, a redistribution
/// suggestion, is reported through [`OutputSharding`](crate::OutputSharding) instead.
#[derive(Error, Debug)]
pub enum PropagationError {
    /// No rule is registered for the operator.
    #[error("Operator {op} does not have a sharding rule registered.")]
    UnimplementedRule {
        /// The operator without a rule.
        op: OpOverload,
    },
    /// The rule itself failed.
    #[error("Sharding propagation failed on op {op}.\nInput schema: {schema}.\nError: {source}")]
    RuleFailed {
        /// The operator whose rule failed.
        op: OpOverload,
        /// The schema the rule was invoked with.
        schema: OpSchema,
        /// The error raised by the rule.
        #[source]
        source: RuleError,
    },
    /// The rule could not shard the inputs and proposed no alternative.
    #[error("Sharding propagation failed on op {op}.\nInput schema: {schema}.\nFailed reason: {reason}")]
    ShardingFailed {
        /// The operator that could not be sharded.
        op: OpOverload,
        /// The schema the rule was invoked with.
        schema: OpSchema,
        /// Reason reported by the rule.
        reason: String,
    },
    /// The trial graph contains a node the propagator cannot interpret.
    #[error("Unsupported node type {kind} for node {node} in the isolated graph")]
    UnsupportedNode {
        /// Name of the node.
        node: String,
        /// Kind of the node.
        kind: &'static str,
    },
    /// The schema and the trial graph disagree on the number of operands.
    #[error("Expected {expected} flattened operand(s), one per graph placeholder, but got {got}")]
    PlaceholderCountMismatch {
        /// Number of placeholders in the graph.
        expected: usize,
        /// Number of flattened operands in the schema.
        got: usize,
    },
    /// A node reads the sharding of a node that has none.
    #[error("Node {node} has no sharding attached")]
    MissingSharding {
        /// Id of the node without sharding.
        node: NodeId,
    },
    /// A rule produced an inconsistent spec.
    #[error(transparent)]
    InvalidSpec(#[from] SpecError),
    /// The trial graph could not be built.
    #[error("Failed to build the isolated graph: {0}")]
    Graph(#[from] GraphError),
}

impl PropagationError {
    /// Returns `true` for [`PropagationError::UnimplementedRule`].
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, PropagationError::UnimplementedRule { .. })
    }
}
