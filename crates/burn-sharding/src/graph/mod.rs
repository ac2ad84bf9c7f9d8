//! Isolated execution graphs built under fake mode.
//!
//! A [`Graph`] is an arena of [`Node`]s addressed by [`NodeId`]. Nodes are appended in
//! construction order, which is also a topological order: a node only references nodes
//! added before it.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;
use hashbrown::HashMap;
use thiserror::Error;

use crate::schema::{Arg, OpOverload};
use crate::sharding::{ShardingSpec, TensorMeta};

mod fake;

pub use fake::*;

/// Index of a node in its [`Graph`].
pub type NodeId = usize;

/// Reference to the value produced by a node, or to one element of a tuple result.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct NodeRef {
    /// Producing node.
    pub node: NodeId,
    /// Tuple element, for nodes producing several values.
    pub index: Option<usize>,
}

impl NodeRef {
    /// Reference to the whole value of `node`.
    pub fn new(node: NodeId) -> Self {
        Self { node, index: None }
    }

    /// Reference to element `index` of the tuple produced by `node`.
    pub fn item(node: NodeId, index: usize) -> Self {
        Self {
            node,
            index: Some(index),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "#{}[{index}]", self.node),
            None => write!(f, "#{}", self.node),
        }
    }
}

/// Shape-level description of the value a node produces.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum ValueMeta {
    /// A tensor.
    Tensor(TensorMeta),
    /// Several values.
    Tuple(Vec<ValueMeta>),
    /// Anything that is not a tensor.
    NonTensor,
}

impl ValueMeta {
    /// Tensor metadata, if the value is a tensor.
    pub fn tensor(&self) -> Option<&TensorMeta> {
        match self {
            ValueMeta::Tensor(meta) => Some(meta),
            _ => None,
        }
    }

    /// Element `index` of a tuple value.
    pub fn item(&self, index: usize) -> Option<&ValueMeta> {
        match self {
            ValueMeta::Tuple(items) => items.get(index),
            _ => None,
        }
    }

    /// The whole value when `index` is `None`, otherwise the tuple element.
    pub fn resolve(&self, index: Option<usize>) -> Option<&ValueMeta> {
        match index {
            Some(index) => self.item(index),
            None => Some(self),
        }
    }
}

impl fmt::Display for ValueMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueMeta::Tensor(meta) => write!(f, "{meta}"),
            ValueMeta::Tuple(items) => {
                f.write_str("(")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
            ValueMeta::NonTensor => f.write_str("_"),
        }
    }
}

/// What a node does.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// A graph input.
    Placeholder,
    /// A call to an operator.
    CallFunction {
        /// Operator being called.
        target: OpOverload,
        /// Positional arguments.
        args: Vec<Arg<NodeRef>>,
        /// Keyword arguments.
        kwargs: BTreeMap<String, Arg<NodeRef>>,
    },
    /// The graph results.
    Output {
        /// Values returned by the graph.
        args: Vec<NodeRef>,
    },
    /// A read of a module attribute.
    GetAttr {
        /// Attribute path.
        target: String,
    },
    /// A call to a submodule.
    CallModule {
        /// Submodule path.
        target: String,
    },
    /// A method call on a value.
    CallMethod {
        /// Method name.
        target: String,
    },
}

impl NodeKind {
    /// Short name of the node kind.
    pub fn op_name(&self) -> &'static str {
        match self {
            NodeKind::Placeholder => "placeholder",
            NodeKind::CallFunction { .. } => "call_function",
            NodeKind::Output { .. } => "output",
            NodeKind::GetAttr { .. } => "get_attr",
            NodeKind::CallModule { .. } => "call_module",
            NodeKind::CallMethod { .. } => "call_method",
        }
    }

    fn refs(&self) -> Vec<NodeRef> {
        let mut refs = Vec::new();
        match self {
            NodeKind::CallFunction { args, kwargs, .. } => {
                for arg in args.iter().chain(kwargs.values()) {
                    for leaf in arg.leaves() {
                        if let Arg::Tensor(node) = leaf {
                            refs.push(*node);
                        }
                    }
                }
            }
            NodeKind::Output { args } => refs.extend(args.iter().copied()),
            _ => {}
        }
        refs
    }
}

/// A node of an isolated graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    id: NodeId,
    name: String,
    kind: NodeKind,
    meta: ValueMeta,
}

impl Node {
    /// Position of the node in its graph.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Unique name of the node in its graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What the node does.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Value produced by the node.
    pub fn meta(&self) -> &ValueMeta {
        &self.meta
    }
}

/// Errors raised while building an isolated graph.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum GraphError {
    /// A fake tensor needs the global tensor metadata of its spec.
    #[error("Cannot create a fake tensor for {spec}: the spec has no tensor metadata")]
    MissingTensorMeta {
        /// The spec without metadata.
        spec: ShardingSpec,
    },
    /// The operator cannot run under fake mode.
    #[error("Operator {op} has neither a decomposition nor a meta function")]
    MissingMetaFunction {
        /// The operator.
        op: OpOverload,
    },
    /// The meta function of an operator rejected its operands.
    #[error("Invalid operands for {op}: {reason}")]
    InvalidOperands {
        /// The operator.
        op: OpOverload,
        /// Why the operands are invalid.
        reason: String,
    },
    /// A tensor operand refers to a value that is not a tensor.
    #[error("Value {node} is not a tensor")]
    NotATensor {
        /// The referenced value.
        node: NodeRef,
    },
    /// A node refers to a node that does not precede it.
    #[error("Unknown node #{node}")]
    UnknownNode {
        /// The referenced node.
        node: NodeId,
    },
    /// A node refers to a tuple element that does not exist.
    #[error("Node #{node} has no output {index}")]
    InvalidOutputIndex {
        /// The referenced node.
        node: NodeId,
        /// The missing element.
        index: usize,
    },
    /// A call produced an unexpected number of values.
    #[error("Operator {op} produced {got} value(s), expected {expected}")]
    UnexpectedOutputCount {
        /// The operator.
        op: OpOverload,
        /// Expected number of values.
        expected: usize,
        /// Number of values produced.
        got: usize,
    },
}

impl GraphError {
    /// Shorthand for [`GraphError::InvalidOperands`].
    pub fn invalid_operands<R: Into<String>>(op: &OpOverload, reason: R) -> Self {
        GraphError::InvalidOperands {
            op: op.clone(),
            reason: reason.into(),
        }
    }
}

/// An arena of nodes in topological order.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    name_counts: HashMap<String, usize>,
    placeholders: usize,
}

impl Graph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an input named `arg{n}`.
    pub fn add_placeholder(&mut self, meta: ValueMeta) -> NodeId {
        let name = format!("arg{}", self.placeholders);
        self.placeholders += 1;
        self.push(name, NodeKind::Placeholder, meta)
    }

    /// Appends a call to `target`.
    pub fn add_call(
        &mut self,
        target: OpOverload,
        args: Vec<Arg<NodeRef>>,
        kwargs: BTreeMap<String, Arg<NodeRef>>,
        meta: ValueMeta,
    ) -> Result<NodeId, GraphError> {
        self.add_node(NodeKind::CallFunction { target, args, kwargs }, meta)
    }

    /// Appends the output node returning `args`.
    pub fn add_output(&mut self, args: Vec<NodeRef>) -> Result<NodeId, GraphError> {
        self.add_node(NodeKind::Output { args }, ValueMeta::NonTensor)
    }

    /// Appends a node of any kind after checking that every reference it holds is valid.
    pub fn add_node(&mut self, kind: NodeKind, meta: ValueMeta) -> Result<NodeId, GraphError> {
        for node_ref in kind.refs() {
            self.check_ref(node_ref)?;
        }

        if matches!(kind, NodeKind::Placeholder) {
            return Ok(self.add_placeholder(meta));
        }

        let base = match &kind {
            NodeKind::CallFunction { target, .. } => {
                let name = target.schema().name();
                String::from(name.rsplit("::").next().unwrap_or(name))
            }
            NodeKind::GetAttr { target } | NodeKind::CallModule { target } | NodeKind::CallMethod { target } => {
                target.replace('.', "_")
            }
            other => String::from(other.op_name()),
        };
        let name = self.unique_name(base);
        Ok(self.push(name, kind, meta))
    }

    /// Nodes in construction order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The node with the given id.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if the graph has no node.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of placeholder nodes.
    pub fn placeholder_count(&self) -> usize {
        self.placeholders
    }

    /// Value referenced by `node_ref`.
    pub fn value(&self, node_ref: NodeRef) -> Result<&ValueMeta, GraphError> {
        let node = self.node(node_ref.node).ok_or(GraphError::UnknownNode {
            node: node_ref.node,
        })?;
        node.meta
            .resolve(node_ref.index)
            .ok_or(GraphError::InvalidOutputIndex {
                node: node_ref.node,
                index: node_ref.index.unwrap_or(0),
            })
    }

    fn check_ref(&self, node_ref: NodeRef) -> Result<(), GraphError> {
        self.value(node_ref).map(|_| ())
    }

    fn unique_name(&mut self, base: String) -> String {
        let count = self.name_counts.entry(base.clone()).or_insert(0);
        let name = match *count {
            0 => base,
            n => format!("{base}_{n}"),
        };
        *count += 1;
        name
    }

    fn push(&mut self, name: String, kind: NodeKind, meta: ValueMeta) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node { id, name, kind, meta });
        id
    }

    fn ref_name(&self, node_ref: &NodeRef) -> String {
        let name = self.nodes.get(node_ref.node).map(Node::name).unwrap_or("?");
        match node_ref.index {
            Some(index) => format!("%{name}[{index}]"),
            None => format!("%{name}"),
        }
    }

    fn fmt_arg(&self, f: &mut fmt::Formatter<'_>, arg: &Arg<NodeRef>) -> fmt::Result {
        match arg {
            Arg::Tensor(node_ref) => f.write_str(&self.ref_name(node_ref)),
            Arg::Scalar(scalar) => write!(f, "{scalar}"),
            Arg::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    self.fmt_arg(f, item)?;
                }
                f.write_str("]")
            }
            Arg::None => f.write_str("None"),
        }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph():")?;
        for node in &self.nodes {
            match &node.kind {
                NodeKind::Output { args } => {
                    f.write_str("    return (")?;
                    for node_ref in args {
                        write!(f, "{}, ", self.ref_name(node_ref))?;
                    }
                    writeln!(f, ")")?;
                }
                NodeKind::CallFunction { target, args, kwargs } => {
                    write!(f, "    %{} : {} = call_function[target={target}](", node.name, node.meta)?;
                    for (idx, arg) in args.iter().enumerate() {
                        if idx > 0 {
                            f.write_str(", ")?;
                        }
                        self.fmt_arg(f, arg)?;
                    }
                    for (name, arg) in kwargs {
                        write!(f, ", {name}=")?;
                        self.fmt_arg(f, arg)?;
                    }
                    writeln!(f, ")")?;
                }
                kind => writeln!(f, "    %{} : {} = {}", node.name, node.meta, kind.op_name())?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ArgType, FunctionSchema, Scalar};
    use crate::sharding::DType;
    use alloc::string::ToString;
    use alloc::vec;

    fn mul() -> OpOverload {
        OpOverload::new(
            FunctionSchema::new("aten::mul", "Scalar")
                .arg("self", ArgType::Tensor)
                .arg("other", ArgType::Scalar)
                .returns(ArgType::Tensor),
        )
    }

    fn tensor() -> ValueMeta {
        ValueMeta::Tensor(TensorMeta::new([2, 3], DType::F32))
    }

    #[test]
    fn test_graph_names_are_unique() {
        let mut graph = Graph::new();
        let x = graph.add_placeholder(tensor());
        let first = graph
            .add_call(mul(), vec![Arg::Tensor(NodeRef::new(x)), Arg::Scalar(Scalar::Float(2.0))], BTreeMap::new(), tensor())
            .unwrap();
        let second = graph
            .add_call(mul(), vec![Arg::Tensor(NodeRef::new(first)), Arg::Scalar(Scalar::Float(0.5))], BTreeMap::new(), tensor())
            .unwrap();
        graph.add_output(vec![NodeRef::new(second)]).unwrap();

        let names = graph.nodes().iter().map(Node::name).collect::<Vec<_>>();

        assert_eq!(names, vec!["arg0", "mul", "mul_1", "output"]);
        assert_eq!(graph.placeholder_count(), 1);
        assert_eq!(
            graph.to_string(),
            "graph():\n    %arg0 : f32[2, 3] = placeholder\n    \
             %mul : f32[2, 3] = call_function[target=aten::mul.Scalar](%arg0, 2.0)\n    \
             %mul_1 : f32[2, 3] = call_function[target=aten::mul.Scalar](%mul, 0.5)\n    \
             return (%mul_1, )\n"
        );
    }

    #[test]
    fn test_graph_rejects_forward_references() {
        let mut graph = Graph::new();
        graph.add_placeholder(tensor());

        let result = graph.add_call(mul(), vec![Arg::Tensor(NodeRef::new(3))], BTreeMap::new(), tensor());

        assert_eq!(result, Err(GraphError::UnknownNode { node: 3 }));
    }

    #[test]
    fn test_graph_tuple_refs_are_checked() {
        let mut graph = Graph::new();
        let x = graph.add_placeholder(ValueMeta::Tuple(vec![tensor(), ValueMeta::NonTensor]));

        assert!(graph.add_output(vec![NodeRef::item(x, 1)]).is_ok());
        assert_eq!(
            graph.add_output(vec![NodeRef::item(x, 2)]),
            Err(GraphError::InvalidOutputIndex { node: x, index: 2 })
        );
    }

    #[test]
    fn test_value_meta_resolve() {
        let meta = ValueMeta::Tuple(vec![tensor(), ValueMeta::NonTensor]);

        assert_eq!(meta.resolve(Some(0)), Some(&tensor()));
        assert_eq!(meta.resolve(Some(1)).and_then(ValueMeta::tensor), None);
        assert_eq!(meta.resolve(None), Some(&meta));
        assert_eq!(meta.to_string(), "(f32[2, 3], _)");
    }
}
