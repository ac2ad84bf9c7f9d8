use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::PropagationError;
use crate::graph::{FakeTensor, FakeTensorMode, Graph, Node, NodeId, NodeKind, NodeRef, ValueMeta};
use crate::output::{OutputSharding, OutputSpec};
use crate::rules::{RuleRegistry, ShardingRule};
use crate::schema::{Arg, OpOverload, OpSchema, flatten_args};
use crate::sharding::ShardingSpec;
use crate::tensor::DistributedTensor;

/// Propagates sharding through operator calls.
pub trait PropagateSharding {
    /// Computes the output sharding of `op` called with the operands described by
    /// `op_schema`.
    fn propagate(&mut self, op: &OpOverload, op_schema: &OpSchema) -> Result<OutputSharding, PropagationError>;
}

/// Sharding attached to the nodes of an isolated graph during propagation.
///
/// Indexed by [`NodeId`]. Specs produced by rules carry no tensor metadata; it is merged
/// in from the graph when a spec is read.
#[derive(Clone, Debug, Default)]
pub struct NodeShardings {
    specs: Vec<Option<OutputSpec>>,
}

impl NodeShardings {
    /// Creates an empty table for a graph of `len` nodes.
    pub fn new(len: usize) -> Self {
        Self {
            specs: vec![None; len],
        }
    }

    /// Sharding attached to `node`.
    pub fn get(&self, node: NodeId) -> Option<&OutputSpec> {
        self.specs.get(node).and_then(Option::as_ref)
    }

    fn set(&mut self, node: NodeId, spec: OutputSpec) {
        if node >= self.specs.len() {
            self.specs.resize(node + 1, None);
        }
        self.specs[node] = Some(spec);
    }

    /// Spec of the tensor referenced by `node_ref`, with the tensor metadata recorded in
    /// `graph`. `None` if the value is not a tensor or has no sharding.
    pub fn lookup(&self, graph: &Graph, node_ref: NodeRef) -> Result<Option<ShardingSpec>, PropagationError> {
        let Some(meta) = graph.value(node_ref)?.tensor() else {
            return Ok(None);
        };
        let spec = self
            .get(node_ref.node)
            .and_then(|spec| spec.get(node_ref.index.unwrap_or(0)));

        match spec {
            Some(spec) => Ok(Some(spec.clone().with_tensor_meta(meta.clone())?)),
            None => Ok(None),
        }
    }

    fn resolve(&self, graph: &Graph, node_ref: NodeRef) -> Result<ShardingSpec, PropagationError> {
        self.lookup(graph, node_ref)?
            .ok_or(PropagationError::MissingSharding { node: node_ref.node })
    }
}

/// Propagates sharding by tracing operators into an isolated graph and running the
/// registered rule of every operator in it.
///
/// Aggregate operators with a decomposition need no rule of their own: the operators
/// they decompose into are propagated one by one.
///
/// ```rust
/// use std::collections::BTreeMap;
/// use std::sync::Arc;
/// use burn_sharding::ops::{self, aten};
/// use burn_sharding::sharding::{DType, DeviceMesh, MeshDim, Placement, ShardingSpec, TensorMeta};
/// use burn_sharding::{Arg, OpSchema, ShardingPropagator};
///
/// let mesh = Arc::new(DeviceMesh::new_1d(vec![0, 1], MeshDim::new("tp")).unwrap());
/// let spec = ShardingSpec::new(mesh, vec![Placement::Shard(0)])
///     .unwrap()
///     .with_tensor_meta(TensorMeta::new([8, 4], DType::F32))
///     .unwrap();
///
/// let mut propagator = ShardingPropagator::new();
/// ops::install(&mut propagator);
///
/// let schema = OpSchema::new(aten::relu(), vec![Arg::Tensor(spec.clone())], BTreeMap::new());
/// let result = propagator.propagate(&aten::relu(), &schema).unwrap();
/// assert_eq!(result.output_spec.unwrap().single(), Some(&spec));
/// assert_eq!(result.schema_suggestions, Some(vec![schema]));
/// ```
#[derive(Clone, Debug, Default)]
pub struct ShardingPropagator {
    rules: RuleRegistry,
    fake_mode: FakeTensorMode,
}

impl ShardingPropagator {
    /// Creates a propagator without rules nor fake-mode operators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a propagator using an existing rule table.
    pub fn with_rules(rules: RuleRegistry) -> Self {
        Self {
            rules,
            fake_mode: FakeTensorMode::new(),
        }
    }

    /// Registers the sharding rule of an operator, replacing any previous one.
    pub fn register_sharding_prop_rule<R: ShardingRule + 'static>(&mut self, op: OpOverload, rule: R) {
        self.rules.register(op, rule);
    }

    /// Registered rules.
    pub fn rules(&self) -> &RuleRegistry {
        &self.rules
    }

    /// Fake mode used to build isolated graphs.
    pub fn fake_mode(&self) -> &FakeTensorMode {
        &self.fake_mode
    }

    /// Mutable access to the fake mode, to register meta functions and decompositions.
    pub fn fake_mode_mut(&mut self) -> &mut FakeTensorMode {
        &mut self.fake_mode
    }

    /// Replaces the distributed tensors of an operator call by their specs.
    pub fn prepare_op_schema<T: DistributedTensor>(
        &self,
        op: &OpOverload,
        args: &[Arg<T>],
        kwargs: &BTreeMap<String, Arg<T>>,
    ) -> OpSchema {
        let args_schema = args
            .iter()
            .map(|arg| arg.map(|tensor| tensor.sharding_spec().clone()))
            .collect();
        let kwargs_schema = kwargs
            .iter()
            .map(|(name, arg)| (name.clone(), arg.map(|tensor| tensor.sharding_spec().clone())))
            .collect();

        OpSchema::new(op.clone(), args_schema, kwargs_schema)
    }

    /// Computes the output sharding of `op` called with the operands described by
    /// `op_schema`.
    ///
    /// Fails without building any graph when `op` has neither a rule nor a decomposition.
    pub fn propagate(&self, op: &OpOverload, op_schema: &OpSchema) -> Result<OutputSharding, PropagationError> {
        log::debug!("Propagating sharding for {op_schema}");

        if !self.rules.contains(op) && !self.fake_mode.has_decomposition(op) {
            return Err(PropagationError::UnimplementedRule { op: op.clone() });
        }

        let mut fake_args = Vec::with_capacity(op_schema.args_schema().len());
        for arg in op_schema.args_schema() {
            fake_args.push(arg.try_map(&mut FakeTensor::from_spec)?);
        }
        let mut fake_kwargs = BTreeMap::new();
        for (name, arg) in op_schema.kwargs_schema() {
            fake_kwargs.insert(name.clone(), arg.try_map(&mut FakeTensor::from_spec)?);
        }

        let graph = self.fake_mode.build_isolated_graph(op, &fake_args, &fake_kwargs)?;
        let flat_args_sharding = op_schema.flat_args_sharding();

        self.run_graph_prop(&graph, op_schema, &flat_args_sharding)
    }

    /// Propagates sharding through every node of `graph`.
    ///
    /// `flat_args_sharding` holds one entry per placeholder of the graph, in order; tensor
    /// entries are attached to their placeholder.
    pub fn run_graph_prop(
        &self,
        graph: &Graph,
        op_schema: &OpSchema,
        flat_args_sharding: &[&Arg<ShardingSpec>],
    ) -> Result<OutputSharding, PropagationError> {
        if graph.placeholder_count() != flat_args_sharding.len() {
            return Err(PropagationError::PlaceholderCountMismatch {
                expected: graph.placeholder_count(),
                got: flat_args_sharding.len(),
            });
        }

        let mut shardings = NodeShardings::new(graph.len());
        let mut positions = vec![None; graph.len()];
        let mut placeholder_idx = 0;
        let mut redistributions = Vec::new();
        let mut output_spec = None;

        for node in graph.nodes() {
            match node.kind() {
                NodeKind::Placeholder => {
                    if let Arg::Tensor(spec) = flat_args_sharding[placeholder_idx] {
                        log::trace!("Attaching {spec} to placeholder {}", node.name());
                        shardings.set(node.id(), OutputSpec::Single(spec.clone()));
                    }
                    positions[node.id()] = Some(placeholder_idx);
                    placeholder_idx += 1;
                }
                NodeKind::CallFunction { .. } => {
                    let (node_schema, output_sharding) = self.propagate_node(graph, node, &mut shardings)?;
                    if output_sharding.needs_redistribute(&node_schema) {
                        redistributions.push((node, node_schema, output_sharding));
                    }
                }
                NodeKind::Output { args } => {
                    output_spec = self.collect_output(graph, args, &shardings)?;
                }
                kind => {
                    return Err(PropagationError::UnsupportedNode {
                        node: node.name().into(),
                        kind: kind.op_name(),
                    });
                }
            }
        }

        let schema_suggestions = input_suggestions(op_schema, &positions, &redistributions);

        Ok(OutputSharding {
            output_spec,
            schema_suggestions,
            failed_reason: None,
        })
    }

    /// Runs the rule of one call node and attaches the resolved sharding to it.
    ///
    /// When the rule only suggests other input schemas, the first suggestion is
    /// propagated again to resolve the output; the suggestions are kept on the result so
    /// the caller knows its inputs must be redistributed.
    pub fn run_op_prop(
        &self,
        graph: &Graph,
        node: &Node,
        shardings: &mut NodeShardings,
    ) -> Result<OutputSharding, PropagationError> {
        self.propagate_node(graph, node, shardings)
            .map(|(_, output_sharding)| output_sharding)
    }

    fn propagate_node(
        &self,
        graph: &Graph,
        node: &Node,
        shardings: &mut NodeShardings,
    ) -> Result<(OpSchema, OutputSharding), PropagationError> {
        let NodeKind::CallFunction { target, args, kwargs } = node.kind() else {
            return Err(PropagationError::UnsupportedNode {
                node: node.name().into(),
                kind: node.kind().op_name(),
            });
        };

        let rule = self
            .rules
            .get(target)
            .ok_or_else(|| PropagationError::UnimplementedRule { op: target.clone() })?;

        let mut args_schema = Vec::with_capacity(args.len());
        for arg in args {
            args_schema.push(arg.try_map(&mut |node_ref| shardings.resolve(graph, *node_ref))?);
        }
        let mut kwargs_schema = BTreeMap::new();
        for (name, arg) in kwargs {
            kwargs_schema.insert(
                name.clone(),
                arg.try_map(&mut |node_ref| shardings.resolve(graph, *node_ref))?,
            );
        }
        let op_schema = OpSchema::new(target.clone(), args_schema, kwargs_schema);

        let mut output_sharding = invoke_rule(rule.as_ref(), target, &op_schema)?;

        if output_sharding.output_spec.is_some() {
            output_sharding.schema_suggestions = Some(vec![op_schema.clone()]);
        } else if let Some(suggestions) = &output_sharding.schema_suggestions {
            let Some(suggested) = suggestions.first() else {
                return Err(PropagationError::ShardingFailed {
                    op: target.clone(),
                    schema: op_schema,
                    reason: "the rule returned an empty list of suggestions".into(),
                });
            };
            log::debug!("{target} needs its inputs redistributed to {suggested}");

            let retried = invoke_rule(rule.as_ref(), target, suggested)?;
            match (retried.output_spec, retried.failed_reason) {
                (Some(spec), _) => output_sharding.output_spec = Some(spec),
                (None, None) if retried.schema_suggestions.is_none() && *node.meta() == ValueMeta::NonTensor => {}
                (None, reason) => {
                    return Err(PropagationError::ShardingFailed {
                        op: target.clone(),
                        schema: suggested.clone(),
                        reason: reason.unwrap_or_else(|| "the suggested schema did not resolve either".into()),
                    });
                }
            }
        } else if let Some(reason) = output_sharding.failed_reason.take() {
            return Err(PropagationError::ShardingFailed {
                op: target.clone(),
                schema: op_schema,
                reason,
            });
        } else {
            output_sharding.schema_suggestions = Some(vec![op_schema.clone()]);
        }

        if let Some(spec) = &output_sharding.output_spec {
            shardings.set(node.id(), spec.clone());
        }

        Ok((op_schema, output_sharding))
    }

    fn collect_output(
        &self,
        graph: &Graph,
        args: &[NodeRef],
        shardings: &NodeShardings,
    ) -> Result<Option<OutputSpec>, PropagationError> {
        let mut specs = Vec::with_capacity(args.len());
        for node_ref in args {
            specs.push(shardings.lookup(graph, *node_ref)?);
        }

        if specs.iter().all(Option::is_none) {
            return Ok(None);
        }
        if specs.len() == 1 {
            return Ok(specs.pop().flatten().map(OutputSpec::Single));
        }
        Ok(Some(OutputSpec::Tuple(specs)))
    }
}

impl PropagateSharding for ShardingPropagator {
    fn propagate(&mut self, op: &OpOverload, op_schema: &OpSchema) -> Result<OutputSharding, PropagationError> {
        ShardingPropagator::propagate(self, op, op_schema)
    }
}

/// Input suggestions of a graph from the call nodes that needed redistribution.
///
/// Redistributed operands that are graph inputs are mapped back onto `op_schema`. When a
/// node asks to redistribute an intermediate value, or two nodes disagree on an input,
/// the suggestions of the first such node are returned unchanged.
fn input_suggestions(
    op_schema: &OpSchema,
    positions: &[Option<usize>],
    redistributions: &[(&Node, OpSchema, OutputSharding)],
) -> Option<Vec<OpSchema>> {
    let Some((_, first_schema, first_sharding)) = redistributions.first() else {
        return Some(vec![op_schema.clone()]);
    };
    if redistributions.len() == 1 && first_schema == op_schema {
        return first_sharding.schema_suggestions.clone();
    }

    let mut replacements = BTreeMap::new();
    for (node, node_schema, output_sharding) in redistributions {
        let Some(changes) = redistributed_inputs(node, node_schema, output_sharding, positions) else {
            return first_sharding.schema_suggestions.clone();
        };
        for (position, spec) in changes {
            match replacements.get(&position) {
                Some(existing) if existing != spec => return first_sharding.schema_suggestions.clone(),
                Some(_) => {}
                None => {
                    replacements.insert(position, spec.clone());
                }
            }
        }
    }

    Some(vec![op_schema.with_flat_args(&replacements)])
}

/// Graph input positions a node redistributed, with their new spec. `None` if the node
/// changed anything other than a graph input tensor.
fn redistributed_inputs<'a>(
    node: &Node,
    node_schema: &OpSchema,
    output_sharding: &'a OutputSharding,
    positions: &[Option<usize>],
) -> Option<Vec<(usize, &'a ShardingSpec)>> {
    let NodeKind::CallFunction { args, kwargs, .. } = node.kind() else {
        return None;
    };
    let refs = flatten_args(args, kwargs);
    let current = node_schema.flat_args_sharding();
    let suggested = output_sharding.redistribute_schema()?.flat_args_sharding();
    if refs.len() != current.len() || refs.len() != suggested.len() {
        return None;
    }

    let mut changes = Vec::new();
    for ((node_ref, current), suggested) in refs.into_iter().zip(current).zip(suggested) {
        if current == suggested {
            continue;
        }
        let (Arg::Tensor(node_ref), Arg::Tensor(spec)) = (node_ref, suggested) else {
            return None;
        };
        if node_ref.index.is_some() {
            return None;
        }
        changes.push((positions.get(node_ref.node).copied().flatten()?, spec));
    }
    Some(changes)
}

fn invoke_rule(
    rule: &dyn ShardingRule,
    op: &OpOverload,
    schema: &OpSchema,
) -> Result<OutputSharding, PropagationError> {
    rule.propagate(schema).map_err(|source| PropagationError::RuleFailed {
        op: op.clone(),
        schema: schema.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ValueMeta;
    use crate::ops::{self, aten};
    use crate::rules::{RuleError, rule_fn};
    use crate::sharding::{DType, DeviceMesh, MeshDim, Placement, TensorMeta};
    use alloc::string::ToString;
    use alloc::sync::Arc;
    use pretty_assertions::assert_eq;

    fn spec(placement: Placement) -> ShardingSpec {
        let mesh = Arc::new(DeviceMesh::new_1d(vec![0, 1], MeshDim::new("tp")).unwrap());
        ShardingSpec::new(mesh, vec![placement])
            .unwrap()
            .with_tensor_meta(TensorMeta::new([8, 4], DType::F32))
            .unwrap()
    }

    fn propagator() -> ShardingPropagator {
        let mut propagator = ShardingPropagator::new();
        ops::install(&mut propagator);
        propagator
    }

    fn relu(placement: Placement) -> OpSchema {
        OpSchema::new(aten::relu(), vec![Arg::Tensor(spec(placement))], BTreeMap::new())
    }

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_rule_errors_are_wrapped() {
        let mut propagator = propagator();
        propagator.register_sharding_prop_rule(
            aten::relu(),
            rule_fn(|_| Err::<OutputSharding, RuleError>(Boom.into())),
        );

        let err = propagator.propagate(&aten::relu(), &relu(Placement::Shard(0))).unwrap_err();

        assert!(matches!(err, PropagationError::RuleFailed { .. }));
        assert_eq!(
            err.to_string(),
            "Sharding propagation failed on op aten::relu.\n\
             Input schema: OpSchema(op=aten::relu, args=(Spec(S(0) on f32[8, 4])), kwargs={}).\n\
             Error: boom"
        );
        assert!(core::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_failed_reason_is_fatal() {
        let mut propagator = propagator();
        propagator.register_sharding_prop_rule(aten::relu(), rule_fn(|_| Ok(OutputSharding::failed("nope"))));

        let err = propagator.propagate(&aten::relu(), &relu(Placement::Shard(0))).unwrap_err();

        match err {
            PropagationError::ShardingFailed { op, reason, .. } => {
                assert_eq!(op, aten::relu());
                assert_eq!(reason, "nope");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_empty_suggestions_are_fatal() {
        let mut propagator = propagator();
        propagator.register_sharding_prop_rule(aten::relu(), rule_fn(|_| Ok(OutputSharding::suggest(vec![]))));

        let err = propagator.propagate(&aten::relu(), &relu(Placement::Shard(0))).unwrap_err();

        assert!(matches!(err, PropagationError::ShardingFailed { .. }));
    }

    #[test]
    fn test_retry_failure_is_fatal() {
        let suggested = relu(Placement::Replicate);
        let mut propagator = propagator();
        propagator.register_sharding_prop_rule(
            aten::relu(),
            rule_fn(move |schema| {
                if schema == &suggested {
                    Ok(OutputSharding::failed("still not supported"))
                } else {
                    Ok(OutputSharding::suggest(vec![suggested.clone()]))
                }
            }),
        );

        let err = propagator.propagate(&aten::relu(), &relu(Placement::Shard(0))).unwrap_err();

        match err {
            PropagationError::ShardingFailed { schema, reason, .. } => {
                assert_eq!(schema, relu(Placement::Replicate));
                assert_eq!(reason, "still not supported");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unresolved_retry_is_fatal() {
        let suggested = relu(Placement::Replicate);
        let mut propagator = propagator();
        propagator.register_sharding_prop_rule(
            aten::relu(),
            rule_fn(move |schema| {
                let next = if schema == &suggested {
                    relu(Placement::Shard(1))
                } else {
                    suggested.clone()
                };
                Ok(OutputSharding::suggest(vec![next]))
            }),
        );

        let err = propagator.propagate(&aten::relu(), &relu(Placement::Shard(0))).unwrap_err();

        match err {
            PropagationError::ShardingFailed { schema, reason, .. } => {
                assert_eq!(schema, relu(Placement::Replicate));
                assert_eq!(reason, "the suggested schema did not resolve either");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_node_kind() {
        let propagator = propagator();
        let mut graph = Graph::new();
        graph.add_placeholder(ValueMeta::Tensor(TensorMeta::new([8, 4], DType::F32)));
        graph
            .add_node(NodeKind::GetAttr { target: "weight".into() }, ValueMeta::NonTensor)
            .unwrap();
        let schema = relu(Placement::Shard(0));

        let err = propagator
            .run_graph_prop(&graph, &schema, &schema.flat_args_sharding())
            .unwrap_err();

        assert_eq!(err.to_string(), "Unsupported node type get_attr for node weight in the isolated graph");
    }

    #[test]
    fn test_missing_meta_is_a_graph_error() {
        let mesh = Arc::new(DeviceMesh::new_1d(vec![0, 1], MeshDim::new("tp")).unwrap());
        let bare = ShardingSpec::new(mesh, vec![Placement::Shard(0)]).unwrap();
        let schema = OpSchema::new(aten::relu(), vec![Arg::Tensor(bare)], BTreeMap::new());

        let err = propagator().propagate(&aten::relu(), &schema).unwrap_err();

        assert!(matches!(err, PropagationError::Graph(_)));
    }

    #[test]
    fn test_run_op_prop_attaches_sharding() {
        let propagator = propagator();
        let mut graph = Graph::new();
        let x = graph.add_placeholder(ValueMeta::Tensor(TensorMeta::new([8, 4], DType::F32)));
        let y = graph
            .add_call(
                aten::relu(),
                vec![Arg::Tensor(NodeRef::new(x))],
                BTreeMap::new(),
                ValueMeta::Tensor(TensorMeta::new([8, 4], DType::F32)),
            )
            .unwrap();
        let mut shardings = NodeShardings::new(graph.len());
        shardings.set(x, OutputSpec::Single(spec(Placement::Shard(0))));

        let result = propagator
            .run_op_prop(&graph, graph.node(y).unwrap(), &mut shardings)
            .unwrap();

        assert_eq!(result.schema_suggestions, Some(vec![relu(Placement::Shard(0))]));
        assert_eq!(
            shardings.lookup(&graph, NodeRef::new(y)).unwrap(),
            Some(spec(Placement::Shard(0)))
        );
    }
}
