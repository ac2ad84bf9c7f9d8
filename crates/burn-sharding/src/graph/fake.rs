use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use hashbrown::HashMap;

use super::{Graph, GraphError, NodeRef, ValueMeta};
use crate::schema::{Arg, OpOverload};
use crate::sharding::{DType, ShardingSpec, TensorMeta};

/// A tensor that only carries its metadata.
///
/// Fake tensors stand in for real operands while tracing an operator: they have a
/// shape, strides and an element type, but no storage.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct FakeTensor {
    meta: TensorMeta,
}

impl FakeTensor {
    /// Creates a fake tensor with explicit strides.
    pub fn empty_strided(shape: Vec<usize>, strides: Vec<usize>, dtype: DType, requires_grad: bool) -> Self {
        Self {
            meta: TensorMeta {
                shape,
                strides,
                dtype,
                requires_grad,
            },
        }
    }

    /// Creates the fake tensor described by the global metadata of `spec`.
    pub fn from_spec(spec: &ShardingSpec) -> Result<Self, GraphError> {
        let meta = spec.tensor_meta().ok_or_else(|| GraphError::MissingTensorMeta { spec: spec.clone() })?;
        Ok(Self::empty_strided(
            meta.shape.clone(),
            meta.strides.clone(),
            meta.dtype,
            meta.requires_grad,
        ))
    }

    /// Metadata of the tensor.
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }
}

/// A value flowing through a [`GraphTracer`]: the node producing it and its metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Traced {
    /// Producing node.
    pub node: NodeRef,
    /// Metadata of the value.
    pub meta: ValueMeta,
}

impl Traced {
    /// Tensor metadata of the value.
    pub fn tensor_meta(&self) -> Result<&TensorMeta, GraphError> {
        self.meta.tensor().ok_or(GraphError::NotATensor { node: self.node })
    }
}

/// Computes the metadata of an operator result from the metadata of its operands.
pub type MetaFn = Arc<
    dyn Fn(&OpOverload, &[Arg<TensorMeta>], &BTreeMap<String, Arg<TensorMeta>>) -> Result<ValueMeta, GraphError>
        + Send
        + Sync,
>;

/// Rewrites a call to an aggregate operator into calls to simpler operators.
pub type Decomposition = Arc<
    dyn Fn(&mut GraphTracer<'_>, &[Arg<Traced>], &BTreeMap<String, Arg<Traced>>) -> Result<Vec<Traced>, GraphError>
        + Send
        + Sync,
>;

/// Non-materializing execution mode.
///
/// Operators run on [`FakeTensor`]s through their meta function, which only computes
/// output metadata. Aggregate operators with a registered decomposition are expanded
/// into the operators they are made of; decompositions may call other decomposed
/// operators.
#[derive(Clone, Default)]
pub struct FakeTensorMode {
    meta_fns: HashMap<OpOverload, MetaFn>,
    decompositions: HashMap<OpOverload, Decomposition>,
}

impl FakeTensorMode {
    /// Creates a mode that knows no operator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the meta function of a primitive operator.
    pub fn register_meta<F>(&mut self, op: OpOverload, meta_fn: F)
    where
        F: Fn(&OpOverload, &[Arg<TensorMeta>], &BTreeMap<String, Arg<TensorMeta>>) -> Result<ValueMeta, GraphError>
            + Send
            + Sync
            + 'static,
    {
        self.meta_fns.insert(op, Arc::new(meta_fn));
    }

    /// Registers the decomposition of an aggregate operator.
    pub fn register_decomposition<F>(&mut self, op: OpOverload, decomposition: F)
    where
        F: Fn(&mut GraphTracer<'_>, &[Arg<Traced>], &BTreeMap<String, Arg<Traced>>) -> Result<Vec<Traced>, GraphError>
            + Send
            + Sync
            + 'static,
    {
        self.decompositions.insert(op, Arc::new(decomposition));
    }

    /// Returns `true` if `op` has a meta function.
    pub fn has_meta(&self, op: &OpOverload) -> bool {
        self.meta_fns.contains_key(op)
    }

    /// Returns `true` if `op` is decomposed.
    pub fn has_decomposition(&self, op: &OpOverload) -> bool {
        self.decompositions.contains_key(op)
    }

    /// Traces `op` on fake operands into an isolated graph.
    ///
    /// The graph has one placeholder per flattened argument leaf, positional arguments
    /// first, then keyword arguments in key order. Scalar leaves get a placeholder too but
    /// are passed to the operator as constants.
    pub fn build_isolated_graph(
        &self,
        op: &OpOverload,
        args: &[Arg<FakeTensor>],
        kwargs: &BTreeMap<String, Arg<FakeTensor>>,
    ) -> Result<Graph, GraphError> {
        let mut tracer = GraphTracer::new(self);

        let args = args
            .iter()
            .map(|arg| bind_placeholders(&mut tracer.graph, arg))
            .collect::<Vec<_>>();
        let kwargs = kwargs
            .iter()
            .map(|(name, arg)| (name.clone(), bind_placeholders(&mut tracer.graph, arg)))
            .collect::<BTreeMap<_, _>>();

        let outputs = tracer.call(op, &args, &kwargs)?;
        let mut graph = tracer.finish();
        graph.add_output(outputs.iter().map(|value| value.node).collect())?;

        log::trace!("Isolated graph for {op}:\n{graph}");
        Ok(graph)
    }
}

impl fmt::Debug for FakeTensorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeTensorMode")
            .field("meta_fns", &self.meta_fns.keys().collect::<Vec<_>>())
            .field("decompositions", &self.decompositions.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn bind_placeholders(graph: &mut Graph, arg: &Arg<FakeTensor>) -> Arg<Traced> {
    match arg {
        Arg::Tensor(fake) => {
            let meta = ValueMeta::Tensor(fake.meta().clone());
            let node = graph.add_placeholder(meta.clone());
            Arg::Tensor(Traced {
                node: NodeRef::new(node),
                meta,
            })
        }
        Arg::Scalar(scalar) => {
            graph.add_placeholder(ValueMeta::NonTensor);
            Arg::Scalar(scalar.clone())
        }
        Arg::List(items) => Arg::List(items.iter().map(|item| bind_placeholders(graph, item)).collect()),
        Arg::None => Arg::None,
    }
}

/// Records operator calls into a [`Graph`] while running them under a [`FakeTensorMode`].
pub struct GraphTracer<'m> {
    mode: &'m FakeTensorMode,
    graph: Graph,
}

impl<'m> GraphTracer<'m> {
    /// Creates a tracer recording into an empty graph.
    pub fn new(mode: &'m FakeTensorMode) -> Self {
        Self {
            mode,
            graph: Graph::new(),
        }
    }

    /// Graph recorded so far.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Calls `op`, expanding it if it has a decomposition.
    ///
    /// Returns one value per operator result: tuple results are split into their
    /// elements.
    pub fn call(
        &mut self,
        op: &OpOverload,
        args: &[Arg<Traced>],
        kwargs: &BTreeMap<String, Arg<Traced>>,
    ) -> Result<Vec<Traced>, GraphError> {
        let mode = self.mode;
        if let Some(decomposition) = mode.decompositions.get(op) {
            return decomposition(self, args, kwargs);
        }

        let meta_fn = mode
            .meta_fns
            .get(op)
            .ok_or_else(|| GraphError::MissingMetaFunction { op: op.clone() })?;

        let mut meta_args = Vec::with_capacity(args.len());
        for arg in args {
            meta_args.push(arg.try_map(&mut |value| value.tensor_meta().cloned())?);
        }
        let mut meta_kwargs = BTreeMap::new();
        for (name, arg) in kwargs {
            meta_kwargs.insert(name.clone(), arg.try_map(&mut |value| value.tensor_meta().cloned())?);
        }

        let meta = meta_fn(op, &meta_args, &meta_kwargs)?;

        let node_args = args.iter().map(|arg| arg.map(|value| value.node)).collect();
        let node_kwargs = kwargs
            .iter()
            .map(|(name, arg)| (name.clone(), arg.map(|value| value.node)))
            .collect();
        let node = self.graph.add_call(op.clone(), node_args, node_kwargs, meta.clone())?;

        Ok(match meta {
            ValueMeta::Tuple(items) => items
                .into_iter()
                .enumerate()
                .map(|(index, meta)| Traced {
                    node: NodeRef::item(node, index),
                    meta,
                })
                .collect(),
            meta => vec![Traced {
                node: NodeRef::new(node),
                meta,
            }],
        })
    }

    /// Calls an operator that produces exactly one value.
    pub fn call_one(
        &mut self,
        op: &OpOverload,
        args: &[Arg<Traced>],
        kwargs: &BTreeMap<String, Arg<Traced>>,
    ) -> Result<Traced, GraphError> {
        let mut values = self.call(op, args, kwargs)?;
        if values.len() != 1 {
            return Err(GraphError::UnexpectedOutputCount {
                op: op.clone(),
                expected: 1,
                got: values.len(),
            });
        }
        Ok(values.remove(0))
    }

    /// Returns the recorded graph.
    pub fn finish(self) -> Graph {
        self.graph
    }
}
