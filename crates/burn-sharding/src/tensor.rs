use crate::sharding::{ShardingSpec, TensorMeta};

/// A value distributed across a device mesh.
///
/// Implemented by the distributed tensor type of the embedding framework so that
/// [`ShardingPropagator::prepare_op_schema`](crate::ShardingPropagator::prepare_op_schema)
/// can unwrap its operands into specs.
pub trait DistributedTensor {
    /// How the value is distributed.
    fn sharding_spec(&self) -> &ShardingSpec;
}

impl DistributedTensor for ShardingSpec {
    fn sharding_spec(&self) -> &ShardingSpec {
        self
    }
}

/// The part of a distributed tensor held by one worker, with the spec of the global
/// tensor it belongs to.
///
/// `L` is the local tensor type of the embedding framework.
#[derive(Clone, Debug)]
pub struct ShardedTensor<L> {
    local_shard: L,
    sharding_spec: ShardingSpec,
}

impl<L> ShardedTensor<L> {
    /// Wraps a local shard with the spec of the global tensor it belongs to.
    pub fn new(local_shard: L, sharding_spec: ShardingSpec) -> Self {
        Self {
            local_shard,
            sharding_spec,
        }
    }

    /// The shard held by this worker.
    pub fn local_shard(&self) -> &L {
        &self.local_shard
    }

    /// Global tensor metadata, if known.
    pub fn global_meta(&self) -> Option<&TensorMeta> {
        self.sharding_spec.tensor_meta()
    }

    /// Returns the local shard, dropping the distribution metadata.
    pub fn into_local(self) -> L {
        self.local_shard
    }
}

impl<L> DistributedTensor for ShardedTensor<L> {
    fn sharding_spec(&self) -> &ShardingSpec {
        &self.sharding_spec
    }
}
