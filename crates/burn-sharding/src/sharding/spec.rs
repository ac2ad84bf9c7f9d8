use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use thiserror::Error;

use super::{DeviceMesh, Placement};

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum DType {
    /// 64-bit floating point.
    F64,
    /// 32-bit floating point.
    F32,
    /// 16-bit floating point.
    F16,
    /// 16-bit brain floating point.
    BF16,
    /// 64-bit signed integer.
    I64,
    /// 32-bit signed integer.
    I32,
    /// 16-bit signed integer.
    I16,
    /// 8-bit signed integer.
    I8,
    /// 8-bit unsigned integer.
    U8,
    /// Boolean.
    Bool,
}

impl DType {
    /// Returns `true` for floating point element types.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F64 | DType::F32 | DType::F16 | DType::BF16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::F64 => "f64",
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I64 => "i64",
            DType::I32 => "i32",
            DType::I16 => "i16",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// Global tensor metadata: everything a fake tensor needs, and nothing it doesn't.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct TensorMeta {
    /// Global shape.
    pub shape: Vec<usize>,
    /// Strides in elements.
    pub strides: Vec<usize>,
    /// Element type.
    pub dtype: DType,
    /// Whether the tensor is tracked for gradient computation.
    pub requires_grad: bool,
}

impl TensorMeta {
    /// Metadata for a contiguous tensor that does not require gradients.
    pub fn new<S: Into<Vec<usize>>>(shape: S, dtype: DType) -> Self {
        let shape = shape.into();
        let strides = contiguous_strides(&shape);
        Self {
            shape,
            strides,
            dtype,
            requires_grad: false,
        }
    }

    /// Sets the gradient-tracking flag.
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    /// Number of tensor dimensions.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.shape)
    }
}

/// Row-major strides for `shape`.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = alloc::vec![1; shape.len()];
    for idx in (0..shape.len().saturating_sub(1)).rev() {
        strides[idx] = strides[idx + 1] * shape[idx + 1].max(1);
    }
    strides
}

/// Errors raised when a [`ShardingSpec`] would be inconsistent.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum SpecError {
    /// The number of placements must equal the mesh rank.
    #[error("expected {expected} placement(s), one per mesh dimension, but got {got}")]
    PlacementCountMismatch {
        /// Mesh rank.
        expected: usize,
        /// Number of placements provided.
        got: usize,
    },
    /// A shard placement names a tensor dimension the tensor does not have.
    #[error("placement {placement} is out of range for a tensor of rank {rank}")]
    InvalidShardDim {
        /// The offending placement.
        placement: Placement,
        /// Tensor rank.
        rank: usize,
    },
}

/// Describes how a tensor is distributed across a device mesh.
///
/// A spec pairs one [`Placement`] per mesh dimension with the global tensor metadata.
/// The metadata is either fully present or absent; a spec without metadata can still
/// be produced by a sharding rule, but cannot be used to build fake tensors.
///
/// Specs are immutable: the `with_*` methods return new values.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ShardingSpec {
    /// Mesh the tensor is distributed over.
    device_mesh: Arc<DeviceMesh>,
    /// Distribution pattern for each mesh dimension.
    placements: Vec<Placement>,
    /// Global tensor metadata.
    tensor_meta: Option<TensorMeta>,
}

impl ShardingSpec {
    /// Creates a spec without tensor metadata.
    pub fn new(device_mesh: Arc<DeviceMesh>, placements: Vec<Placement>) -> Result<Self, SpecError> {
        if placements.len() != device_mesh.ndim() {
            return Err(SpecError::PlacementCountMismatch {
                expected: device_mesh.ndim(),
                got: placements.len(),
            });
        }

        Ok(Self {
            device_mesh,
            placements,
            tensor_meta: None,
        })
    }

    /// Creates a spec that is replicated on every mesh dimension.
    pub fn replicated(device_mesh: Arc<DeviceMesh>) -> Self {
        let placements = alloc::vec![Placement::Replicate; device_mesh.ndim()];
        Self {
            device_mesh,
            placements,
            tensor_meta: None,
        }
    }

    /// Returns a copy of this spec carrying `tensor_meta`.
    pub fn with_tensor_meta(self, tensor_meta: TensorMeta) -> Result<Self, SpecError> {
        validate_shard_dims(&self.placements, &tensor_meta)?;
        Ok(Self {
            tensor_meta: Some(tensor_meta),
            ..self
        })
    }

    /// Returns a copy of this spec with other placements on the same mesh.
    pub fn with_placements(&self, placements: Vec<Placement>) -> Result<Self, SpecError> {
        let spec = Self::new(self.device_mesh.clone(), placements)?;
        match &self.tensor_meta {
            Some(meta) => spec.with_tensor_meta(meta.clone()),
            None => Ok(spec),
        }
    }

    /// Mesh the tensor is distributed over.
    pub fn device_mesh(&self) -> &Arc<DeviceMesh> {
        &self.device_mesh
    }

    /// One placement per mesh dimension.
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Global tensor metadata, if known.
    pub fn tensor_meta(&self) -> Option<&TensorMeta> {
        self.tensor_meta.as_ref()
    }

    /// Global shape, if known.
    pub fn shape(&self) -> Option<&[usize]> {
        self.tensor_meta.as_ref().map(|meta| meta.shape.as_slice())
    }

    /// Tensor rank, if known.
    pub fn rank(&self) -> Option<usize> {
        self.tensor_meta.as_ref().map(TensorMeta::rank)
    }

    /// Returns `true` if every placement is [`Placement::Replicate`].
    pub fn is_replicated(&self) -> bool {
        self.placements.iter().all(Placement::is_replicate)
    }

    /// Returns `true` if any placement is partial.
    pub fn has_partial(&self) -> bool {
        self.placements.iter().any(Placement::is_partial)
    }
}

impl fmt::Display for ShardingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Spec(")?;
        for (idx, placement) in self.placements.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{placement}")?;
        }
        if let Some(meta) = &self.tensor_meta {
            write!(f, " on {meta}")?;
        }
        f.write_str(")")
    }
}

fn validate_shard_dims(placements: &[Placement], tensor_meta: &TensorMeta) -> Result<(), SpecError> {
    let rank = tensor_meta.rank();
    for placement in placements {
        if let Placement::Shard(dim) = placement {
            if *dim >= rank {
                return Err(SpecError::InvalidShardDim {
                    placement: *placement,
                    rank,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sharding::{DeviceMeshBuilder, MeshDim};
    use alloc::string::ToString;
    use alloc::vec;

    fn mesh_2x2() -> Arc<DeviceMesh> {
        Arc::new(
            DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
                .with_dim(0, MeshDim::new("dp"))
                .with_dim(1, MeshDim::new("tp"))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[5]), vec![1]);
        assert!(contiguous_strides(&[]).is_empty());
    }

    #[test]
    fn test_spec_placement_count_must_match_mesh() {
        let spec = ShardingSpec::new(mesh_2x2(), vec![Placement::Shard(0)]);

        assert_eq!(
            spec,
            Err(SpecError::PlacementCountMismatch {
                expected: 2,
                got: 1
            })
        );
    }

    #[test]
    fn test_spec_shard_dim_must_exist() {
        let spec = ShardingSpec::new(mesh_2x2(), vec![Placement::Shard(2), Placement::Replicate])
            .unwrap()
            .with_tensor_meta(TensorMeta::new([8, 4], DType::F32));

        assert_eq!(
            spec,
            Err(SpecError::InvalidShardDim {
                placement: Placement::Shard(2),
                rank: 2
            })
        );
    }

    #[test]
    fn test_spec_with_placements_keeps_meta() {
        let spec = ShardingSpec::replicated(mesh_2x2())
            .with_tensor_meta(TensorMeta::new([8, 4], DType::F32))
            .unwrap();

        let resharded = spec
            .with_placements(vec![Placement::Shard(0), Placement::Shard(1)])
            .unwrap();

        assert_eq!(resharded.tensor_meta(), spec.tensor_meta());
        assert_eq!(resharded.to_string(), "Spec(S(0), S(1) on f32[8, 4])");
        assert!(spec.is_replicated());
        assert!(!resharded.is_replicated());
    }
}
