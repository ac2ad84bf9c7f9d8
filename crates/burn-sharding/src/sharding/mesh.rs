use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use hashbrown::HashSet;
use thiserror::Error;

/// A named axis of a [`DeviceMesh`], such as `"dp"` or `"tp"`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MeshDim {
    name: String,
}

impl MeshDim {
    /// Creates a mesh dimension called `name`.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// Name of the dimension.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for MeshDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Logical N-dimensional arrangement of the workers taking part in a computation.
///
/// Workers are identified by their global rank and laid out in row-major order with
/// respect to the mesh shape. Every mesh index carries a [`MeshDim`] name. Placements in
/// a [`ShardingSpec`](super::ShardingSpec) are given per mesh index, in the order of
/// [`DeviceMesh::dims`].
///
/// A mesh of shape `[2, 4]` named `["dp", "tp"]` describes 2-way data parallelism over
/// 4-way tensor parallelism.
///
/// Meshes are compared structurally: specs on meshes with the same ranks, shape and
/// names are equal and hash alike.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct DeviceMesh {
    devices: Vec<usize>,
    shape: Vec<usize>,
    dims: Vec<MeshDim>,
}

impl DeviceMesh {
    /// Creates a one-dimensional mesh over `devices`.
    pub fn new_1d(devices: Vec<usize>, dim: MeshDim) -> Result<Self, DeviceMeshError> {
        let size = devices.len();
        DeviceMeshBuilder::new(devices, [size]).with_dim(0, dim).build()
    }

    /// Number of mesh dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of workers along each mesh dimension.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Global ranks in row-major order.
    pub fn devices(&self) -> &[usize] {
        &self.devices
    }

    /// Dimension names by mesh index.
    pub fn dims(&self) -> &[MeshDim] {
        &self.dims
    }

    /// Mesh index of `dim`.
    pub fn dim_index(&self, dim: &MeshDim) -> Option<usize> {
        self.dims.iter().position(|candidate| candidate == dim)
    }
}

impl fmt::Display for DeviceMesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceMesh(")?;
        for (idx, (dim, size)) in self.dims.iter().zip(&self.shape).enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}={size}")?;
        }
        f.write_str(")")
    }
}

/// Errors raised when building a [`DeviceMesh`].
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DeviceMeshError {
    /// A dimension name was attached to an index outside the mesh shape.
    #[error("Mesh dimension {dim} is mapped to index {idx}, outside of mesh shape {shape:?}")]
    DimOutOfRange {
        /// Offending dimension.
        dim: MeshDim,
        /// Requested index.
        idx: usize,
        /// Shape of the mesh.
        shape: Vec<usize>,
    },
    /// Two dimension names were attached to the same index.
    #[error("Mesh index {idx} is mapped to both {first} and {second}")]
    IndexMappedTwice {
        /// Mesh index.
        idx: usize,
        /// Name mapped first.
        first: MeshDim,
        /// Name mapped second.
        second: MeshDim,
    },
    /// The same name was attached to two indices.
    #[error("Mesh dimension {0} is mapped more than once")]
    DuplicateDim(MeshDim),
    /// A mesh index has no name.
    #[error("Mesh index {0} has no dimension name")]
    UnmappedIndex(usize),
    /// A mesh dimension has no worker.
    #[error("Mesh shape {0:?} has an empty dimension")]
    EmptyDim(Vec<usize>),
    /// The number of workers does not fill the mesh shape.
    #[error("{devices} devices cannot be arranged in a mesh of shape {shape:?}")]
    DeviceCountMismatch {
        /// Number of workers given.
        devices: usize,
        /// Shape of the mesh.
        shape: Vec<usize>,
    },
    /// A worker appears twice.
    #[error("Device {0} appears more than once in the mesh")]
    DuplicateDevice(usize),
}

/// Builder of [`DeviceMesh`]es with named dimensions.
///
/// ```rust
/// use burn_sharding::sharding::{DeviceMeshBuilder, MeshDim};
///
/// let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
///     .with_dim(0, MeshDim::new("dp"))
///     .with_dim(1, MeshDim::new("tp"))
///     .build()
///     .unwrap();
/// assert_eq!(mesh.to_string(), "DeviceMesh(dp=2, tp=2)");
/// ```
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder {
    devices: Vec<usize>,
    shape: Vec<usize>,
    dims: Vec<(usize, MeshDim)>,
}

impl DeviceMeshBuilder {
    /// Starts a mesh of the given shape over `devices`, in row-major order.
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<usize>, shape: S) -> Self {
        Self {
            devices,
            shape: shape.into(),
            dims: Vec::new(),
        }
    }

    /// Names the mesh dimension at `idx`.
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.push((idx, dim));
        self
    }

    /// Validates the layout and builds the mesh.
    ///
    /// Every index of the shape needs exactly one name, names must be unique, and the
    /// devices must be distinct and fill the shape.
    pub fn build(self) -> Result<DeviceMesh, DeviceMeshError> {
        let mut slots: Vec<Option<MeshDim>> = vec![None; self.shape.len()];
        let mut names = HashSet::with_capacity(self.dims.len());

        for (idx, dim) in self.dims {
            if !names.insert(dim.clone()) {
                return Err(DeviceMeshError::DuplicateDim(dim));
            }
            let Some(slot) = slots.get_mut(idx) else {
                return Err(DeviceMeshError::DimOutOfRange {
                    dim,
                    idx,
                    shape: self.shape,
                });
            };
            if let Some(first) = slot.take() {
                return Err(DeviceMeshError::IndexMappedTwice {
                    idx,
                    first,
                    second: dim,
                });
            }
            *slot = Some(dim);
        }

        let mut dims = Vec::with_capacity(slots.len());
        for (idx, slot) in slots.into_iter().enumerate() {
            dims.push(slot.ok_or(DeviceMeshError::UnmappedIndex(idx))?);
        }

        if self.shape.contains(&0) {
            return Err(DeviceMeshError::EmptyDim(self.shape));
        }
        if self.devices.len() != self.shape.iter().product::<usize>() {
            return Err(DeviceMeshError::DeviceCountMismatch {
                devices: self.devices.len(),
                shape: self.shape,
            });
        }

        let mut seen = HashSet::with_capacity(self.devices.len());
        if let Some(device) = self.devices.iter().find(|device| !seen.insert(**device)) {
            return Err(DeviceMeshError::DuplicateDevice(*device));
        }

        Ok(DeviceMesh {
            devices: self.devices,
            shape: self.shape,
            dims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    fn build(devices: Vec<usize>, shape: [usize; 2], dims: &[(usize, &str)]) -> Result<DeviceMesh, DeviceMeshError> {
        dims.iter()
            .fold(DeviceMeshBuilder::new(devices, shape), |builder, (idx, name)| {
                builder.with_dim(*idx, MeshDim::new(*name))
            })
            .build()
    }

    #[test]
    fn test_device_mesh_orders_dims_by_index() {
        let mesh = build(vec![0, 1, 2, 3], [2, 2], &[(1, "tp"), (0, "dp")]).unwrap();

        assert_eq!(mesh.ndim(), 2);
        assert_eq!(mesh.dims(), &[MeshDim::new("dp"), MeshDim::new("tp")]);
        assert_eq!(mesh.dim_index(&MeshDim::new("tp")), Some(1));
        assert_eq!(mesh.to_string(), "DeviceMesh(dp=2, tp=2)");
    }

    #[test]
    fn test_device_mesh_1d() {
        let mesh = DeviceMesh::new_1d(vec![4, 5, 6], MeshDim::new("tp")).unwrap();

        assert_eq!(mesh.shape(), &[3]);
        assert_eq!(mesh.devices(), &[4, 5, 6]);
    }

    #[test]
    #[should_panic = "Mesh dimension tp is mapped to index 2, outside of mesh shape [2, 2]"]
    fn test_device_mesh_dim_should_be_in_range() {
        let err = build(vec![0, 1, 2, 3], [2, 2], &[(0, "dp"), (2, "tp")]).unwrap_err();
        panic!("{err}");
    }

    #[test]
    fn test_device_mesh_index_should_be_named_once() {
        let err = build(vec![0, 1, 2, 3], [2, 2], &[(0, "dp"), (0, "tp")]).unwrap_err();

        assert_eq!(
            err,
            DeviceMeshError::IndexMappedTwice {
                idx: 0,
                first: MeshDim::new("dp"),
                second: MeshDim::new("tp"),
            }
        );
    }

    #[test]
    fn test_device_mesh_dim_names_should_be_unique() {
        let err = build(vec![0, 1, 2, 3], [2, 2], &[(0, "dp"), (1, "dp")]).unwrap_err();

        assert_eq!(err, DeviceMeshError::DuplicateDim(MeshDim::new("dp")));
    }

    #[test]
    #[should_panic = "UnmappedIndex(1)"]
    fn test_device_mesh_dims_should_all_be_named() {
        build(vec![0, 1, 2, 3], [2, 2], &[(0, "dp")]).unwrap();
    }

    #[test]
    fn test_device_mesh_devices_should_fill_shape() {
        let err = build(vec![0, 1, 2, 3], [3, 2], &[(0, "dp"), (1, "tp")]).unwrap_err();

        assert_eq!(err.to_string(), "4 devices cannot be arranged in a mesh of shape [3, 2]");
    }

    #[test]
    fn test_device_mesh_devices_should_be_unique() {
        let err = build(vec![0, 1, 1, 3], [2, 2], &[(0, "dp"), (1, "tp")]).unwrap_err();

        assert_eq!(err, DeviceMeshError::DuplicateDevice(1));
    }

    #[test]
    fn test_device_mesh_rejects_empty_dim() {
        let err = build(vec![], [2, 0], &[(0, "dp"), (1, "tp")]).unwrap_err();

        assert_eq!(err, DeviceMeshError::EmptyDim(vec![2, 0]));
    }
}
