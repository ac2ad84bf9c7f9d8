use core::fmt;

/// Reduction that resolves a [partial](Placement::Partial) placement.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum across the mesh dimension.
    #[default]
    Sum,
    /// Element-wise mean across the mesh dimension.
    Avg,
    /// Element-wise maximum across the mesh dimension.
    Max,
    /// Element-wise minimum across the mesh dimension.
    Min,
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Avg => "avg",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
        };
        f.write_str(name)
    }
}

/// Specifies how a tensor is distributed along one device mesh dimension.
///
/// A [`ShardingSpec`](super::ShardingSpec) holds one placement per mesh dimension.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Placement {
    /// Every worker along the mesh dimension holds the full tensor.
    Replicate,
    /// The tensor is split along the given tensor dimension.
    Shard(usize),
    /// Every worker holds a partial value; the full tensor is the reduction of all of them.
    Partial(ReduceOp),
}

impl Placement {
    /// Partial placement pending a sum reduction.
    pub fn partial() -> Self {
        Placement::Partial(ReduceOp::Sum)
    }

    /// Returns `true` for [`Placement::Replicate`].
    pub fn is_replicate(&self) -> bool {
        matches!(self, Placement::Replicate)
    }

    /// Returns `true` if the placement shards tensor dimension `dim`.
    pub fn is_shard_on(&self, dim: usize) -> bool {
        matches!(self, Placement::Shard(d) if *d == dim)
    }

    /// Returns `true` for any [`Placement::Partial`].
    pub fn is_partial(&self) -> bool {
        matches!(self, Placement::Partial(_))
    }

    /// The sharded tensor dimension, if any.
    pub fn shard_dim(&self) -> Option<usize> {
        match self {
            Placement::Shard(dim) => Some(*dim),
            _ => None,
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Replicate => f.write_str("R"),
            Placement::Shard(dim) => write!(f, "S({dim})"),
            Placement::Partial(op) => write!(f, "P({op})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_placement_display() {
        assert_eq!(Placement::Replicate.to_string(), "R");
        assert_eq!(Placement::Shard(1).to_string(), "S(1)");
        assert_eq!(Placement::partial().to_string(), "P(sum)");
        assert_eq!(Placement::Partial(ReduceOp::Max).to_string(), "P(max)");
    }

    #[test]
    fn test_placement_predicates() {
        assert!(Placement::Shard(0).is_shard_on(0));
        assert!(!Placement::Shard(0).is_shard_on(1));
        assert!(!Placement::Replicate.is_shard_on(0));
        assert!(Placement::partial().is_partial());
        assert_eq!(Placement::Shard(2).shard_dim(), Some(2));
        assert_eq!(Placement::Replicate.shard_dim(), None);
    }
}
