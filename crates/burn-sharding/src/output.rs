use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::schema::OpSchema;
use crate::sharding::ShardingSpec;

/// Sharding of an operator's result.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum OutputSpec {
    /// A single tensor result.
    Single(ShardingSpec),
    /// A tuple result; non-tensor elements have no spec.
    Tuple(Vec<Option<ShardingSpec>>),
}

impl OutputSpec {
    /// The spec of a single tensor result.
    pub fn single(&self) -> Option<&ShardingSpec> {
        match self {
            OutputSpec::Single(spec) => Some(spec),
            OutputSpec::Tuple(_) => None,
        }
    }

    /// The spec of the tuple element at `index`, if it is a tensor.
    pub fn get(&self, index: usize) -> Option<&ShardingSpec> {
        match self {
            OutputSpec::Single(spec) if index == 0 => Some(spec),
            OutputSpec::Single(_) => None,
            OutputSpec::Tuple(specs) => specs.get(index).and_then(Option::as_ref),
        }
    }
}

impl From<ShardingSpec> for OutputSpec {
    fn from(spec: ShardingSpec) -> Self {
        OutputSpec::Single(spec)
    }
}

impl fmt::Display for OutputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSpec::Single(spec) => write!(f, "{spec}"),
            OutputSpec::Tuple(specs) => {
                f.write_str("(")?;
                for (idx, spec) in specs.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    match spec {
                        Some(spec) => write!(f, "{spec}")?,
                        None => f.write_str("None")?,
                    }
                }
                f.write_str(")")
            }
        }
    }
}

/// Verdict of a sharding propagation.
///
/// A rule fills in one of three shapes:
/// - a resolved [`output_spec`](Self::output_spec);
/// - [`schema_suggestions`](Self::schema_suggestions): input schemas the rule would
///   accept, in preference order;
/// - a [`failed_reason`](Self::failed_reason).
///
/// A rule may also leave everything empty, which means sharding does not apply to the
/// result (for instance a scalar output). Results returned by a propagator always carry
/// suggestions; the first one is the input schema when no redistribution is required.
#[derive(Clone, Debug, Default, Hash, PartialEq, Eq)]
pub struct OutputSharding {
    /// Sharding of the result, if resolved.
    pub output_spec: Option<OutputSpec>,
    /// Alternative input schemas, in preference order.
    pub schema_suggestions: Option<Vec<OpSchema>>,
    /// Why the inputs could not be sharded.
    pub failed_reason: Option<String>,
}

impl OutputSharding {
    /// A result that resolves to `output_spec`.
    pub fn resolved<S: Into<OutputSpec>>(output_spec: S) -> Self {
        Self {
            output_spec: Some(output_spec.into()),
            ..Default::default()
        }
    }

    /// A result asking the caller to redistribute its inputs to one of `suggestions`.
    pub fn suggest(suggestions: Vec<OpSchema>) -> Self {
        Self {
            schema_suggestions: Some(suggestions),
            ..Default::default()
        }
    }

    /// A result that cannot be sharded.
    pub fn failed<R: Into<String>>(reason: R) -> Self {
        Self {
            failed_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// A result to which sharding does not apply.
    pub fn scalar() -> Self {
        Self::default()
    }

    /// Sets the suggestion list to the single schema `schema`.
    pub fn with_suggestion(mut self, schema: OpSchema) -> Self {
        self.schema_suggestions = Some(vec![schema]);
        self
    }

    /// The schema the caller should dispatch with: the first suggestion.
    pub fn redistribute_schema(&self) -> Option<&OpSchema> {
        self.schema_suggestions.as_ref().and_then(|schemas| schemas.first())
    }

    /// Returns `true` if the inputs described by `input` must be redistributed first.
    pub fn needs_redistribute(&self, input: &OpSchema) -> bool {
        self.redistribute_schema()
            .is_some_and(|suggested| suggested != input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Arg, ArgType, FunctionSchema, OpOverload};
    use crate::sharding::{DeviceMesh, MeshDim, Placement};
    use alloc::collections::BTreeMap;
    use alloc::string::ToString;
    use alloc::sync::Arc;

    fn spec(placement: Placement) -> ShardingSpec {
        let mesh = Arc::new(DeviceMesh::new_1d(vec![0, 1], MeshDim::new("tp")).unwrap());
        ShardingSpec::new(mesh, vec![placement]).unwrap()
    }

    fn neg(placement: Placement) -> OpSchema {
        let op = OpOverload::new(
            FunctionSchema::new("aten::neg", "")
                .arg("self", ArgType::Tensor)
                .returns(ArgType::Tensor),
        );
        OpSchema::new(op, vec![Arg::Tensor(spec(placement))], BTreeMap::new())
    }

    #[test]
    fn test_needs_redistribute() {
        let input = neg(Placement::partial());
        let same = OutputSharding::resolved(spec(Placement::Shard(0))).with_suggestion(input.clone());
        let other = OutputSharding::resolved(spec(Placement::Replicate))
            .with_suggestion(neg(Placement::Replicate));

        assert!(!same.needs_redistribute(&input));
        assert!(other.needs_redistribute(&input));
        assert!(!OutputSharding::scalar().needs_redistribute(&input));
    }

    #[test]
    fn test_output_spec_access() {
        let tuple = OutputSpec::Tuple(vec![Some(spec(Placement::Shard(0))), None]);

        assert_eq!(tuple.get(0), Some(&spec(Placement::Shard(0))));
        assert_eq!(tuple.get(1), None);
        assert_eq!(tuple.single(), None);
        assert_eq!(tuple.to_string(), "(Spec(S(0)), None)");
        assert_eq!(OutputSpec::from(spec(Placement::Replicate)).get(0), Some(&spec(Placement::Replicate)));
    }
}
