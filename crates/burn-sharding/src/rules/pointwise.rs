use alloc::format;
use alloc::vec::Vec;

use super::RuleError;
use crate::output::OutputSharding;
use crate::schema::{Arg, OpSchema};
use crate::sharding::{Placement, ReduceOp, ShardingSpec, TensorMeta};

/// Sharding rule for element-wise operators.
///
/// The output follows the operand of highest rank (the first one on ties). Operands
/// whose placements disagree with it receive a suggestion that re-shards them to match;
/// broadcast dimensions are replicated. Partial placements are never propagated, use
/// [`linear_pointwise_rule`] for operators that distribute over a reduction.
pub fn pointwise_rule(schema: &OpSchema) -> Result<OutputSharding, RuleError> {
    propagate_pointwise(schema, false)
}

/// Sharding rule for element-wise operators that are linear in their tensor operands,
/// such as addition or multiplication by a scalar.
///
/// Behaves like [`pointwise_rule`], except that a sum or average partial placement
/// shared by every operand is kept on the output. `max` and `min` partials do not
/// commute with addition or negative scaling and are replicated.
pub fn linear_pointwise_rule(schema: &OpSchema) -> Result<OutputSharding, RuleError> {
    propagate_pointwise(schema, true)
}

fn propagate_pointwise(schema: &OpSchema, linear: bool) -> Result<OutputSharding, RuleError> {
    let operands = schema.arg_specs().collect::<Vec<_>>();
    let Some((_, first)) = operands.first() else {
        return Ok(OutputSharding::failed(format!(
            "{} has no tensor operand to follow",
            schema.op()
        )));
    };

    let mesh = first.device_mesh();
    if operands.iter().any(|(_, spec)| spec.device_mesh() != mesh) {
        return Ok(OutputSharding::failed(format!(
            "operands of {} are not on the same device mesh",
            schema.op()
        )));
    }

    let mut metas = Vec::with_capacity(operands.len());
    for (idx, spec) in &operands {
        metas.push(tensor_meta(schema, *idx, spec)?);
    }

    let out_shape = broadcast_shape(&metas);
    let reference = reference_operand(&metas);
    let out_placements = operands[reference]
        .1
        .placements()
        .iter()
        .enumerate()
        .map(|(mesh_dim, placement)| match placement {
            Placement::Partial(op) => {
                let shared = operands
                    .iter()
                    .all(|(_, spec)| spec.placements()[mesh_dim] == Placement::Partial(*op));
                if linear && shared && matches!(op, ReduceOp::Sum | ReduceOp::Avg) {
                    *placement
                } else {
                    Placement::Replicate
                }
            }
            _ => *placement,
        })
        .collect::<Vec<_>>();

    let mut args = schema.args_schema().to_vec();
    let mut needs_redistribute = false;
    for ((idx, spec), meta) in operands.iter().zip(&metas) {
        let expected = expected_placements(&out_placements, &out_shape, meta);
        if spec.placements() != expected.as_slice() {
            needs_redistribute = true;
            args[*idx] = Arg::Tensor(spec.with_placements(expected)?);
        }
    }

    if needs_redistribute {
        return Ok(OutputSharding::suggest(alloc::vec![schema.with_args(args)]));
    }

    Ok(OutputSharding::resolved(ShardingSpec::new(
        mesh.clone(),
        out_placements,
    )?))
}

pub(crate) fn tensor_meta<'a>(
    schema: &OpSchema,
    idx: usize,
    spec: &'a ShardingSpec,
) -> Result<&'a TensorMeta, RuleError> {
    spec.tensor_meta().ok_or_else(|| {
        format!(
            "operand {idx} of {} has no tensor metadata: {spec}",
            schema.op()
        )
        .into()
    })
}

fn reference_operand(metas: &[&TensorMeta]) -> usize {
    let mut reference = 0;
    for (idx, meta) in metas.iter().enumerate() {
        if meta.rank() > metas[reference].rank() {
            reference = idx;
        }
    }
    reference
}

fn broadcast_shape(metas: &[&TensorMeta]) -> Vec<usize> {
    let rank = metas.iter().map(|meta| meta.rank()).max().unwrap_or(0);
    let mut shape = alloc::vec![1; rank];
    for meta in metas {
        let offset = rank - meta.rank();
        for (dim, size) in meta.shape.iter().enumerate() {
            shape[offset + dim] = shape[offset + dim].max(*size);
        }
    }
    shape
}

/// Placements an operand must have to produce `out_placements` without communication.
fn expected_placements(out_placements: &[Placement], out_shape: &[usize], meta: &TensorMeta) -> Vec<Placement> {
    let offset = out_shape.len() - meta.rank();
    out_placements
        .iter()
        .map(|placement| match placement {
            Placement::Shard(dim) if *dim < offset => Placement::Replicate,
            Placement::Shard(dim) => {
                let local = dim - offset;
                if meta.shape[local] == 1 && out_shape[*dim] != 1 {
                    Placement::Replicate
                } else {
                    Placement::Shard(local)
                }
            }
            other => *other,
        })
        .collect()
}
