use alloc::format;
use alloc::vec::Vec;

use super::RuleError;
use super::pointwise::tensor_meta;
use crate::output::OutputSharding;
use crate::schema::{Arg, OpSchema};
use crate::sharding::{Placement, ReduceOp, ShardingSpec};

/// Sharding rule for `mm(self, mat2)`.
///
/// Supported placements, per mesh dimension:
///
/// | self   | mat2   | output    |
/// |--------|--------|-----------|
/// | `S(0)` | `R`    | `S(0)`    |
/// | `R`    | `S(1)` | `S(1)`    |
/// | `S(1)` | `S(0)` | `P(sum)`  |
/// | `P`    | `R`    | `P`       |
/// | `R`    | `P`    | `P`       |
/// | `R`    | `R`    | `R`       |
///
/// Any other pair yields a suggestion for the closest supported pair.
pub fn mm_rule(schema: &OpSchema) -> Result<OutputSharding, RuleError> {
    let (Some(lhs), Some(rhs)) = (schema.arg_spec(0), schema.arg_spec(1)) else {
        return Ok(OutputSharding::failed(format!(
            "{} expects two tensor operands",
            schema.op()
        )));
    };

    if lhs.device_mesh() != rhs.device_mesh() {
        return Ok(OutputSharding::failed(format!(
            "operands of {} are not on the same device mesh",
            schema.op()
        )));
    }

    let (lhs_meta, rhs_meta) = (tensor_meta(schema, 0, lhs)?, tensor_meta(schema, 1, rhs)?);
    if lhs_meta.rank() != 2 || rhs_meta.rank() != 2 {
        return Ok(OutputSharding::failed(format!(
            "{} expects matrices, got {lhs_meta} and {rhs_meta}",
            schema.op()
        )));
    }

    let mut out_placements = Vec::with_capacity(lhs.placements().len());
    let mut lhs_expected = Vec::with_capacity(lhs.placements().len());
    let mut rhs_expected = Vec::with_capacity(rhs.placements().len());
    let mut needs_redistribute = false;

    for (lhs_placement, rhs_placement) in lhs.placements().iter().zip(rhs.placements()) {
        match mm_placement(*lhs_placement, *rhs_placement) {
            Some(placement) => {
                out_placements.push(placement);
                lhs_expected.push(*lhs_placement);
                rhs_expected.push(*rhs_placement);
            }
            None => {
                let (lhs_placement, rhs_placement) = closest_supported(*lhs_placement, *rhs_placement);
                needs_redistribute = true;
                lhs_expected.push(lhs_placement);
                rhs_expected.push(rhs_placement);
            }
        }
    }

    if needs_redistribute {
        let mut args = schema.args_schema().to_vec();
        args[0] = Arg::Tensor(lhs.with_placements(lhs_expected)?);
        args[1] = Arg::Tensor(rhs.with_placements(rhs_expected)?);
        return Ok(OutputSharding::suggest(alloc::vec![schema.with_args(args)]));
    }

    Ok(OutputSharding::resolved(ShardingSpec::new(
        lhs.device_mesh().clone(),
        out_placements,
    )?))
}

fn mm_placement(lhs: Placement, rhs: Placement) -> Option<Placement> {
    match (lhs, rhs) {
        (Placement::Shard(0), Placement::Replicate) => Some(Placement::Shard(0)),
        (Placement::Replicate, Placement::Shard(1)) => Some(Placement::Shard(1)),
        (Placement::Shard(1), Placement::Shard(0)) => Some(Placement::Partial(ReduceOp::Sum)),
        (Placement::Partial(op), Placement::Replicate) | (Placement::Replicate, Placement::Partial(op))
            if op == ReduceOp::Sum =>
        {
            Some(Placement::Partial(op))
        }
        (Placement::Replicate, Placement::Replicate) => Some(Placement::Replicate),
        _ => None,
    }
}

fn closest_supported(lhs: Placement, rhs: Placement) -> (Placement, Placement) {
    if lhs.is_shard_on(0) {
        (Placement::Shard(0), Placement::Replicate)
    } else if rhs.is_shard_on(1) {
        (Placement::Replicate, Placement::Shard(1))
    } else if lhs.is_shard_on(1) || rhs.is_shard_on(0) {
        (Placement::Shard(1), Placement::Shard(0))
    } else {
        (Placement::Replicate, Placement::Replicate)
    }
}
