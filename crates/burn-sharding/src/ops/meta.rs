use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::graph::{GraphError, ValueMeta};
use crate::schema::{Arg, OpOverload};
use crate::sharding::{DType, TensorMeta};

fn tensor_operand<'a>(op: &OpOverload, args: &'a [Arg<TensorMeta>], idx: usize) -> Result<&'a TensorMeta, GraphError> {
    args.get(idx)
        .and_then(Arg::tensor)
        .ok_or_else(|| GraphError::invalid_operands(op, format!("argument {idx} must be a tensor")))
}

/// Shape of the broadcast of `lhs` and `rhs`.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut shape = Vec::with_capacity(rank);
    for dim in 0..rank {
        let lhs_size = (dim + lhs.len()).checked_sub(rank).map_or(1, |idx| lhs[idx]);
        let rhs_size = (dim + rhs.len()).checked_sub(rank).map_or(1, |idx| rhs[idx]);
        let size = match (lhs_size, rhs_size) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
        shape.push(size);
    }
    Some(shape)
}

/// Meta function of element-wise binary operators with broadcasting.
pub fn binary_meta(
    op: &OpOverload,
    args: &[Arg<TensorMeta>],
    _kwargs: &BTreeMap<String, Arg<TensorMeta>>,
) -> Result<ValueMeta, GraphError> {
    let lhs = tensor_operand(op, args, 0)?;
    let rhs = tensor_operand(op, args, 1)?;

    if lhs.dtype != rhs.dtype {
        return Err(GraphError::invalid_operands(
            op,
            format!("element types differ: {} and {}", lhs.dtype, rhs.dtype),
        ));
    }
    let shape = broadcast_shapes(&lhs.shape, &rhs.shape).ok_or_else(|| {
        GraphError::invalid_operands(op, format!("shapes {lhs} and {rhs} cannot be broadcast"))
    })?;

    Ok(ValueMeta::Tensor(
        TensorMeta::new(shape, lhs.dtype).with_requires_grad(lhs.requires_grad || rhs.requires_grad),
    ))
}

/// Meta function of element-wise operators with one tensor operand.
///
/// Remaining operands, such as the scalar of `mul.Scalar`, do not affect the result.
pub fn unary_meta(
    op: &OpOverload,
    args: &[Arg<TensorMeta>],
    _kwargs: &BTreeMap<String, Arg<TensorMeta>>,
) -> Result<ValueMeta, GraphError> {
    let input = tensor_operand(op, args, 0)?;
    Ok(ValueMeta::Tensor(
        TensorMeta::new(input.shape.clone(), input.dtype).with_requires_grad(input.requires_grad),
    ))
}

/// Meta function of `mm`.
pub fn mm_meta(
    op: &OpOverload,
    args: &[Arg<TensorMeta>],
    _kwargs: &BTreeMap<String, Arg<TensorMeta>>,
) -> Result<ValueMeta, GraphError> {
    let lhs = tensor_operand(op, args, 0)?;
    let rhs = tensor_operand(op, args, 1)?;

    let (&[m, k], &[k2, n]) = (lhs.shape.as_slice(), rhs.shape.as_slice()) else {
        return Err(GraphError::invalid_operands(
            op,
            format!("expected matrices, got {lhs} and {rhs}"),
        ));
    };
    if k != k2 {
        return Err(GraphError::invalid_operands(
            op,
            format!("inner dimensions differ: {lhs} and {rhs}"),
        ));
    }
    if lhs.dtype != rhs.dtype || lhs.dtype == DType::Bool {
        return Err(GraphError::invalid_operands(
            op,
            format!("unsupported element types {} and {}", lhs.dtype, rhs.dtype),
        ));
    }

    Ok(ValueMeta::Tensor(
        TensorMeta::new([m, n], lhs.dtype).with_requires_grad(lhs.requires_grad || rhs.requires_grad),
    ))
}
