//! A small catalogue of ATen operators: signatures, meta functions, decompositions and
//! sharding rules.
//!
//! ```rust
//! use burn_sharding::ShardingPropagator;
//! use burn_sharding::ops::{self, aten};
//!
//! let mut propagator = ShardingPropagator::new();
//! ops::install(&mut propagator);
//! assert!(propagator.rules().contains(&aten::mm()));
//! assert!(propagator.fake_mode().has_decomposition(&aten::addmm()));
//! ```

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::graph::{GraphError, GraphTracer, Traced};
use crate::propagator::ShardingPropagator;
use crate::rules::{linear_pointwise_rule, mm_rule, pointwise_rule};
use crate::schema::{Arg, Scalar};

mod meta;

pub use meta::*;

/// Operator identities.
pub mod aten {
    use crate::schema::{ArgType, FunctionSchema, OpOverload};

    /// `aten::add.Tensor(Tensor self, Tensor other) -> Tensor`
    pub fn add() -> OpOverload {
        OpOverload::new(
            FunctionSchema::new("aten::add", "Tensor")
                .arg("self", ArgType::Tensor)
                .arg("other", ArgType::Tensor)
                .returns(ArgType::Tensor),
        )
    }

    /// `aten::mul.Tensor(Tensor self, Tensor other) -> Tensor`
    pub fn mul() -> OpOverload {
        OpOverload::new(
            FunctionSchema::new("aten::mul", "Tensor")
                .arg("self", ArgType::Tensor)
                .arg("other", ArgType::Tensor)
                .returns(ArgType::Tensor),
        )
    }

    /// `aten::mul.Scalar(Tensor self, Scalar other) -> Tensor`
    pub fn mul_scalar() -> OpOverload {
        OpOverload::new(
            FunctionSchema::new("aten::mul", "Scalar")
                .arg("self", ArgType::Tensor)
                .arg("other", ArgType::Scalar)
                .returns(ArgType::Tensor),
        )
    }

    /// `aten::relu(Tensor self) -> Tensor`
    pub fn relu() -> OpOverload {
        OpOverload::new(
            FunctionSchema::new("aten::relu", "")
                .arg("self", ArgType::Tensor)
                .returns(ArgType::Tensor),
        )
    }

    /// `aten::mm(Tensor self, Tensor mat2) -> Tensor`
    pub fn mm() -> OpOverload {
        OpOverload::new(
            FunctionSchema::new("aten::mm", "")
                .arg("self", ArgType::Tensor)
                .arg("mat2", ArgType::Tensor)
                .returns(ArgType::Tensor),
        )
    }

    /// `aten::addmm(Tensor self, Tensor mat1, Tensor mat2, *, Scalar beta, Scalar alpha) -> Tensor`
    pub fn addmm() -> OpOverload {
        OpOverload::new(
            FunctionSchema::new("aten::addmm", "")
                .arg("self", ArgType::Tensor)
                .arg("mat1", ArgType::Tensor)
                .arg("mat2", ArgType::Tensor)
                .kwarg("beta", ArgType::Scalar)
                .kwarg("alpha", ArgType::Scalar)
                .returns(ArgType::Tensor),
        )
    }
}

/// Registers the catalogue on `propagator`: meta functions and decompositions on its fake
/// mode, sharding rules on its registry.
pub fn install(propagator: &mut ShardingPropagator) {
    let fake_mode = propagator.fake_mode_mut();
    fake_mode.register_meta(aten::add(), binary_meta);
    fake_mode.register_meta(aten::mul(), binary_meta);
    fake_mode.register_meta(aten::mul_scalar(), unary_meta);
    fake_mode.register_meta(aten::relu(), unary_meta);
    fake_mode.register_meta(aten::mm(), mm_meta);
    fake_mode.register_decomposition(aten::addmm(), addmm_decomposition);

    propagator.register_sharding_prop_rule(aten::add(), linear_pointwise_rule);
    propagator.register_sharding_prop_rule(aten::mul(), pointwise_rule);
    propagator.register_sharding_prop_rule(aten::mul_scalar(), linear_pointwise_rule);
    propagator.register_sharding_prop_rule(aten::relu(), pointwise_rule);
    propagator.register_sharding_prop_rule(aten::mm(), mm_rule);
}

/// `addmm(self, mat1, mat2, *, beta, alpha) = beta * self + alpha * mm(mat1, mat2)`
///
/// Scaling by one is skipped, and `beta == 0` drops the bias.
pub fn addmm_decomposition(
    tracer: &mut GraphTracer<'_>,
    args: &[Arg<Traced>],
    kwargs: &BTreeMap<String, Arg<Traced>>,
) -> Result<Vec<Traced>, GraphError> {
    let [bias, mat1, mat2] = args else {
        return Err(GraphError::invalid_operands(
            &aten::addmm(),
            "expected self, mat1 and mat2",
        ));
    };
    let beta = scalar_kwarg(kwargs, "beta")?;
    let alpha = scalar_kwarg(kwargs, "alpha")?;
    let no_kwargs = BTreeMap::new();

    let mut product = tracer.call_one(&aten::mm(), &[mat1.clone(), mat2.clone()], &no_kwargs)?;
    if alpha != 1.0 {
        product = tracer.call_one(
            &aten::mul_scalar(),
            &[Arg::Tensor(product), Arg::Scalar(Scalar::Float(alpha))],
            &no_kwargs,
        )?;
    }
    if beta == 0.0 {
        return Ok(vec![product]);
    }

    let mut bias = bias.clone();
    if beta != 1.0 {
        let scaled = tracer.call_one(
            &aten::mul_scalar(),
            &[bias, Arg::Scalar(Scalar::Float(beta))],
            &no_kwargs,
        )?;
        bias = Arg::Tensor(scaled);
    }

    let sum = tracer.call_one(&aten::add(), &[bias, Arg::Tensor(product)], &no_kwargs)?;
    Ok(vec![sum])
}

fn scalar_kwarg(kwargs: &BTreeMap<String, Arg<Traced>>, name: &str) -> Result<f64, GraphError> {
    match kwargs.get(name) {
        None | Some(Arg::None) => Ok(1.0),
        Some(arg) => arg.scalar().and_then(Scalar::as_f64).ok_or_else(|| {
            GraphError::invalid_operands(&aten::addmm(), alloc::format!("{name} must be a number"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FakeTensor, FakeTensorMode, NodeKind};
    use crate::sharding::{DType, TensorMeta};

    fn fake(shape: &[usize]) -> Arg<FakeTensor> {
        Arg::Tensor(FakeTensor::empty_strided(
            shape.to_vec(),
            crate::sharding::contiguous_strides(shape),
            DType::F32,
            false,
        ))
    }

    fn targets(mode: &FakeTensorMode, kwargs: &BTreeMap<String, Arg<FakeTensor>>) -> Vec<String> {
        let graph = mode
            .build_isolated_graph(&aten::addmm(), &[fake(&[6]), fake(&[8, 4]), fake(&[4, 6])], kwargs)
            .unwrap();
        graph
            .nodes()
            .iter()
            .filter_map(|node| match node.kind() {
                NodeKind::CallFunction { target, .. } => Some(alloc::format!("{target}")),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_addmm_decomposition() {
        let mut propagator = ShardingPropagator::new();
        install(&mut propagator);
        let mode = propagator.fake_mode();

        let mut scaled = BTreeMap::new();
        scaled.insert(String::from("alpha"), Arg::Scalar(Scalar::Float(2.0)));
        scaled.insert(String::from("beta"), Arg::Scalar(Scalar::Int(3)));
        let mut no_bias = BTreeMap::new();
        no_bias.insert(String::from("beta"), Arg::Scalar(Scalar::Int(0)));

        assert_eq!(targets(mode, &BTreeMap::new()), vec!["aten::mm", "aten::add.Tensor"]);
        assert_eq!(
            targets(mode, &scaled),
            vec!["aten::mm", "aten::mul.Scalar", "aten::mul.Scalar", "aten::add.Tensor"]
        );
        assert_eq!(targets(mode, &no_bias), vec!["aten::mm"]);
    }

    #[test]
    fn test_addmm_output_meta() {
        let mut propagator = ShardingPropagator::new();
        install(&mut propagator);

        let graph = propagator
            .fake_mode()
            .build_isolated_graph(&aten::addmm(), &[fake(&[6]), fake(&[8, 4]), fake(&[4, 6])], &BTreeMap::new())
            .unwrap();

        let add = &graph.nodes()[graph.len() - 2];
        assert_eq!(add.meta().tensor(), Some(&TensorMeta::new([8, 6], DType::F32)));
        assert_eq!(graph.placeholder_count(), 3);
    }
}
