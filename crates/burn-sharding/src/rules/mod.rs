//! Sharding rules and the registry that maps operators to them.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use hashbrown::HashMap;

use crate::output::OutputSharding;
use crate::schema::{OpOverload, OpSchema};

mod matrix;
mod pointwise;

pub use matrix::*;
pub use pointwise::*;

/// Error raised by a sharding rule that could not run at all.
///
/// A rule that runs but cannot shard its inputs should report it through
/// [`OutputSharding::failed`] or [`OutputSharding::suggest`] instead.
pub type RuleError = Box<dyn core::error::Error + Send + Sync>;

/// Computes the output sharding of an operator from the sharding of its inputs.
///
/// Rules must be pure functions of the schema: cached propagation results are reused
/// for structurally equal schemas.
pub trait ShardingRule: Send + Sync {
    /// Propagates sharding through one call described by `schema`.
    fn propagate(&self, schema: &OpSchema) -> Result<OutputSharding, RuleError>;
}

impl<F> ShardingRule for F
where
    F: Fn(&OpSchema) -> Result<OutputSharding, RuleError> + Send + Sync,
{
    fn propagate(&self, schema: &OpSchema) -> Result<OutputSharding, RuleError> {
        self(schema)
    }
}

/// Pins the signature of a closure so it can be registered as a [`ShardingRule`].
///
/// ```rust
/// use burn_sharding::OutputSharding;
/// use burn_sharding::rules::{RuleRegistry, rule_fn};
/// # use burn_sharding::{FunctionSchema, OpOverload};
/// # let op = OpOverload::new(FunctionSchema::new("aten::relu", ""));
///
/// let mut registry = RuleRegistry::new();
/// registry.register(op, rule_fn(|_schema| Ok(OutputSharding::scalar())));
/// assert_eq!(registry.len(), 1);
/// ```
pub fn rule_fn<F>(f: F) -> F
where
    F: Fn(&OpSchema) -> Result<OutputSharding, RuleError> + Send + Sync,
{
    f
}

/// Maps operator identities to their sharding rule.
///
/// Populated before propagation starts and read-only afterwards. Cloning is cheap: rules
/// are shared.
#[derive(Clone, Default)]
pub struct RuleRegistry {
    rules: HashMap<OpOverload, Arc<dyn ShardingRule>>,
}

impl RuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `rule` with `op`, replacing any previous rule.
    pub fn register<R: ShardingRule + 'static>(&mut self, op: OpOverload, rule: R) {
        self.rules.insert(op, Arc::new(rule));
    }

    /// The rule registered for `op`.
    pub fn get(&self, op: &OpOverload) -> Option<&Arc<dyn ShardingRule>> {
        self.rules.get(op)
    }

    /// Returns `true` if a rule is registered for `op`.
    pub fn contains(&self, op: &OpOverload) -> bool {
        self.rules.contains_key(op)
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if no rule is registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Operators with a registered rule, in no particular order.
    pub fn ops(&self) -> Vec<&OpOverload> {
        self.rules.keys().collect()
    }
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.rules.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ArgType, FunctionSchema};
    use alloc::collections::BTreeMap;
    use alloc::vec;

    fn relu() -> OpOverload {
        OpOverload::new(
            FunctionSchema::new("aten::relu", "")
                .arg("self", ArgType::Tensor)
                .returns(ArgType::Tensor),
        )
    }

    #[test]
    fn test_registry_last_registration_wins() {
        let mut registry = RuleRegistry::new();
        registry.register(relu(), rule_fn(|_| Ok(OutputSharding::failed("first"))));
        registry.register(relu(), rule_fn(|_| Ok(OutputSharding::failed("second"))));

        let schema = OpSchema::new(relu(), vec![], BTreeMap::new());
        let result = registry.get(&relu()).unwrap().propagate(&schema).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(result.failed_reason.as_deref(), Some("second"));
    }

    #[test]
    fn test_registry_lookup_by_qualified_name() {
        let mut registry = RuleRegistry::new();
        registry.register(relu(), rule_fn(|_| Ok(OutputSharding::scalar())));

        let add = OpOverload::new(FunctionSchema::new("aten::add", "Tensor"));

        assert!(registry.contains(&relu()));
        assert!(!registry.contains(&add));
        assert!(registry.get(&add).is_none());
        assert_eq!(registry.ops(), vec![&relu()]);
    }
}
