use hashbrown::HashMap;

use crate::config::PropagatorConfig;
use crate::error::PropagationError;
use crate::output::OutputSharding;
use crate::propagator::{PropagateSharding, ShardingPropagator};
use crate::schema::{OpOverload, OpSchema};

/// Counters of a [`PropagationCache`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to propagate.
    pub misses: u64,
    /// Results dropped to respect the capacity.
    pub evictions: u64,
}

impl CacheStats {
    /// Share of lookups answered from the cache, `0.0` before the first lookup.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    result: OutputSharding,
    last_used: u64,
}

/// Propagation results keyed by operation schema, with optional LRU eviction.
#[derive(Clone, Debug, Default)]
pub struct PropagationCache {
    entries: HashMap<OpSchema, CacheEntry>,
    capacity: Option<usize>,
    clock: u64,
    stats: CacheStats,
}

impl PropagationCache {
    /// Creates a cache holding at most `capacity` results, or any number if `None`.
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// The cached result for `schema`, counting the lookup.
    pub fn get(&mut self, schema: &OpSchema) -> Option<&OutputSharding> {
        self.clock += 1;
        match self.entries.get_mut(schema) {
            Some(entry) => {
                entry.last_used = self.clock;
                self.stats.hits += 1;
                Some(&entry.result)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Stores `result` for `schema`, evicting the least recently used result when full.
    pub fn insert(&mut self, schema: OpSchema, result: OutputSharding) {
        if self.capacity == Some(0) {
            return;
        }

        if let Some(capacity) = self.capacity {
            while self.entries.len() >= capacity && !self.entries.contains_key(&schema) {
                let Some(oldest) = self
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(key, _)| key.clone())
                else {
                    break;
                };
                log::trace!("Evicting cached sharding for {oldest}");
                self.entries.remove(&oldest);
                self.stats.evictions += 1;
            }
        }

        self.clock += 1;
        self.entries.insert(
            schema,
            CacheEntry {
                result,
                last_used: self.clock,
            },
        );
    }

    /// Returns `true` if a result is cached for `schema`. Does not count as a lookup.
    pub fn contains(&self, schema: &OpSchema) -> bool {
        self.entries.contains_key(schema)
    }

    /// Number of cached results.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no result is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of cached results.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Lookup and eviction counters.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Drops every cached result. Counters are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A [`ShardingPropagator`] that reuses the result of earlier propagations.
///
/// Results are keyed by [`OpSchema`], so rules must be pure functions of their schema.
/// Failures are never cached. The cache is not synchronized: share a propagator across
/// threads behind a lock.
#[derive(Clone, Debug, Default)]
pub struct CachingPropagator {
    propagator: ShardingPropagator,
    cache: PropagationCache,
}

impl CachingPropagator {
    /// Wraps `propagator` with an unbounded cache.
    pub fn new(propagator: ShardingPropagator) -> Self {
        Self {
            propagator,
            cache: PropagationCache::new(None),
        }
    }

    /// Wraps `propagator` with a cache sized by `config`.
    pub fn from_config(propagator: ShardingPropagator, config: &PropagatorConfig) -> Self {
        Self {
            propagator,
            cache: PropagationCache::new(config.cache_capacity),
        }
    }

    /// Computes the output sharding of `op`, or returns the cached result for an equal
    /// schema.
    pub fn propagate(&mut self, op: &OpOverload, op_schema: &OpSchema) -> Result<OutputSharding, PropagationError> {
        if let Some(result) = self.cache.get(op_schema) {
            log::trace!("Sharding cache hit for {op_schema}");
            return Ok(result.clone());
        }

        let result = self.propagator.propagate(op, op_schema)?;
        self.cache.insert(op_schema.clone(), result.clone());
        Ok(result)
    }

    /// The wrapped propagator.
    pub fn propagator(&self) -> &ShardingPropagator {
        &self.propagator
    }

    /// Mutable access to the wrapped propagator.
    ///
    /// Cached results are kept: clear the cache after changing a rule.
    pub fn propagator_mut(&mut self) -> &mut ShardingPropagator {
        &mut self.propagator
    }

    /// The result cache.
    pub fn cache(&self) -> &PropagationCache {
        &self.cache
    }

    /// Lookup and eviction counters of the cache.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drops every cached result.
    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }
}

impl PropagateSharding for CachingPropagator {
    fn propagate(&mut self, op: &OpOverload, op_schema: &OpSchema) -> Result<OutputSharding, PropagationError> {
        CachingPropagator::propagate(self, op, op_schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Arg, ArgType, FunctionSchema};
    use crate::sharding::{DeviceMesh, MeshDim, Placement, ShardingSpec};
    use alloc::collections::BTreeMap;
    use alloc::sync::Arc;
    use alloc::vec;

    fn schema(dim: usize) -> OpSchema {
        let mesh = Arc::new(DeviceMesh::new_1d(vec![0, 1], MeshDim::new("tp")).unwrap());
        let op = OpOverload::new(
            FunctionSchema::new("aten::neg", "")
                .arg("self", ArgType::Tensor)
                .returns(ArgType::Tensor),
        );
        let spec = ShardingSpec::new(mesh, vec![Placement::Shard(dim)]).unwrap();
        OpSchema::new(op, vec![Arg::Tensor(spec)], BTreeMap::new())
    }

    #[test]
    fn test_cache_counts_lookups() {
        let mut cache = PropagationCache::new(None);

        assert!(cache.get(&schema(0)).is_none());
        cache.insert(schema(0), OutputSharding::scalar());
        assert_eq!(cache.get(&schema(0)), Some(&OutputSharding::scalar()));

        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );
        assert_eq!(cache.stats().hit_rate(), 0.5);
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let mut cache = PropagationCache::new(Some(2));
        cache.insert(schema(0), OutputSharding::failed("0"));
        cache.insert(schema(1), OutputSharding::failed("1"));
        cache.get(&schema(0));

        cache.insert(schema(2), OutputSharding::failed("2"));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&schema(0)));
        assert!(!cache.contains(&schema(1)));
        assert!(cache.contains(&schema(2)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_cache_overwrite_does_not_evict() {
        let mut cache = PropagationCache::new(Some(1));
        cache.insert(schema(0), OutputSharding::failed("old"));

        cache.insert(schema(0), OutputSharding::failed("new"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.get(&schema(0)).and_then(|r| r.failed_reason.as_deref()), Some("new"));
    }

    #[test]
    fn test_zero_capacity_disables_cache() {
        let mut cache = PropagationCache::new(Some(0));

        cache.insert(schema(0), OutputSharding::scalar());

        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), Some(0));
    }
}
