use alloc::string::{String, ToString};
use derive_new::new;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when reading or writing a [`PropagatorConfig`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration could not be serialized or parsed.
    #[error("Invalid configuration format: {0}")]
    Json(String),
    /// The configuration file could not be accessed.
    #[error("Failed to access the configuration file: {0}")]
    Io(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err.to_string())
    }
}

/// Configuration of a [`CachingPropagator`](crate::CachingPropagator).
///
/// ```rust
/// use burn_sharding::PropagatorConfig;
///
/// let config = PropagatorConfig::new().with_cache_capacity(Some(256));
/// let json = config.to_json().unwrap();
/// assert_eq!(PropagatorConfig::from_json(&json).unwrap(), config);
/// ```
#[derive(new, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagatorConfig {
    /// Maximum number of cached propagation results.
    ///
    /// `None` keeps every result. When the bound is reached, the least recently used
    /// result is evicted. `Some(0)` disables caching.
    #[new(default)]
    #[serde(default)]
    pub cache_capacity: Option<usize>,
}

impl PropagatorConfig {
    /// Sets the cache capacity.
    pub fn with_cache_capacity(mut self, cache_capacity: Option<usize>) -> Self {
        self.cache_capacity = cache_capacity;
        self
    }

    /// Serializes the configuration to pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a configuration from JSON. Missing fields take their default value.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Writes the configuration to a JSON file.
    #[cfg(feature = "std")]
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        std::fs::write(path, self.to_json()?).map_err(|err| ConfigError::Io(err.to_string()))
    }

    /// Reads a configuration from a JSON file.
    #[cfg(feature = "std")]
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|err| ConfigError::Io(err.to_string()))?;
        Self::from_json(&json)
    }
}
