//! Runtime configuration for the cache and the build pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KnnError, KnnResult};

/// Configuration for the native memory cache.
///
/// The weight limit doubles as the circuit breaker threshold: when it is
/// enabled, entries that would push the cache past `max_weight_bytes` are
/// rejected unless the caller permits eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum total weight of cached entries, in bytes.
    pub max_weight_bytes: u64,

    /// Whether the weight limit is enforced. When false the cache grows
    /// without bound and the circuit breaker never trips.
    pub is_weight_limited: bool,

    /// Evict entries that have not been accessed for this long. `None`
    /// disables time-based expiry.
    pub expire_after_access: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_weight_bytes: 1024 * 1024 * 1024,
            is_weight_limited: true,
            expire_after_access: None,
        }
    }
}

impl CacheConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`KnnError::InvalidConfig`] if the weight limit is enabled
    /// with a zero budget, or if the expiry window is zero.
    pub fn validate(&self) -> KnnResult<()> {
        if self.is_weight_limited && self.max_weight_bytes == 0 {
            return Err(KnnError::InvalidConfig(
                "max_weight_bytes must be > 0 when the weight limit is enabled".into(),
            ));
        }
        if let Some(window) = self.expire_after_access {
            if window.is_zero() {
                return Err(KnnError::InvalidConfig(
                    "expire_after_access must be a non-zero duration".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Configuration for native index builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Ceiling on off-heap memory used to stage vectors during a build.
    /// Determines how many vectors are transferred to native memory per
    /// batch.
    pub vector_streaming_memory_limit_bytes: u64,

    /// Number of native threads used for index construction.
    pub index_thread_qty: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            vector_streaming_memory_limit_bytes: 32 * 1024 * 1024,
            index_thread_qty: 1,
        }
    }
}

impl BuildConfig {
    /// # Errors
    ///
    /// Returns [`KnnError::InvalidConfig`] if any field is zero.
    pub fn validate(&self) -> KnnResult<()> {
        if self.vector_streaming_memory_limit_bytes == 0 {
            return Err(KnnError::InvalidConfig(
                "vector_streaming_memory_limit_bytes must be > 0".into(),
            ));
        }
        if self.index_thread_qty == 0 {
            return Err(KnnError::InvalidConfig(
                "index_thread_qty must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(BuildConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_budget_rejected_only_when_limited() {
        let mut config = CacheConfig {
            max_weight_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.is_weight_limited = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_expiry_rejected() {
        let config = CacheConfig {
            expire_after_access: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn build_config_rejects_zeroes() {
        let config = BuildConfig {
            vector_streaming_memory_limit_bytes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = BuildConfig {
            index_thread_qty: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
