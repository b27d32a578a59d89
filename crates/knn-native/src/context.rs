//! Top-level handle wiring the cache, shared state, and build pipeline
//! together.

use std::sync::Arc;

use crate::build::writer::NativeIndexWriter;
use crate::config::{BuildConfig, CacheConfig};
use crate::error::KnnResult;
use crate::memory::cache::NativeMemoryCacheManager;
use crate::memory::shared::SharedIndexStateManager;

/// Owns the long-lived services of the k-NN subsystem. Construct one per
/// process and share it; there are no global singletons behind it.
pub struct KnnContext {
    cache: Arc<NativeMemoryCacheManager>,
    shared_index_state: Arc<SharedIndexStateManager>,
    build_config: BuildConfig,
}

impl KnnContext {
    /// # Errors
    ///
    /// Returns [`crate::error::KnnError::InvalidConfig`] if either
    /// configuration fails validation.
    pub fn new(cache_config: CacheConfig, build_config: BuildConfig) -> KnnResult<Self> {
        build_config.validate()?;
        Ok(Self {
            cache: Arc::new(NativeMemoryCacheManager::new(cache_config)?),
            shared_index_state: Arc::new(SharedIndexStateManager::new()),
            build_config,
        })
    }

    pub fn cache(&self) -> &Arc<NativeMemoryCacheManager> {
        &self.cache
    }

    pub fn shared_index_state(&self) -> &Arc<SharedIndexStateManager> {
        &self.shared_index_state
    }

    pub fn build_config(&self) -> &BuildConfig {
        &self.build_config
    }

    /// Create a writer configured from this context.
    pub fn writer(&self) -> NativeIndexWriter {
        NativeIndexWriter::new(self.build_config.clone())
    }
}
