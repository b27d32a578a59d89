//! Cache entry contexts: how each kind of native allocation is keyed,
//! sized, and loaded.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::codec;
use crate::engine::{KnnEngine, VectorDataType};
use crate::error::KnnResult;
use crate::memory::allocation::NativeMemoryAllocation;
use crate::memory::shared::SharedIndexStateManager;
use crate::native::raw;

/// Describes one cacheable native allocation: its cache key, the weight it
/// is admitted at, and how to materialize it on a miss.
pub trait NativeMemoryEntryContext: Send + Sync {
    /// Cache key; equal keys share one allocation.
    fn key(&self) -> &str;

    /// Declared weight in bytes, used for admission before the entry is
    /// loaded.
    fn size_bytes(&self) -> u64;

    /// Materialize the native allocation. Called at most once per cache
    /// miss; the cache serializes loads per key.
    fn load(&self) -> KnnResult<NativeMemoryAllocation>;
}

/// Entry context for a serialized index file.
pub struct IndexEntryContext {
    key: String,
    index_path: PathBuf,
    index_name: String,
    engine: KnnEngine,
    data_type: VectorDataType,
    model_id: Option<String>,
    shared_manager: Arc<SharedIndexStateManager>,
    size_bytes: u64,
}

impl IndexEntryContext {
    /// Create a context for the index file at `index_path`, keyed by the
    /// path itself. The admission weight is the current file size.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::KnnError::Io`] if the file cannot be
    /// inspected.
    pub fn new(
        index_path: impl Into<PathBuf>,
        index_name: impl Into<String>,
        engine: KnnEngine,
        data_type: VectorDataType,
        shared_manager: Arc<SharedIndexStateManager>,
    ) -> KnnResult<Self> {
        let index_path = index_path.into();
        let size_bytes = std::fs::metadata(&index_path)?.len();
        Ok(Self {
            key: index_path.display().to_string(),
            index_path,
            index_name: index_name.into(),
            engine,
            data_type,
            model_id: None,
            shared_manager,
            size_bytes,
        })
    }

    /// Mark the index as built from a trained model; loading it will attach
    /// the model's shared state.
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }
}

impl NativeMemoryEntryContext for IndexEntryContext {
    fn key(&self) -> &str {
        &self.key
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn load(&self) -> KnnResult<NativeMemoryAllocation> {
        codec::verify_footer(&self.index_path)?;
        let address = raw::load_index(&self.index_path)?;

        let shared = match &self.model_id {
            Some(model_id) => {
                // SAFETY: `address` was just loaded and is not yet visible
                // to any other thread.
                let state = match self.shared_manager.get(address, model_id, self.engine) {
                    Ok(state) => state,
                    Err(e) => {
                        unsafe { raw::free_index(address) };
                        return Err(e);
                    }
                };
                unsafe { raw::set_shared_index_state(address, state.address()) };
                Some((state, Arc::clone(&self.shared_manager)))
            }
            None => None,
        };

        debug!(key = %self.key, size_bytes = self.size_bytes, "loaded index into native memory");
        Ok(NativeMemoryAllocation::index(
            address,
            self.size_bytes,
            self.engine,
            self.index_path.clone(),
            self.index_name.clone(),
            self.data_type == VectorDataType::Binary,
            shared,
        ))
    }
}

/// Supplies the packed training vectors for a training-data entry.
pub type TrainingDataSupplier = Box<dyn Fn() -> KnnResult<Vec<u8>> + Send + Sync>;

/// Entry context for training vectors staged off-heap ahead of model
/// training. Keyed by training index and field.
pub struct TrainingDataEntryContext {
    key: String,
    size_bytes: u64,
    data_type: VectorDataType,
    supplier: TrainingDataSupplier,
}

impl TrainingDataEntryContext {
    pub fn new(
        train_index: &str,
        train_field: &str,
        size_bytes: u64,
        data_type: VectorDataType,
        supplier: TrainingDataSupplier,
    ) -> Self {
        Self {
            key: format!("tdata#{train_index}:{train_field}"),
            size_bytes,
            data_type,
            supplier,
        }
    }
}

impl NativeMemoryEntryContext for TrainingDataEntryContext {
    fn key(&self) -> &str {
        &self.key
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn load(&self) -> KnnResult<NativeMemoryAllocation> {
        let bytes = (self.supplier)()?;
        // SAFETY: address 0 allocates a fresh buffer owned by the
        // allocation below.
        let address = unsafe { raw::store_vector_data(0, &bytes, bytes.len(), false) };
        Ok(NativeMemoryAllocation::training_data(
            address,
            self.size_bytes,
            self.data_type,
        ))
    }
}

/// Entry context that reserves cache weight without loading anything; each
/// instance gets a unique key.
pub struct AnonymousEntryContext {
    key: String,
    size_bytes: u64,
}

impl AnonymousEntryContext {
    pub fn new(size_bytes: u64) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            size_bytes,
        }
    }
}

impl NativeMemoryEntryContext for AnonymousEntryContext {
    fn key(&self) -> &str {
        &self.key
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn load(&self) -> KnnResult<NativeMemoryAllocation> {
        Ok(NativeMemoryAllocation::anonymous(self.size_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::params::BuildIndexParams;
    use crate::build::strategy::CancelToken;
    use crate::build::writer::NativeIndexWriter;
    use crate::config::BuildConfig;
    use crate::error::KnnError;
    use crate::vectors::SliceVectorSource;
    use tempfile::tempdir;

    fn build_index(path: &std::path::Path) {
        let params = BuildIndexParams::new("field", KnnEngine::Hnsw, path);
        let mut source =
            SliceVectorSource::from_floats(2, vec![(1, vec![1.0, 2.0]), (2, vec![5.0, 6.0])])
                .unwrap();
        NativeIndexWriter::new(BuildConfig::default())
            .flush_index(&params, &mut source, &CancelToken::new())
            .unwrap();
    }

    #[test]
    fn index_context_loads_queryable_allocation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctx.hnsw");
        build_index(&path);

        let context = IndexEntryContext::new(
            &path,
            "my-index",
            KnnEngine::Hnsw,
            VectorDataType::Float,
            Arc::new(SharedIndexStateManager::new()),
        )
        .unwrap();
        assert_eq!(context.size_bytes(), std::fs::metadata(&path).unwrap().len());

        let allocation = context.load().unwrap();
        assert_eq!(allocation.index_name(), Some("my-index"));
        let guard = allocation.read().unwrap();
        let query: Vec<u8> = [5.0f32, 6.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(guard.query(&query, 1).unwrap()[0].id, 2);
    }

    #[test]
    fn index_context_rejects_corrupted_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("corrupt.hnsw");
        build_index(&path);

        let context = IndexEntryContext::new(
            &path,
            "my-index",
            KnnEngine::Hnsw,
            VectorDataType::Float,
            Arc::new(SharedIndexStateManager::new()),
        )
        .unwrap();

        // Flip a byte in the body after the context captured the size.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            context.load(),
            Err(KnnError::CorruptedIndex { .. })
        ));
    }

    #[test]
    fn training_data_context_stages_supplied_bytes() {
        let context = TrainingDataEntryContext::new(
            "train-index",
            "train-field",
            128,
            VectorDataType::Float,
            Box::new(|| Ok(vec![1, 2, 3, 4])),
        );
        assert_eq!(context.key(), "tdata#train-index:train-field");

        let allocation = context.load().unwrap();
        assert!(allocation.is_training_data());
        assert_eq!(allocation.size_bytes(), 128);
        allocation.close();
    }

    #[test]
    fn anonymous_contexts_get_unique_keys() {
        let a = AnonymousEntryContext::new(10);
        let b = AnonymousEntryContext::new(10);
        assert_ne!(a.key(), b.key());
    }
}
