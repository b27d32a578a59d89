//! Native approximate-nearest-neighbor index construction and caching.
//!
//! This crate covers two halves of a k-NN search engine's native side:
//!
//! - **Build pipeline**: vectors are streamed out of segment storage,
//!   optionally quantized, transferred to off-heap staging memory in
//!   bounded batches, and handed to the native library to build an index
//!   file, which is sealed with a CRC-32 integrity footer.
//! - **Memory management**: loaded indexes and training data live in a
//!   weighted LRU cache with a circuit breaker, guarded read access, and
//!   reference-counted sharing of per-model state.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use knn_native::build::{BuildIndexParams, CancelToken};
//! use knn_native::config::{BuildConfig, CacheConfig};
//! use knn_native::context::KnnContext;
//! use knn_native::engine::{KnnEngine, VectorDataType};
//! use knn_native::memory::IndexEntryContext;
//! use knn_native::vectors::SliceVectorSource;
//!
//! # fn main() -> knn_native::error::KnnResult<()> {
//! let context = KnnContext::new(CacheConfig::default(), BuildConfig::default())?;
//!
//! let params = BuildIndexParams::new("embedding", KnnEngine::Hnsw, "/tmp/_0_embedding.hnsw");
//! let mut source = SliceVectorSource::from_floats(2, vec![(0, vec![1.0, 2.0])])?;
//! context.writer().flush_index(&params, &mut source, &CancelToken::new())?;
//!
//! let entry = IndexEntryContext::new(
//!     "/tmp/_0_embedding.hnsw",
//!     "my-index",
//!     KnnEngine::Hnsw,
//!     VectorDataType::Float,
//!     Arc::clone(context.shared_index_state()),
//! )?;
//! let allocation = context.cache().get(&entry, true)?;
//! let query: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
//! let neighbors = allocation.read()?.query(&query, 10)?;
//! # let _ = neighbors;
//! # Ok(())
//! # }
//! ```

pub mod build;
pub mod codec;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod memory;
pub mod native;
pub mod quantize;
pub mod transfer;
pub mod vectors;

pub use build::{BuildIndexParams, BuildStrategy, CancelToken, IndexParams, NativeIndexWriter};
pub use config::{BuildConfig, CacheConfig};
pub use context::KnnContext;
pub use engine::{KnnEngine, SpaceType, VectorDataType};
pub use error::{KnnError, KnnResult};
pub use memory::{
    IndexEntryContext, NativeMemoryAllocation, NativeMemoryCacheManager, SharedIndexStateManager,
};
pub use native::Neighbor;
pub use transfer::OffHeapVectorTransfer;
pub use vectors::{SliceVectorSource, VectorSource};
