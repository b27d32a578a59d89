//! Orchestrates a complete index build: strategy selection, the native
//! build itself, failure cleanup, and the integrity footer.

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::build::params::BuildIndexParams;
use crate::build::strategy::{BuildStrategy, CancelToken};
use crate::codec;
use crate::config::BuildConfig;
use crate::error::KnnResult;
use crate::vectors::VectorSource;

/// Running counters for merge-triggered builds.
#[derive(Default)]
pub struct MergeStats {
    current_operations: AtomicU64,
    current_docs: AtomicU64,
    total_operations: AtomicU64,
    total_docs: AtomicU64,
}

impl MergeStats {
    fn start(&self, docs: u64) {
        self.current_operations.fetch_add(1, Ordering::AcqRel);
        self.current_docs.fetch_add(docs, Ordering::AcqRel);
    }

    /// Totals count only merges that actually produced an index.
    fn finish(&self, docs: u64, completed: bool) {
        self.current_operations.fetch_sub(1, Ordering::AcqRel);
        self.current_docs.fetch_sub(docs, Ordering::AcqRel);
        if completed {
            self.total_operations.fetch_add(1, Ordering::AcqRel);
            self.total_docs.fetch_add(docs, Ordering::AcqRel);
        }
    }

    /// Merges currently in flight.
    pub fn current_operations(&self) -> u64 {
        self.current_operations.load(Ordering::Acquire)
    }

    /// Docs in merges currently in flight.
    pub fn current_docs(&self) -> u64 {
        self.current_docs.load(Ordering::Acquire)
    }

    /// Completed merge operations.
    pub fn total_operations(&self) -> u64 {
        self.total_operations.load(Ordering::Acquire)
    }

    /// Docs across completed merges.
    pub fn total_docs(&self) -> u64 {
        self.total_docs.load(Ordering::Acquire)
    }
}

/// Builds native index files for segment fields.
pub struct NativeIndexWriter {
    config: BuildConfig,
    merge_stats: Arc<MergeStats>,
}

impl NativeIndexWriter {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            merge_stats: Arc::new(MergeStats::default()),
        }
    }

    pub fn merge_stats(&self) -> Arc<MergeStats> {
        Arc::clone(&self.merge_stats)
    }

    /// Build an index as part of a segment flush.
    pub fn flush_index(
        &self,
        params: &BuildIndexParams,
        source: &mut dyn VectorSource,
        cancel: &CancelToken,
    ) -> KnnResult<()> {
        self.create_index(params, source, cancel, false)
    }

    /// Build an index as part of a segment merge; tracked in
    /// [`MergeStats`].
    pub fn merge_index(
        &self,
        params: &BuildIndexParams,
        source: &mut dyn VectorSource,
        cancel: &CancelToken,
    ) -> KnnResult<()> {
        self.create_index(params, source, cancel, true)
    }

    fn create_index(
        &self,
        params: &BuildIndexParams,
        source: &mut dyn VectorSource,
        cancel: &CancelToken,
        is_merge: bool,
    ) -> KnnResult<()> {
        source.init()?;
        let docs = source.total_live_docs();
        if docs == 0 {
            debug!(field = %params.field_name, "no live vectors, skipping index build");
            return Ok(());
        }

        // Register the file with the directory before the native library
        // writes into it.
        File::create(&params.index_path)?;

        let mut params = params.clone();
        params.params.index_thread_qty = self.config.index_thread_qty;

        let strategy = BuildStrategy::select(params.engine, params.template.is_some());
        if is_merge {
            self.merge_stats.start(docs as u64);
        }
        let result = strategy.build_and_write(
            &params,
            source,
            self.config.vector_streaming_memory_limit_bytes,
            cancel,
        );
        if is_merge {
            self.merge_stats.finish(docs as u64, result.is_ok());
        }

        if let Err(e) = result {
            // Best effort: do not leave a partial index behind.
            let _ = std::fs::remove_file(&params.index_path);
            return Err(e);
        }

        codec::append_footer(&params.index_path)?;
        info!(
            field = %params.field_name,
            path = %params.index_path.display(),
            docs,
            is_merge,
            "wrote native index"
        );
        Ok(())
    }
}
