//! Build strategies: one-shot bulk transfer vs. memory-bounded streaming.
//!
//! Engines that must see every vector up front (and all template builds)
//! use the bulk path: the whole dataset is appended into one off-heap
//! buffer and the native build runs once. Engines that grow incrementally
//! use the streaming path: an index is pre-sized from the live doc count,
//! then fed one batch at a time from a single reused off-heap buffer, so
//! staging memory stays bounded regardless of dataset size.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::build::params::{BuildIndexParams, IndexParams};
use crate::engine::KnnEngine;
use crate::error::{KnnError, KnnResult};
use crate::native::raw;
use crate::quantize::Quantizer;
use crate::transfer::OffHeapVectorTransfer;
use crate::vectors::VectorSource;

/// Cooperative cancellation flag shared between a build and its caller.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Geometry and encoding resolved for one build: either straight from the
/// source, or from the quantizer's output state.
struct BuildSetup {
    dimensions: usize,
    bytes_per_vector: usize,
    effective: IndexParams,
    template: Option<Vec<u8>>,
}

impl BuildSetup {
    fn resolve(params: &BuildIndexParams, source: &dyn VectorSource) -> Self {
        let mut effective = params.params.clone();
        match &params.quantizer {
            Some(quantizer) => {
                let state = quantizer.state();
                effective.data_type = state.data_type;
                Self {
                    dimensions: state.dimensions,
                    bytes_per_vector: state.bytes_per_vector,
                    effective,
                    template: params.template.clone().or_else(|| state.template.clone()),
                }
            }
            None => Self {
                dimensions: source.dimension(),
                bytes_per_vector: source.bytes_per_vector(),
                effective,
                template: params.template.clone(),
            },
        }
    }
}

/// How vectors reach the native library during a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStrategy {
    /// Transfer every vector off-heap, then build in one native call.
    Bulk,
    /// Pre-size the index, then insert bounded batches.
    Streaming,
}

impl BuildStrategy {
    /// Pick the strategy for an engine. Template builds and engines without
    /// incremental support always take the bulk path.
    pub fn select(engine: KnnEngine, has_template: bool) -> Self {
        if has_template || !engine.supports_incremental_build() {
            BuildStrategy::Bulk
        } else {
            BuildStrategy::Streaming
        }
    }

    /// Build the index described by `params` from `source` and serialize it
    /// to `params.index_path` (without the integrity footer).
    ///
    /// The source must already be initialized. `streaming_limit_bytes`
    /// bounds off-heap staging memory on the streaming path and sizes the
    /// transfer batches on both paths.
    ///
    /// # Errors
    ///
    /// Returns [`KnnError::BuildAborted`] if `cancel` fires, and
    /// [`KnnError::IndexBuildFailed`] for native build failures.
    pub fn build_and_write(
        &self,
        params: &BuildIndexParams,
        source: &mut dyn VectorSource,
        streaming_limit_bytes: u64,
        cancel: &CancelToken,
    ) -> KnnResult<()> {
        let setup = BuildSetup::resolve(params, source);
        debug!(
            field = %params.field_name,
            strategy = ?self,
            engine = params.engine.name(),
            docs = source.total_live_docs(),
            dimensions = setup.dimensions,
            "starting native index build"
        );
        match self {
            BuildStrategy::Bulk => Self::build_bulk(params, source, &setup, streaming_limit_bytes, cancel),
            BuildStrategy::Streaming => {
                Self::build_streaming(params, source, &setup, streaming_limit_bytes, cancel)
            }
        }
    }

    fn build_bulk(
        params: &BuildIndexParams,
        source: &mut dyn VectorSource,
        setup: &BuildSetup,
        limit_bytes: u64,
        cancel: &CancelToken,
    ) -> KnnResult<()> {
        let mut transfer = OffHeapVectorTransfer::new(setup.bytes_per_vector, limit_bytes);
        let mut ids = Vec::with_capacity(source.total_live_docs());
        let mut scratch = Vec::new();

        while let Some(doc_id) = source.doc_id() {
            if cancel.is_cancelled() {
                return Err(aborted(&params.field_name));
            }
            ids.push(doc_id);
            let row = encode(params.quantizer.as_deref(), source.vector(), &mut scratch)?;
            transfer.transfer(row, true)?;
            source.next_doc()?;
        }
        transfer.flush(true)?;

        if cancel.is_cancelled() {
            return Err(aborted(&params.field_name));
        }

        // SAFETY: the buffer is owned by `transfer`, holds exactly
        // `ids.len()` vectors, and nothing else touches it.
        let result = unsafe {
            match &setup.template {
                Some(template) => raw::create_index_from_template(
                    &ids,
                    transfer.vector_address(),
                    setup.dimensions,
                    params.engine,
                    &params.index_path,
                    &setup.effective,
                    template,
                ),
                None => raw::create_index(
                    &ids,
                    transfer.vector_address(),
                    setup.dimensions,
                    params.engine,
                    &params.index_path,
                    &setup.effective,
                ),
            }
        };
        result.map_err(|e| build_failed(&params.field_name, e))?;

        info!(field = %params.field_name, docs = ids.len(), "bulk index build complete");
        Ok(())
    }

    fn build_streaming(
        params: &BuildIndexParams,
        source: &mut dyn VectorSource,
        setup: &BuildSetup,
        limit_bytes: u64,
        cancel: &CancelToken,
    ) -> KnnResult<()> {
        let mut transfer = OffHeapVectorTransfer::new(setup.bytes_per_vector, limit_bytes);
        let handle = raw::init_index_from_scratch(
            source.total_live_docs(),
            setup.dimensions,
            params.engine,
            &setup.effective,
        )
        .map_err(|e| build_failed(&params.field_name, e))?;

        match Self::stream_batches(params, source, setup, &mut transfer, handle, cancel) {
            Ok(docs) => {
                // SAFETY: the handle is live and consumed exactly here.
                unsafe { raw::write_index(&params.index_path, handle) }
                    .map_err(|e| build_failed(&params.field_name, e))?;
                info!(field = %params.field_name, docs, "streaming index build complete");
                Ok(())
            }
            Err(e) => {
                // SAFETY: the handle is live and was not consumed.
                unsafe { raw::free_index(handle) };
                Err(e)
            }
        }
    }

    fn stream_batches(
        params: &BuildIndexParams,
        source: &mut dyn VectorSource,
        setup: &BuildSetup,
        transfer: &mut OffHeapVectorTransfer,
        handle: usize,
        cancel: &CancelToken,
    ) -> KnnResult<usize> {
        let mut ids: Vec<i32> = Vec::with_capacity(transfer.transfer_limit());
        let mut scratch = Vec::new();
        let mut docs = 0usize;

        while let Some(doc_id) = source.doc_id() {
            if cancel.is_cancelled() {
                return Err(aborted(&params.field_name));
            }
            ids.push(doc_id);
            let row = encode(params.quantizer.as_deref(), source.vector(), &mut scratch)?;
            if transfer.transfer(row, false)? {
                // SAFETY: the buffer holds exactly `ids.len()` vectors and
                // the handle is live.
                unsafe {
                    raw::insert_to_index(&ids, transfer.vector_address(), setup.dimensions, handle)
                }
                .map_err(|e| build_failed(&params.field_name, e))?;
                docs += ids.len();
                ids.clear();
            }
            source.next_doc()?;
        }

        if transfer.flush(false)? {
            if cancel.is_cancelled() {
                return Err(aborted(&params.field_name));
            }
            // SAFETY: same contract as the in-loop insert.
            unsafe {
                raw::insert_to_index(&ids, transfer.vector_address(), setup.dimensions, handle)
            }
            .map_err(|e| build_failed(&params.field_name, e))?;
            docs += ids.len();
        }
        Ok(docs)
    }
}

fn encode<'a>(
    quantizer: Option<&dyn Quantizer>,
    vector: &'a [u8],
    scratch: &'a mut Vec<u8>,
) -> KnnResult<&'a [u8]> {
    match quantizer {
        Some(quantizer) => {
            quantizer.quantize(vector, scratch)?;
            Ok(scratch.as_slice())
        }
        None => Ok(vector),
    }
}

fn aborted(field: &str) -> KnnError {
    KnnError::BuildAborted {
        field: field.to_string(),
    }
}

fn build_failed(field: &str, err: KnnError) -> KnnError {
    match err {
        aborted @ KnnError::BuildAborted { .. } => aborted,
        other => KnnError::IndexBuildFailed {
            field: field.to_string(),
            cause: other.to_string(),
        },
    }
}
