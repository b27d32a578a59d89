//! Remote index builds with local fallback.
//!
//! When a remote build service is configured, index construction is
//! delegated to it; any failure falls back to the local strategy so a
//! flaky service never fails a merge.

use std::sync::Arc;

use tracing::warn;

use crate::build::params::BuildIndexParams;
use crate::build::strategy::{BuildStrategy, CancelToken};
use crate::error::KnnResult;
use crate::vectors::VectorSource;

/// Client for a service that builds index files out of process. The service
/// reads vectors from shared storage and writes the finished index to
/// `params.index_path`; the local vector source is never consumed.
pub trait RemoteIndexClient: Send + Sync {
    /// Request a remote build of the index described by `params`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::KnnError::RemoteBuildFailed`] (or any other
    /// error) to trigger local fallback.
    fn build_index(&self, params: &BuildIndexParams, total_live_docs: usize) -> KnnResult<()>;
}

/// Tries the remote service first and falls back to a local strategy.
pub struct RemoteBuildStrategy {
    client: Arc<dyn RemoteIndexClient>,
    fallback: BuildStrategy,
}

impl RemoteBuildStrategy {
    pub fn new(client: Arc<dyn RemoteIndexClient>, fallback: BuildStrategy) -> Self {
        Self { client, fallback }
    }

    /// Build via the remote service, falling back to the local strategy on
    /// any remote error. Same contract as
    /// [`BuildStrategy::build_and_write`].
    pub fn build_and_write(
        &self,
        params: &BuildIndexParams,
        source: &mut dyn VectorSource,
        streaming_limit_bytes: u64,
        cancel: &CancelToken,
    ) -> KnnResult<()> {
        match self.client.build_index(params, source.total_live_docs()) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    field = %params.field_name,
                    error = %e,
                    "remote index build failed, falling back to local build"
                );
                self.fallback
                    .build_and_write(params, source, streaming_limit_bytes, cancel)
            }
        }
    }
}
