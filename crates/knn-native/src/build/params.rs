//! Parameters handed to the native library for an index build.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::engine::{KnnEngine, SpaceType, VectorDataType};
use crate::quantize::Quantizer;

/// Knobs forwarded to the native library when constructing an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexParams {
    pub space_type: SpaceType,
    pub data_type: VectorDataType,
    /// Graph degree for incremental engines.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Partition count for inverted-list engines.
    pub nlist: usize,
    /// Native threads used during construction; the writer overrides this
    /// from its build configuration.
    pub index_thread_qty: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            space_type: SpaceType::L2,
            data_type: VectorDataType::Float,
            m: 16,
            ef_construction: 100,
            ef_search: 100,
            nlist: 4,
            index_thread_qty: 1,
        }
    }
}

/// Everything a build strategy needs to construct one field's index.
#[derive(Clone)]
pub struct BuildIndexParams {
    /// Field the index is built for; used in errors and logs.
    pub field_name: String,
    pub engine: KnnEngine,
    /// Destination file for the serialized index.
    pub index_path: PathBuf,
    pub params: IndexParams,
    /// Optional encoder applied to every vector before staging.
    pub quantizer: Option<Arc<dyn Quantizer>>,
    /// Trained model blob; forces a template build when present.
    pub template: Option<Vec<u8>>,
}

impl BuildIndexParams {
    pub fn new(
        field_name: impl Into<String>,
        engine: KnnEngine,
        index_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            engine,
            index_path: index_path.into(),
            params: IndexParams::default(),
            quantizer: None,
            template: None,
        }
    }

    pub fn with_params(mut self, params: IndexParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_quantizer(mut self, quantizer: Arc<dyn Quantizer>) -> Self {
        self.quantizer = Some(quantizer);
        self
    }

    pub fn with_template(mut self, template: Vec<u8>) -> Self {
        self.template = Some(template);
        self
    }
}
