//! Engine, space, and vector data type enumerations.
//!
//! These mirror the knobs exposed to index configuration: which native
//! engine builds the index, which distance function it uses, and how raw
//! vectors are laid out in memory.

use serde::{Deserialize, Serialize};

/// Native engine responsible for building and serving an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnnEngine {
    /// Graph-based index built by inserting vectors one batch at a time.
    Hnsw,
    /// Inverted-list index built in one shot, optionally from a trained
    /// template.
    Ivf,
}

impl KnnEngine {
    /// Whether the engine can grow an index incrementally after an initial
    /// capacity reservation. Engines that cannot must receive all vectors
    /// up front.
    pub fn supports_incremental_build(&self) -> bool {
        matches!(self, KnnEngine::Hnsw)
    }

    /// File extension used for indexes produced by this engine.
    pub fn extension(&self) -> &'static str {
        match self {
            KnnEngine::Hnsw => "hnsw",
            KnnEngine::Ivf => "ivf",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KnnEngine::Hnsw => "hnsw",
            KnnEngine::Ivf => "ivf",
        }
    }
}

/// Distance function applied between vectors at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceType {
    /// Squared Euclidean distance, lower is closer.
    L2,
    /// Inner product similarity, higher is closer.
    InnerProduct,
    /// Bit-level Hamming distance over packed binary vectors.
    Hamming,
}

/// Element layout of the vectors stored in an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorDataType {
    /// 32-bit IEEE floats, 4 bytes per dimension.
    Float,
    /// Signed 8-bit integers, 1 byte per dimension.
    Byte,
    /// Packed bits, 1 byte per 8 dimensions.
    Binary,
}

impl VectorDataType {
    /// Number of bytes one vector of `dimension` elements occupies.
    ///
    /// For [`VectorDataType::Binary`] the dimension counts bits and must be
    /// a multiple of 8.
    pub fn bytes_per_vector(&self, dimension: usize) -> usize {
        match self {
            VectorDataType::Float => dimension * 4,
            VectorDataType::Byte => dimension,
            VectorDataType::Binary => dimension / 8,
        }
    }
}

/// Canonical file name for a field's engine index within a segment.
pub fn engine_file_name(segment_name: &str, field_name: &str, engine: KnnEngine) -> String {
    format!("{segment_name}_{field_name}.{}", engine.extension())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_vector_by_type() {
        assert_eq!(VectorDataType::Float.bytes_per_vector(128), 512);
        assert_eq!(VectorDataType::Byte.bytes_per_vector(128), 128);
        assert_eq!(VectorDataType::Binary.bytes_per_vector(128), 16);
    }

    #[test]
    fn incremental_support() {
        assert!(KnnEngine::Hnsw.supports_incremental_build());
        assert!(!KnnEngine::Ivf.supports_incremental_build());
    }

    #[test]
    fn engine_file_names() {
        assert_eq!(
            engine_file_name("_0", "embedding", KnnEngine::Hnsw),
            "_0_embedding.hnsw"
        );
    }
}
