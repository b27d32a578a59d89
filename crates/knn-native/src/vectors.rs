//! Cursor-style access to the vectors of a segment field.

use crate::engine::VectorDataType;
use crate::error::{KnnError, KnnResult};

/// Forward-only cursor over the live vectors of a field.
///
/// Callers must invoke [`VectorSource::init`] before reading; it positions
/// the cursor on the first document and makes dimension and doc counts
/// available. [`VectorSource::doc_id`] returns `None` once the cursor is
/// exhausted.
pub trait VectorSource {
    /// Position the cursor on the first live document.
    fn init(&mut self) -> KnnResult<()>;

    /// Vector dimensionality (bits for binary vectors).
    fn dimension(&self) -> usize;

    fn data_type(&self) -> VectorDataType;

    /// Bytes occupied by one packed vector.
    fn bytes_per_vector(&self) -> usize {
        self.data_type().bytes_per_vector(self.dimension())
    }

    /// Total number of live documents this source will yield.
    fn total_live_docs(&self) -> usize;

    /// Id of the current document, or `None` when the cursor is exhausted.
    fn doc_id(&self) -> Option<i32>;

    /// Packed bytes of the current document's vector.
    fn vector(&self) -> &[u8];

    /// Advance to the next live document.
    fn next_doc(&mut self) -> KnnResult<()>;
}

/// In-memory [`VectorSource`] over pre-packed `(doc id, vector)` pairs.
#[derive(Debug)]
pub struct SliceVectorSource {
    data_type: VectorDataType,
    dimension: usize,
    docs: Vec<(i32, Vec<u8>)>,
    cursor: usize,
    initialized: bool,
}

impl SliceVectorSource {
    /// Build a source from packed byte vectors.
    ///
    /// # Errors
    ///
    /// Returns [`KnnError::DimensionMismatch`] if any vector's length does
    /// not match the packed size implied by `data_type` and `dimension`.
    pub fn new(
        data_type: VectorDataType,
        dimension: usize,
        docs: Vec<(i32, Vec<u8>)>,
    ) -> KnnResult<Self> {
        let expected = data_type.bytes_per_vector(dimension);
        for (_, vector) in &docs {
            if vector.len() != expected {
                return Err(KnnError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }
        Ok(Self {
            data_type,
            dimension,
            docs,
            cursor: 0,
            initialized: false,
        })
    }

    /// Build a float source, packing each vector little-endian.
    pub fn from_floats(dimension: usize, docs: Vec<(i32, Vec<f32>)>) -> KnnResult<Self> {
        let packed = docs
            .into_iter()
            .map(|(id, values)| {
                let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                (id, bytes)
            })
            .collect();
        Self::new(VectorDataType::Float, dimension, packed)
    }
}

impl VectorSource for SliceVectorSource {
    fn init(&mut self) -> KnnResult<()> {
        self.cursor = 0;
        self.initialized = true;
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn data_type(&self) -> VectorDataType {
        self.data_type
    }

    fn total_live_docs(&self) -> usize {
        self.docs.len()
    }

    fn doc_id(&self) -> Option<i32> {
        if !self.initialized {
            return None;
        }
        self.docs.get(self.cursor).map(|(id, _)| *id)
    }

    fn vector(&self) -> &[u8] {
        &self.docs[self.cursor].1
    }

    fn next_doc(&mut self) -> KnnResult<()> {
        self.cursor += 1;
        Ok(())
    }
}
