//! In-process native index runtime.
//!
//! This module owns the heap objects behind the raw addresses handed out by
//! [`crate::native::raw`]: indexes under construction, loaded indexes,
//! staged vector buffers, and shared per-model state. Objects are allocated
//! with `Box::into_raw` and released with `Box::from_raw`; every allocation
//! and free updates a live-object counter so leak checks stay cheap.
//!
//! Indexes are serialized in a versioned little-endian layout. The integrity
//! footer appended by the index writer lives *after* the serialized body and
//! is ignored here; the body is self-delimiting.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::trace;

use crate::engine::{KnnEngine, SpaceType, VectorDataType};
use crate::error::{KnnError, KnnResult};

const INDEX_MAGIC: u32 = 0x4B4E_4E58;
const INDEX_VERSION: u16 = 1;

/// Count of live native objects (indexes, vector buffers, shared states).
static LIVE_OBJECTS: AtomicI64 = AtomicI64::new(0);

pub(crate) fn object_allocated() {
    LIVE_OBJECTS.fetch_add(1, Ordering::AcqRel);
}

pub(crate) fn object_freed() {
    LIVE_OBJECTS.fetch_sub(1, Ordering::AcqRel);
}

/// Number of native objects currently allocated and not yet freed.
pub(crate) fn live_objects() -> i64 {
    LIVE_OBJECTS.load(Ordering::Acquire)
}

/// Staging buffer for vectors in flight to an index: callers accumulate
/// batches here, then hand the address to an index operation.
pub(crate) struct NativeVectorBuffer {
    pub(crate) data: Vec<u8>,
}

impl NativeVectorBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }
}

/// Shared read-only state derived from a trained model, attached to every
/// index built from that model.
pub(crate) struct SharedState {
    pub(crate) table: Vec<u8>,
}

/// A native index, either under construction or fully loaded.
pub(crate) struct NativeIndex {
    pub(crate) engine: KnnEngine,
    pub(crate) space: SpaceType,
    pub(crate) data_type: VectorDataType,
    pub(crate) dimension: usize,
    pub(crate) ids: Vec<i32>,
    /// Row-major packed vectors, `bytes_per_vector` each.
    pub(crate) vectors: Vec<u8>,
    /// Trained model blob for template-built indexes.
    pub(crate) template: Option<Vec<u8>>,
    /// Address of an attached [`SharedState`], or 0. The index does not own
    /// the shared state.
    pub(crate) shared_state_address: usize,
}

impl NativeIndex {
    pub(crate) fn new(
        engine: KnnEngine,
        space: SpaceType,
        data_type: VectorDataType,
        dimension: usize,
    ) -> Self {
        Self {
            engine,
            space,
            data_type,
            dimension,
            ids: Vec::new(),
            vectors: Vec::new(),
            template: None,
            shared_state_address: 0,
        }
    }

    pub(crate) fn bytes_per_vector(&self) -> usize {
        self.data_type.bytes_per_vector(self.dimension)
    }

    /// Append `count` vectors from a packed byte slice.
    pub(crate) fn append_rows(&mut self, ids: &[i32], rows: &[u8]) -> KnnResult<()> {
        let bpv = self.bytes_per_vector();
        let expected = ids.len() * bpv;
        if rows.len() != expected {
            return Err(KnnError::DimensionMismatch {
                expected,
                actual: rows.len(),
            });
        }
        self.ids.extend_from_slice(ids);
        self.vectors.extend_from_slice(rows);
        trace!(count = ids.len(), total = self.ids.len(), "appended rows");
        Ok(())
    }

    pub(crate) fn reserve(&mut self, count: usize) {
        self.ids.reserve(count);
        self.vectors.reserve(count * self.bytes_per_vector());
    }

    /// Serialize the index body to `path`, truncating any existing file.
    pub(crate) fn write_to(&self, path: &Path) -> KnnResult<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);

        w.write_u32::<LittleEndian>(INDEX_MAGIC)?;
        w.write_u16::<LittleEndian>(INDEX_VERSION)?;
        w.write_u8(engine_tag(self.engine))?;
        w.write_u8(space_tag(self.space))?;
        w.write_u8(data_type_tag(self.data_type))?;
        w.write_u32::<LittleEndian>(field_as_u32("dimension", self.dimension)?)?;
        w.write_u32::<LittleEndian>(field_as_u32("vector count", self.ids.len())?)?;

        match &self.template {
            Some(template) => {
                w.write_u32::<LittleEndian>(field_as_u32("template length", template.len())?)?;
                w.write_all(template)?;
            }
            None => w.write_u32::<LittleEndian>(0)?,
        }

        for id in &self.ids {
            w.write_i32::<LittleEndian>(*id)?;
        }
        w.write_all(&self.vectors)?;
        w.flush()?;
        Ok(())
    }

    /// Deserialize an index body from `path`. Trailing bytes (the integrity
    /// footer) are left unread.
    pub(crate) fn read_from(path: &Path) -> KnnResult<Self> {
        let load_err = |cause: String| KnnError::IndexLoadFailed {
            path: path.display().to_string(),
            cause,
        };

        let file = File::open(path)?;
        let mut r = BufReader::new(file);

        let magic = r.read_u32::<LittleEndian>()?;
        if magic != INDEX_MAGIC {
            return Err(load_err(format!("bad magic {magic:#010x}")));
        }
        let version = r.read_u16::<LittleEndian>()?;
        if version != INDEX_VERSION {
            return Err(load_err(format!("unsupported version {version}")));
        }

        let engine = engine_from_tag(r.read_u8()?).ok_or_else(|| load_err("bad engine tag".into()))?;
        let space = space_from_tag(r.read_u8()?).ok_or_else(|| load_err("bad space tag".into()))?;
        let data_type =
            data_type_from_tag(r.read_u8()?).ok_or_else(|| load_err("bad data type tag".into()))?;
        let dimension = r.read_u32::<LittleEndian>()? as usize;
        let count = r.read_u32::<LittleEndian>()? as usize;

        let template_len = r.read_u32::<LittleEndian>()? as usize;
        let template = if template_len > 0 {
            let mut buf = vec![0u8; template_len];
            r.read_exact(&mut buf)?;
            Some(buf)
        } else {
            None
        };

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(r.read_i32::<LittleEndian>()?);
        }

        let bpv = data_type.bytes_per_vector(dimension);
        let mut vectors = vec![0u8; count * bpv];
        r.read_exact(&mut vectors)?;

        Ok(Self {
            engine,
            space,
            data_type,
            dimension,
            ids,
            vectors,
            template,
            shared_state_address: 0,
        })
    }

    /// Exact scan over all stored vectors, returning the `k` closest.
    pub(crate) fn search(&self, query: &[u8], k: usize) -> KnnResult<Vec<(i32, f32)>> {
        let bpv = self.bytes_per_vector();
        if query.len() != bpv {
            return Err(KnnError::DimensionMismatch {
                expected: bpv,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(i32, f32)> = self
            .ids
            .iter()
            .zip(self.vectors.chunks_exact(bpv))
            .map(|(id, row)| (*id, self.distance(query, row)))
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Distance between two packed rows. Lower is closer; inner product is
    /// negated so one ordering applies to every space.
    fn distance(&self, a: &[u8], b: &[u8]) -> f32 {
        match (self.data_type, self.space) {
            (VectorDataType::Float, SpaceType::L2) => {
                float_pairs(a, b).map(|(x, y)| (x - y) * (x - y)).sum()
            }
            (VectorDataType::Float, SpaceType::InnerProduct) => {
                -float_pairs(a, b).map(|(x, y)| x * y).sum::<f32>()
            }
            (VectorDataType::Byte, SpaceType::L2) => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| {
                    let d = (*x as i8 as f32) - (*y as i8 as f32);
                    d * d
                })
                .sum(),
            (VectorDataType::Byte, SpaceType::InnerProduct) => -a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (*x as i8 as f32) * (*y as i8 as f32))
                .sum::<f32>(),
            (_, SpaceType::Hamming) | (VectorDataType::Binary, _) => a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (x ^ y).count_ones() as f32)
                .sum(),
        }
    }
}

/// Serialized index fields are fixed at 32 bits.
fn field_as_u32(what: &str, value: usize) -> KnnResult<u32> {
    u32::try_from(value).map_err(|_| KnnError::Native(format!("{what} {value} exceeds u32 range")))
}

fn float_pairs<'a>(a: &'a [u8], b: &'a [u8]) -> impl Iterator<Item = (f32, f32)> + 'a {
    a.chunks_exact(4).zip(b.chunks_exact(4)).map(|(x, y)| {
        (
            f32::from_le_bytes([x[0], x[1], x[2], x[3]]),
            f32::from_le_bytes([y[0], y[1], y[2], y[3]]),
        )
    })
}

fn engine_tag(engine: KnnEngine) -> u8 {
    match engine {
        KnnEngine::Hnsw => 0,
        KnnEngine::Ivf => 1,
    }
}

fn engine_from_tag(tag: u8) -> Option<KnnEngine> {
    match tag {
        0 => Some(KnnEngine::Hnsw),
        1 => Some(KnnEngine::Ivf),
        _ => None,
    }
}

fn space_tag(space: SpaceType) -> u8 {
    match space {
        SpaceType::L2 => 0,
        SpaceType::InnerProduct => 1,
        SpaceType::Hamming => 2,
    }
}

fn space_from_tag(tag: u8) -> Option<SpaceType> {
    match tag {
        0 => Some(SpaceType::L2),
        1 => Some(SpaceType::InnerProduct),
        2 => Some(SpaceType::Hamming),
        _ => None,
    }
}

fn data_type_tag(data_type: VectorDataType) -> u8 {
    match data_type {
        VectorDataType::Float => 0,
        VectorDataType::Byte => 1,
        VectorDataType::Binary => 2,
    }
}

fn data_type_from_tag(tag: u8) -> Option<VectorDataType> {
    match tag {
        0 => Some(VectorDataType::Float),
        1 => Some(VectorDataType::Byte),
        2 => Some(VectorDataType::Binary),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pack_floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn serialize_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.hnsw");

        let mut index = NativeIndex::new(KnnEngine::Hnsw, SpaceType::L2, VectorDataType::Float, 2);
        index
            .append_rows(&[7, 9], &pack_floats(&[1.0, 2.0, 3.0, 4.0]))
            .unwrap();
        index.write_to(&path).unwrap();

        let loaded = NativeIndex::read_from(&path).unwrap();
        assert_eq!(loaded.dimension, 2);
        assert_eq!(loaded.ids, vec![7, 9]);
        assert_eq!(loaded.vectors, index.vectors);
        assert!(loaded.template.is_none());
    }

    #[test]
    fn template_survives_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.ivf");

        let mut index = NativeIndex::new(KnnEngine::Ivf, SpaceType::L2, VectorDataType::Float, 1);
        index.template = Some(b"trained-model".to_vec());
        index.append_rows(&[1], &pack_floats(&[0.5])).unwrap();
        index.write_to(&path).unwrap();

        let loaded = NativeIndex::read_from(&path).unwrap();
        assert_eq!(loaded.template.as_deref(), Some(b"trained-model".as_ref()));
    }

    #[test]
    fn write_rejects_dimension_beyond_u32() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oversized");

        let index = NativeIndex::new(
            KnnEngine::Hnsw,
            SpaceType::L2,
            VectorDataType::Float,
            u32::MAX as usize + 1,
        );
        assert!(matches!(
            index.write_to(&path),
            Err(KnnError::Native(_))
        ));
    }

    #[test]
    fn read_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, b"not an index file at all").unwrap();
        assert!(matches!(
            NativeIndex::read_from(&path),
            Err(KnnError::IndexLoadFailed { .. })
        ));
    }

    #[test]
    fn append_rejects_wrong_row_length() {
        let mut index = NativeIndex::new(KnnEngine::Hnsw, SpaceType::L2, VectorDataType::Float, 4);
        let err = index.append_rows(&[1], &[0u8; 3]).unwrap_err();
        assert!(matches!(err, KnnError::DimensionMismatch { .. }));
    }

    #[test]
    fn l2_search_orders_by_distance() {
        let mut index = NativeIndex::new(KnnEngine::Hnsw, SpaceType::L2, VectorDataType::Float, 2);
        index
            .append_rows(
                &[1, 2, 3],
                &pack_floats(&[0.0, 0.0, 5.0, 5.0, 1.0, 1.0]),
            )
            .unwrap();

        let hits = index.search(&pack_floats(&[0.9, 0.9]), 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 3);
        assert_eq!(hits[1].0, 1);
    }

    #[test]
    fn inner_product_prefers_larger_dot() {
        let mut index =
            NativeIndex::new(KnnEngine::Hnsw, SpaceType::InnerProduct, VectorDataType::Float, 2);
        index
            .append_rows(&[1, 2], &pack_floats(&[1.0, 0.0, 10.0, 0.0]))
            .unwrap();

        let hits = index.search(&pack_floats(&[1.0, 0.0]), 1).unwrap();
        assert_eq!(hits[0].0, 2);
    }

    #[test]
    fn hamming_search_over_packed_bits() {
        let mut index =
            NativeIndex::new(KnnEngine::Hnsw, SpaceType::Hamming, VectorDataType::Binary, 16);
        index.append_rows(&[1, 2], &[0b1111_0000, 0b0000_0000, 0b1111_1111, 0b1111_1111]).unwrap();

        let hits = index.search(&[0b1111_1110, 0b1111_1111], 1).unwrap();
        assert_eq!(hits[0].0, 2);
    }

    #[test]
    fn search_rejects_wrong_query_length() {
        let index = NativeIndex::new(KnnEngine::Hnsw, SpaceType::L2, VectorDataType::Float, 3);
        assert!(matches!(
            index.search(&[0u8; 4], 1),
            Err(KnnError::DimensionMismatch { .. })
        ));
    }
}
