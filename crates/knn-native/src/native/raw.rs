//! Raw address-based interface to the native index library.
//!
//! Every function in this module traffics in `usize` addresses of native
//! objects, mirroring a foreign function boundary: the caller owns the
//! lifecycle and must pair each allocation with exactly one free. Safe
//! wrappers live in [`crate::memory::allocation`] and
//! [`crate::transfer`]; nothing outside those modules should hold a raw
//! address for longer than a call.
//!
//! Ownership rules:
//! - Vector buffers created by [`store_vector_data`] are freed by
//!   [`free_vector_data`]; index operations only read from them.
//! - Build handles from [`init_index_from_scratch`] are consumed by
//!   [`write_index`], or freed with [`free_index`] on an aborted build.
//! - Loaded indexes from [`load_index`] are freed with [`free_index`].
//! - Shared state from [`init_shared_index_state`] is freed with
//!   [`free_shared_index_state`]; indexes reference it without owning it.

use std::path::Path;

use crate::build::params::IndexParams;
use crate::engine::KnnEngine;
use crate::error::{KnnError, KnnResult};
use crate::native::library::{self, NativeIndex, NativeVectorBuffer, SharedState};

/// A single search result: document id and distance (lower is closer; inner
/// product distances are negated dot products).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: i32,
    pub score: f32,
}

/// Number of native objects currently allocated. Balances to zero when every
/// index, buffer, and shared state has been freed.
pub fn live_native_objects() -> i64 {
    library::live_objects()
}

/// Build a complete index from a staged vector buffer and serialize it to
/// `path`. The buffer is not consumed.
///
/// # Safety
///
/// `vector_address` must be a live address returned by [`store_vector_data`]
/// holding exactly `ids.len()` vectors, with no concurrent mutation.
pub unsafe fn create_index(
    ids: &[i32],
    vector_address: usize,
    dimension: usize,
    engine: KnnEngine,
    path: &Path,
    params: &IndexParams,
) -> KnnResult<()> {
    let buffer = &*(vector_address as *const NativeVectorBuffer);
    let mut index = NativeIndex::new(engine, params.space_type, params.data_type, dimension);
    index.append_rows(ids, &buffer.data)?;
    index.write_to(path)
}

/// Build an index from a trained model template plus a staged vector buffer,
/// and serialize it to `path`. The buffer is not consumed.
///
/// # Safety
///
/// Same contract as [`create_index`].
pub unsafe fn create_index_from_template(
    ids: &[i32],
    vector_address: usize,
    dimension: usize,
    engine: KnnEngine,
    path: &Path,
    params: &IndexParams,
    template: &[u8],
) -> KnnResult<()> {
    let buffer = &*(vector_address as *const NativeVectorBuffer);
    let mut index = NativeIndex::new(engine, params.space_type, params.data_type, dimension);
    index.template = Some(template.to_vec());
    index.append_rows(ids, &buffer.data)?;
    index.write_to(path)
}

/// Allocate an empty index sized for `count` vectors and return its build
/// handle. Only engines that support incremental builds accept subsequent
/// [`insert_to_index`] calls.
///
/// # Errors
///
/// Returns [`KnnError::Native`] if the engine cannot build incrementally.
pub fn init_index_from_scratch(
    count: usize,
    dimension: usize,
    engine: KnnEngine,
    params: &IndexParams,
) -> KnnResult<usize> {
    if !engine.supports_incremental_build() {
        return Err(KnnError::Native(format!(
            "engine '{}' does not support incremental builds",
            engine.name()
        )));
    }
    let mut index = NativeIndex::new(engine, params.space_type, params.data_type, dimension);
    index.reserve(count);
    library::object_allocated();
    Ok(Box::into_raw(Box::new(index)) as usize)
}

/// Append a batch of vectors from a staged buffer to an index under
/// construction. The buffer is not consumed and may be refilled for the
/// next batch.
///
/// # Safety
///
/// `vector_address` must hold exactly `ids.len()` vectors and
/// `index_handle` must be a live handle from [`init_index_from_scratch`],
/// with no concurrent access to either.
pub unsafe fn insert_to_index(
    ids: &[i32],
    vector_address: usize,
    _dimension: usize,
    index_handle: usize,
) -> KnnResult<()> {
    let buffer = &*(vector_address as *const NativeVectorBuffer);
    let index = &mut *(index_handle as *mut NativeIndex);
    index.append_rows(ids, &buffer.data)
}

/// Serialize an index under construction to `path` and free its handle.
/// The handle is consumed even when serialization fails.
///
/// # Safety
///
/// `index_handle` must be a live handle from [`init_index_from_scratch`]
/// that no other thread is using; it is invalid after this call.
pub unsafe fn write_index(path: &Path, index_handle: usize) -> KnnResult<()> {
    let index = Box::from_raw(index_handle as *mut NativeIndex);
    library::object_freed();
    index.write_to(path)
}

/// Deserialize an index from `path` into native memory and return its
/// address. Pair with [`free_index`].
pub fn load_index(path: &Path) -> KnnResult<usize> {
    let index = NativeIndex::read_from(path)?;
    library::object_allocated();
    Ok(Box::into_raw(Box::new(index)) as usize)
}

/// Run a k-nearest-neighbor query against a loaded index.
///
/// # Safety
///
/// `index_address` must be a live address from [`load_index`]. Concurrent
/// queries are safe; concurrent frees are not.
pub unsafe fn query_index(index_address: usize, query: &[u8], k: usize) -> KnnResult<Vec<Neighbor>> {
    let index = &*(index_address as *const NativeIndex);
    let hits = index.search(query, k)?;
    Ok(hits
        .into_iter()
        .map(|(id, score)| Neighbor { id, score })
        .collect())
}

/// Release a loaded index or an aborted build handle.
///
/// # Safety
///
/// `index_address` must be a live address from [`load_index`] or
/// [`init_index_from_scratch`], freed exactly once, with no other thread
/// using it.
pub unsafe fn free_index(index_address: usize) {
    drop(Box::from_raw(index_address as *mut NativeIndex));
    library::object_freed();
}

/// Derive shareable model state from a loaded template-built index. The
/// returned address is independent of the index and must be released with
/// [`free_shared_index_state`].
///
/// # Safety
///
/// `index_address` must be a live address from [`load_index`].
///
/// # Errors
///
/// Returns [`KnnError::Native`] if the index was not built from a template.
pub unsafe fn init_shared_index_state(index_address: usize) -> KnnResult<usize> {
    let index = &*(index_address as *const NativeIndex);
    let template = index
        .template
        .as_ref()
        .ok_or_else(|| KnnError::Native("index has no model template to share".into()))?;
    let state = SharedState {
        table: template.clone(),
    };
    library::object_allocated();
    Ok(Box::into_raw(Box::new(state)) as usize)
}

/// Size in bytes of the model table held by a shared state.
///
/// # Safety
///
/// `shared_address` must be a live address from [`init_shared_index_state`].
pub unsafe fn shared_index_state_size(shared_address: usize) -> usize {
    let state = &*(shared_address as *const SharedState);
    state.table.len()
}

/// Point a loaded index at shared model state. Called once, immediately
/// after load, before the index is visible to other threads.
///
/// # Safety
///
/// Both addresses must be live; `shared_address` must outlive the index's
/// use of it.
pub unsafe fn set_shared_index_state(index_address: usize, shared_address: usize) {
    let index = &mut *(index_address as *mut NativeIndex);
    index.shared_state_address = shared_address;
}

/// Release shared model state once no index references it.
///
/// # Safety
///
/// `shared_address` must be a live address from [`init_shared_index_state`],
/// freed exactly once, after every index attached to it has been freed.
pub unsafe fn free_shared_index_state(shared_address: usize) {
    drop(Box::from_raw(shared_address as *mut SharedState));
    library::object_freed();
}

/// Copy a batch of packed vector bytes into a native staging buffer.
///
/// With `address == 0` a new buffer is allocated with `initial_capacity`
/// bytes reserved and its address returned. Otherwise the existing buffer
/// is reused: appended to when `append` is true, overwritten from the start
/// when false. The returned address is stable across reuse.
///
/// # Safety
///
/// A non-zero `address` must be a live address from a previous call, with
/// no concurrent access.
pub unsafe fn store_vector_data(
    address: usize,
    data: &[u8],
    initial_capacity: usize,
    append: bool,
) -> usize {
    if address == 0 {
        let mut buffer = NativeVectorBuffer::with_capacity(initial_capacity);
        buffer.data.extend_from_slice(data);
        library::object_allocated();
        return Box::into_raw(Box::new(buffer)) as usize;
    }
    let buffer = &mut *(address as *mut NativeVectorBuffer);
    if !append {
        buffer.data.clear();
    }
    buffer.data.extend_from_slice(data);
    address
}

/// Release a staging buffer.
///
/// # Safety
///
/// `address` must be a live address from [`store_vector_data`], freed
/// exactly once.
pub unsafe fn free_vector_data(address: usize) {
    drop(Box::from_raw(address as *mut NativeVectorBuffer));
    library::object_freed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SpaceType, VectorDataType};
    use tempfile::tempdir;

    fn pack_floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn float_params() -> IndexParams {
        IndexParams {
            space_type: SpaceType::L2,
            data_type: VectorDataType::Float,
            ..Default::default()
        }
    }

    #[test]
    fn store_append_and_overwrite() {
        unsafe {
            let addr = store_vector_data(0, &[1, 2], 16, false);
            assert_ne!(addr, 0);
            let addr2 = store_vector_data(addr, &[3, 4], 16, true);
            assert_eq!(addr, addr2);

            let buffer = &*(addr as *const NativeVectorBuffer);
            assert_eq!(buffer.data, vec![1, 2, 3, 4]);

            store_vector_data(addr, &[9], 16, false);
            let buffer = &*(addr as *const NativeVectorBuffer);
            assert_eq!(buffer.data, vec![9]);

            free_vector_data(addr);
        }
    }

    #[test]
    fn create_write_load_query_cycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cycle.hnsw");
        let before = live_native_objects();

        unsafe {
            let rows = pack_floats(&[0.0, 0.0, 3.0, 4.0]);
            let buf = store_vector_data(0, &rows, rows.len(), false);
            create_index(&[10, 20], buf, 2, KnnEngine::Hnsw, &path, &float_params()).unwrap();
            free_vector_data(buf);

            let index = load_index(&path).unwrap();
            let hits = query_index(index, &pack_floats(&[0.1, 0.1]), 1).unwrap();
            assert_eq!(hits[0].id, 10);
            free_index(index);
        }

        assert_eq!(live_native_objects(), before);
    }

    #[test]
    fn incremental_build_cycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("inc.hnsw");
        let before = live_native_objects();

        unsafe {
            let handle =
                init_index_from_scratch(4, 2, KnnEngine::Hnsw, &float_params()).unwrap();

            let batch = pack_floats(&[1.0, 1.0, 2.0, 2.0]);
            let buf = store_vector_data(0, &batch, batch.len(), false);
            insert_to_index(&[1, 2], buf, 2, handle).unwrap();

            let batch = pack_floats(&[8.0, 8.0]);
            store_vector_data(buf, &batch, batch.len(), false);
            insert_to_index(&[3], buf, 2, handle).unwrap();
            free_vector_data(buf);

            write_index(&path, handle).unwrap();

            let index = load_index(&path).unwrap();
            let hits = query_index(index, &pack_floats(&[8.0, 8.0]), 1).unwrap();
            assert_eq!(hits[0].id, 3);
            free_index(index);
        }

        assert_eq!(live_native_objects(), before);
    }

    #[test]
    fn scratch_build_rejected_for_one_shot_engine() {
        assert!(matches!(
            init_index_from_scratch(10, 2, KnnEngine::Ivf, &float_params()),
            Err(KnnError::Native(_))
        ));
    }

    #[test]
    fn shared_state_requires_template() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.hnsw");

        unsafe {
            let rows = pack_floats(&[1.0]);
            let buf = store_vector_data(0, &rows, rows.len(), false);
            let params = IndexParams {
                data_type: VectorDataType::Float,
                ..Default::default()
            };
            create_index(&[1], buf, 1, KnnEngine::Hnsw, &path, &params).unwrap();
            free_vector_data(buf);

            let index = load_index(&path).unwrap();
            assert!(init_shared_index_state(index).is_err());
            free_index(index);
        }
    }

    #[test]
    fn shared_state_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.ivf");
        let before = live_native_objects();

        unsafe {
            let rows = pack_floats(&[1.0, 2.0]);
            let buf = store_vector_data(0, &rows, rows.len(), false);
            create_index_from_template(
                &[1, 2],
                buf,
                1,
                KnnEngine::Ivf,
                &path,
                &float_params(),
                b"centroids",
            )
            .unwrap();
            free_vector_data(buf);

            let index = load_index(&path).unwrap();
            let shared = init_shared_index_state(index).unwrap();
            assert_eq!(shared_index_state_size(shared), b"centroids".len());
            set_shared_index_state(index, shared);
            free_index(index);
            free_shared_index_state(shared);
        }

        assert_eq!(live_native_objects(), before);
    }
}
