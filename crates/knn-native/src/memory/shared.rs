//! Reference-counted sharing of per-model native state.
//!
//! Indexes built from the same trained model share one native state object
//! (for example a quantization table). The first load of any index for a
//! model initializes the state; every later load bumps a reference count;
//! the state is freed only when the last referencing index closes.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::engine::KnnEngine;
use crate::error::KnnResult;
use crate::native::raw;

/// Handle to shared per-model native state. Clones refer to the same
/// underlying allocation; the manager tracks the count.
#[derive(Debug, Clone)]
pub struct SharedIndexState {
    address: usize,
    model_id: String,
    engine: KnnEngine,
    size_bytes: u64,
}

impl SharedIndexState {
    /// Address of the shared native object.
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn engine(&self) -> KnnEngine {
        self.engine
    }

    /// Native memory held by the shared model table.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

#[derive(Debug)]
struct Entry {
    state: SharedIndexState,
    ref_count: u64,
}

/// Tracks one shared state per model id with manual reference counting.
#[derive(Debug, Default)]
pub struct SharedIndexStateManager {
    entries: Mutex<HashMap<String, Entry>>,
}

impl SharedIndexStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the shared state for `model_id`, initializing it from
    /// `index_address` on first use.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::KnnError::Native`] if the index carries no
    /// model template.
    pub fn get(
        &self,
        index_address: usize,
        model_id: &str,
        engine: KnnEngine,
    ) -> KnnResult<SharedIndexState> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(model_id) {
            entry.ref_count += 1;
            debug!(model_id, ref_count = entry.ref_count, "shared state reacquired");
            return Ok(entry.state.clone());
        }

        // SAFETY: the caller guarantees `index_address` is a live loaded
        // index; the lock serializes initialization per model.
        let address = unsafe { raw::init_shared_index_state(index_address)? };
        // SAFETY: `address` was just returned and nothing else can free it
        // while the lock is held.
        let size_bytes = unsafe { raw::shared_index_state_size(address) } as u64;
        info!(model_id, size_bytes, "initialized shared index state");
        let state = SharedIndexState {
            address,
            model_id: model_id.to_string(),
            engine,
            size_bytes,
        };
        entries.insert(
            model_id.to_string(),
            Entry {
                state: state.clone(),
                ref_count: 1,
            },
        );
        Ok(state)
    }

    /// Release one reference to `state`, freeing the native object when the
    /// count reaches zero. Releasing an unknown state is logged and
    /// ignored.
    pub fn release(&self, state: &SharedIndexState) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&state.model_id) else {
            error!(model_id = %state.model_id, "released shared state with no entry");
            return;
        };
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            debug!(model_id = %state.model_id, ref_count = entry.ref_count, "shared state released");
            return;
        }

        let address = entry.state.address;
        entries.remove(&state.model_id);
        info!(model_id = %state.model_id, "freeing shared index state");
        // SAFETY: the count reached zero, so no index references the state.
        unsafe { raw::free_shared_index_state(address) };
    }

    /// Number of models with live shared state.
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::params::IndexParams;
    use crate::native::raw::live_native_objects;
    use tempfile::tempdir;

    fn loaded_template_index(dir: &std::path::Path, name: &str) -> usize {
        let path = dir.join(name);
        unsafe {
            let rows: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
            let buf = raw::store_vector_data(0, &rows, rows.len(), false);
            raw::create_index_from_template(
                &[1, 2],
                buf,
                1,
                KnnEngine::Ivf,
                &path,
                &IndexParams::default(),
                b"model",
            )
            .unwrap();
            raw::free_vector_data(buf);
            raw::load_index(&path).unwrap()
        }
    }

    #[test]
    fn second_get_reuses_first_initialization() {
        let dir = tempdir().unwrap();
        let index_a = loaded_template_index(dir.path(), "a.ivf");
        let index_b = loaded_template_index(dir.path(), "b.ivf");

        let manager = SharedIndexStateManager::new();
        let before = live_native_objects();

        let state_a = manager.get(index_a, "model-1", KnnEngine::Ivf).unwrap();
        let state_b = manager.get(index_b, "model-1", KnnEngine::Ivf).unwrap();
        assert_eq!(state_a.address(), state_b.address());
        assert_eq!(state_a.size_bytes(), b"model".len() as u64);
        // One shared object for both acquisitions.
        assert_eq!(live_native_objects(), before + 1);
        assert_eq!(manager.entry_count(), 1);

        manager.release(&state_a);
        assert_eq!(live_native_objects(), before + 1);
        manager.release(&state_b);
        assert_eq!(live_native_objects(), before);
        assert_eq!(manager.entry_count(), 0);

        unsafe {
            raw::free_index(index_a);
            raw::free_index(index_b);
        }
    }

    #[test]
    fn distinct_models_get_distinct_state() {
        let dir = tempdir().unwrap();
        let index_a = loaded_template_index(dir.path(), "a.ivf");
        let index_b = loaded_template_index(dir.path(), "b.ivf");

        let manager = SharedIndexStateManager::new();
        let state_a = manager.get(index_a, "model-1", KnnEngine::Ivf).unwrap();
        let state_b = manager.get(index_b, "model-2", KnnEngine::Ivf).unwrap();
        assert_ne!(state_a.address(), state_b.address());
        assert_eq!(manager.entry_count(), 2);

        manager.release(&state_a);
        manager.release(&state_b);
        unsafe {
            raw::free_index(index_a);
            raw::free_index(index_b);
        }
    }

    #[test]
    fn release_of_unknown_state_is_ignored() {
        let manager = SharedIndexStateManager::new();
        let state = SharedIndexState {
            address: 0xDEAD,
            model_id: "ghost".into(),
            engine: KnnEngine::Ivf,
            size_bytes: 0,
        };
        manager.release(&state);
        assert_eq!(manager.entry_count(), 0);
    }
}
