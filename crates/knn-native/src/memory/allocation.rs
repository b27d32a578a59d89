//! Guarded ownership of one native memory region.
//!
//! An allocation wraps a raw native address behind a read/write lock.
//! Readers take the lock shared for the duration of a query; `close` takes
//! it exclusive, so the native free can never race an in-flight read. Close
//! is idempotent: the first caller wins, later calls return immediately
//! even while the first is still waiting on readers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::engine::{KnnEngine, VectorDataType};
use crate::error::{KnnError, KnnResult};
use crate::memory::shared::{SharedIndexState, SharedIndexStateManager};
use crate::native::raw::{self, Neighbor};

/// What the native address behind an allocation points at.
#[derive(Debug)]
pub enum AllocationKind {
    /// A loaded index file.
    Index {
        engine: KnnEngine,
        index_path: PathBuf,
        index_name: String,
        binary: bool,
    },
    /// Raw training vectors staged for model training.
    TrainingData { data_type: VectorDataType },
    /// A weight-only reservation with no native object behind it.
    Anonymous,
}

#[derive(Debug)]
struct Inner {
    address: usize,
    freed: bool,
}

/// A cache-managed native memory region with guarded access and idempotent
/// close.
#[derive(Debug)]
pub struct NativeMemoryAllocation {
    kind: AllocationKind,
    size_bytes: u64,
    closing: AtomicBool,
    closed: AtomicBool,
    lock: RwLock<Inner>,
    shared: Option<(SharedIndexState, Arc<SharedIndexStateManager>)>,
}

impl NativeMemoryAllocation {
    /// Wrap a loaded index. `shared` carries the model state acquired at
    /// load time; it is released exactly once, when this allocation closes.
    pub fn index(
        address: usize,
        size_bytes: u64,
        engine: KnnEngine,
        index_path: PathBuf,
        index_name: String,
        binary: bool,
        shared: Option<(SharedIndexState, Arc<SharedIndexStateManager>)>,
    ) -> Self {
        Self {
            kind: AllocationKind::Index {
                engine,
                index_path,
                index_name,
                binary,
            },
            size_bytes,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lock: RwLock::new(Inner { address, freed: false }),
            shared,
        }
    }

    pub fn training_data(address: usize, size_bytes: u64, data_type: VectorDataType) -> Self {
        Self {
            kind: AllocationKind::TrainingData { data_type },
            size_bytes,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lock: RwLock::new(Inner { address, freed: false }),
            shared: None,
        }
    }

    /// Reserve cache weight without a native object.
    pub fn anonymous(size_bytes: u64) -> Self {
        Self {
            kind: AllocationKind::Anonymous,
            size_bytes,
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lock: RwLock::new(Inner { address: 0, freed: false }),
            shared: None,
        }
    }

    /// Acquire shared access to the native address.
    ///
    /// # Errors
    ///
    /// Returns [`KnnError::AllocationClosed`] if the native resources have
    /// been released.
    pub fn read(&self) -> KnnResult<AllocationReadGuard<'_>> {
        let guard = self.lock.read();
        if guard.freed {
            return Err(KnnError::AllocationClosed);
        }
        Ok(AllocationReadGuard {
            allocation: self,
            guard,
        })
    }

    /// Acquire exclusive access to the native address, for operations that
    /// mutate the native object in place.
    ///
    /// # Errors
    ///
    /// Returns [`KnnError::AllocationClosed`] if the native resources have
    /// been released.
    pub fn write(&self) -> KnnResult<AllocationWriteGuard<'_>> {
        let guard = self.lock.write();
        if guard.freed {
            return Err(KnnError::AllocationClosed);
        }
        Ok(AllocationWriteGuard { guard })
    }

    /// Release the native resources. Idempotent; the winning caller blocks
    /// until active readers finish, later callers return immediately.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.lock.write();
        if !inner.freed {
            if inner.address != 0 {
                match self.kind {
                    // SAFETY: the exclusive lock guarantees no reader holds
                    // the address, and `freed` guarantees a single free.
                    AllocationKind::Index { .. } => unsafe { raw::free_index(inner.address) },
                    AllocationKind::TrainingData { .. } => unsafe {
                        raw::free_vector_data(inner.address)
                    },
                    AllocationKind::Anonymous => {}
                }
            }
            if let Some((state, manager)) = &self.shared {
                manager.release(state);
            }
            inner.address = 0;
            inner.freed = true;
            debug!(size_bytes = self.size_bytes, "closed native memory allocation");
        }
        self.closed.store(true, Ordering::Release);
    }

    /// Whether the native resources have been released. Stays false while a
    /// close is blocked behind active readers.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Declared weight of this allocation in the cache.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn kind(&self) -> &AllocationKind {
        &self.kind
    }

    pub fn engine(&self) -> Option<KnnEngine> {
        match &self.kind {
            AllocationKind::Index { engine, .. } => Some(*engine),
            _ => None,
        }
    }

    pub fn index_path(&self) -> Option<&Path> {
        match &self.kind {
            AllocationKind::Index { index_path, .. } => Some(index_path),
            _ => None,
        }
    }

    /// Name of the search index this allocation belongs to.
    pub fn index_name(&self) -> Option<&str> {
        match &self.kind {
            AllocationKind::Index { index_name, .. } => Some(index_name),
            _ => None,
        }
    }

    pub fn is_binary_index(&self) -> bool {
        matches!(&self.kind, AllocationKind::Index { binary: true, .. })
    }

    pub fn is_training_data(&self) -> bool {
        matches!(&self.kind, AllocationKind::TrainingData { .. })
    }
}

impl Drop for NativeMemoryAllocation {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared-access guard over an allocation's native address. The address
/// stays valid for the guard's lifetime.
pub struct AllocationReadGuard<'a> {
    allocation: &'a NativeMemoryAllocation,
    guard: RwLockReadGuard<'a, Inner>,
}

impl AllocationReadGuard<'_> {
    pub fn memory_address(&self) -> usize {
        self.guard.address
    }

    /// Run a k-NN query against an index allocation.
    ///
    /// # Errors
    ///
    /// Returns [`KnnError::Native`] for non-index allocations.
    pub fn query(&self, query: &[u8], k: usize) -> KnnResult<Vec<Neighbor>> {
        if !matches!(self.allocation.kind, AllocationKind::Index { .. }) {
            return Err(KnnError::Native(
                "query requires an index allocation".into(),
            ));
        }
        // SAFETY: the read lock keeps the index alive for the call.
        unsafe { raw::query_index(self.guard.address, query, k) }
    }
}

/// Exclusive-access guard over an allocation's native address.
pub struct AllocationWriteGuard<'a> {
    guard: RwLockWriteGuard<'a, Inner>,
}

impl AllocationWriteGuard<'_> {
    pub fn memory_address(&self) -> usize {
        self.guard.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::params::IndexParams;
    use crate::native::raw::live_native_objects;
    use std::time::Duration;
    use tempfile::tempdir;

    fn pack_floats(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn loaded_index(dir: &std::path::Path) -> NativeMemoryAllocation {
        let path = dir.join("alloc.hnsw");
        unsafe {
            let rows = pack_floats(&[1.0, 2.0, 3.0, 4.0]);
            let buf = raw::store_vector_data(0, &rows, rows.len(), false);
            raw::create_index(
                &[1, 2],
                buf,
                2,
                KnnEngine::Hnsw,
                &path,
                &IndexParams::default(),
            )
            .unwrap();
            raw::free_vector_data(buf);
            let address = raw::load_index(&path).unwrap();
            NativeMemoryAllocation::index(
                address,
                64,
                KnnEngine::Hnsw,
                path,
                "test-index".into(),
                false,
                None,
            )
        }
    }

    #[test]
    fn close_is_idempotent_and_frees_once() {
        let dir = tempdir().unwrap();
        let before = live_native_objects();
        let allocation = loaded_index(dir.path());
        assert_eq!(live_native_objects(), before + 1);

        allocation.close();
        assert!(allocation.is_closed());
        assert_eq!(live_native_objects(), before);

        allocation.close();
        assert_eq!(live_native_objects(), before);
    }

    #[test]
    fn read_after_close_is_rejected() {
        let dir = tempdir().unwrap();
        let allocation = loaded_index(dir.path());
        allocation.close();
        assert!(matches!(
            allocation.read(),
            Err(KnnError::AllocationClosed)
        ));
    }

    #[test]
    fn reader_delays_close_effect() {
        let dir = tempdir().unwrap();
        let allocation = Arc::new(loaded_index(dir.path()));

        let guard = allocation.read().unwrap();
        let closer = {
            let allocation = Arc::clone(&allocation);
            std::thread::spawn(move || allocation.close())
        };

        // The close is pending behind our read guard.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!allocation.is_closed());
        let hits = guard.query(&pack_floats(&[1.0, 2.0]), 1).unwrap();
        assert_eq!(hits[0].id, 1);

        drop(guard);
        closer.join().unwrap();
        assert!(allocation.is_closed());
    }

    #[test]
    fn drop_releases_native_memory() {
        let dir = tempdir().unwrap();
        let before = live_native_objects();
        {
            let _allocation = loaded_index(dir.path());
            assert_eq!(live_native_objects(), before + 1);
        }
        assert_eq!(live_native_objects(), before);
    }

    #[test]
    fn write_guard_excludes_readers() {
        let dir = tempdir().unwrap();
        let allocation = Arc::new(loaded_index(dir.path()));

        let write_guard = allocation.write().unwrap();
        assert_ne!(write_guard.memory_address(), 0);

        let reader = {
            let allocation = Arc::clone(&allocation);
            std::thread::spawn(move || allocation.read().map(|g| g.memory_address()))
        };
        std::thread::sleep(Duration::from_millis(30));
        assert!(!reader.is_finished());

        drop(write_guard);
        assert!(reader.join().unwrap().is_ok());
    }

    #[test]
    fn query_through_guard() {
        let dir = tempdir().unwrap();
        let allocation = loaded_index(dir.path());
        let guard = allocation.read().unwrap();
        let hits = guard.query(&pack_floats(&[3.0, 4.0]), 2).unwrap();
        assert_eq!(hits[0].id, 2);
    }

    #[test]
    fn anonymous_allocation_carries_weight_only() {
        let allocation = NativeMemoryAllocation::anonymous(512);
        assert_eq!(allocation.size_bytes(), 512);
        assert!(!allocation.is_closed());
        allocation.close();
        assert!(allocation.is_closed());
    }
}
