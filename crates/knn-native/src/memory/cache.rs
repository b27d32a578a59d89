//! Weighted LRU cache over native memory allocations.
//!
//! Entries are weighed by their declared byte size against a fixed budget
//! that doubles as a circuit breaker. A miss loads the entry exactly once
//! even under concurrent requests for the same key: loaders are serialized
//! by a per-key gate while the cache-wide lock stays free for other keys.
//!
//! Eviction closes allocations outside the cache lock. A closing
//! allocation waits for its active readers, so in-flight queries always
//! finish against live native memory.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{KnnError, KnnResult};
use crate::memory::allocation::NativeMemoryAllocation;
use crate::memory::entry::NativeMemoryEntryContext;

struct CacheEntry {
    allocation: Arc<NativeMemoryAllocation>,
    last_access: Instant,
}

struct CacheInner {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    /// Keys ordered least- to most-recently used.
    recency: VecDeque<String>,
    weight_bytes: u64,
}

impl CacheInner {
    fn touch(&mut self, key: &str, now: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_access = now;
        }
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            let key = self.recency.remove(pos).unwrap_or_default();
            self.recency.push_back(key);
        }
    }

    fn insert(&mut self, key: String, allocation: Arc<NativeMemoryAllocation>, now: Instant) {
        self.weight_bytes += allocation.size_bytes();
        self.entries.insert(
            key.clone(),
            CacheEntry {
                allocation,
                last_access: now,
            },
        );
        self.recency.push_back(key);
    }

    fn remove(&mut self, key: &str) -> Option<Arc<NativeMemoryAllocation>> {
        // The recency list is purged even when the entry is gone; a stale
        // key left behind would wedge the eviction scan.
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        let entry = self.entries.remove(key)?;
        self.weight_bytes -= entry.allocation.size_bytes();
        Some(entry.allocation)
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        match self.config.expire_after_access {
            Some(window) => now.duration_since(entry.last_access) > window,
            None => false,
        }
    }
}

/// Point-in-time view of cache activity.
#[derive(Debug, Clone)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
    pub weight_bytes: u64,
    pub max_weight_bytes: u64,
    /// When an entry was last evicted to free space, if ever.
    pub last_size_eviction: Option<SystemTime>,
}

/// Manages every native memory allocation behind one weighted LRU cache.
pub struct NativeMemoryCacheManager {
    inner: Mutex<CacheInner>,
    /// Per-key gates serializing concurrent loads of the same entry.
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    capacity_reached: AtomicBool,
    last_size_eviction: Mutex<Option<SystemTime>>,
}

impl NativeMemoryCacheManager {
    /// # Errors
    ///
    /// Returns [`KnnError::InvalidConfig`] if the configuration fails
    /// validation.
    pub fn new(config: CacheConfig) -> KnnResult<Self> {
        config.validate()?;
        info!(
            max_weight_bytes = config.max_weight_bytes,
            is_weight_limited = config.is_weight_limited,
            "initializing native memory cache"
        );
        Ok(Self {
            inner: Mutex::new(CacheInner {
                config,
                entries: HashMap::new(),
                recency: VecDeque::new(),
                weight_bytes: 0,
            }),
            in_flight: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            capacity_reached: AtomicBool::new(false),
            last_size_eviction: Mutex::new(None),
        })
    }

    /// Fetch the allocation for `context`, loading it on a miss.
    ///
    /// With `allow_eviction` false, an entry that does not fit the
    /// remaining budget is rejected before loading. With it true,
    /// least-recently-used idle entries are evicted to make room; entries
    /// still referenced outside the cache are skipped, and the new entry is
    /// admitted even if the budget is exceeded as a result.
    ///
    /// # Errors
    ///
    /// Returns [`KnnError::OutOfNativeMemory`] when the entry cannot be
    /// admitted, or any error from the context's loader.
    pub fn get(
        &self,
        context: &dyn NativeMemoryEntryContext,
        allow_eviction: bool,
    ) -> KnnResult<Arc<NativeMemoryAllocation>> {
        let key = context.key();

        if let Some(allocation) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::AcqRel);
            return Ok(allocation);
        }

        self.check_admission_budget(context, allow_eviction)?;

        let gate = {
            let mut in_flight = self.in_flight.lock();
            Arc::clone(
                in_flight
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let (result, to_close) = {
            let _loading = gate.lock();
            self.load_entry(key, context, allow_eviction)
        };
        drop(gate);
        self.release_gate(key);
        // close() may block on readers; no cache locks are held here.
        for allocation in to_close {
            allocation.close();
        }
        result
    }

    /// Miss path, run while holding the key's gate. Returns the outcome
    /// plus any allocations to close once the gate is released.
    fn load_entry(
        &self,
        key: &str,
        context: &dyn NativeMemoryEntryContext,
        allow_eviction: bool,
    ) -> (
        KnnResult<Arc<NativeMemoryAllocation>>,
        Vec<Arc<NativeMemoryAllocation>>,
    ) {
        // Another request may have loaded the entry while we waited.
        if let Some(allocation) = self.lookup(key) {
            self.hits.fetch_add(1, Ordering::AcqRel);
            return (Ok(allocation), Vec::new());
        }

        self.misses.fetch_add(1, Ordering::AcqRel);
        let allocation = match context.load() {
            Ok(allocation) => Arc::new(allocation),
            Err(e) => return (Err(e), Vec::new()),
        };

        match self.admit(key, &allocation, allow_eviction) {
            Ok((admitted, to_close)) => (Ok(admitted), to_close),
            Err(e) => (Err(e), vec![allocation]),
        }
    }

    /// Remove and close the entry for `key`, if present.
    pub fn invalidate(&self, key: &str) {
        let removed = self.inner.lock().remove(key);
        if let Some(allocation) = removed {
            debug!(key, "invalidating cache entry");
            self.evictions.fetch_add(1, Ordering::AcqRel);
            allocation.close();
        }
    }

    /// Remove and close every entry.
    pub fn invalidate_all(&self) {
        let removed: Vec<_> = {
            let mut inner = self.inner.lock();
            let keys: Vec<String> = inner.entries.keys().cloned().collect();
            keys.iter()
                .filter_map(|key| inner.remove(key))
                .collect()
        };
        self.evictions
            .fetch_add(removed.len() as u64, Ordering::AcqRel);
        for allocation in removed {
            allocation.close();
        }
    }

    /// Replace the configuration, dropping every cached entry. Loads in
    /// flight complete against the new configuration.
    ///
    /// # Errors
    ///
    /// Returns [`KnnError::InvalidConfig`] if `config` fails validation;
    /// the cache is untouched in that case.
    pub fn rebuild(&self, config: CacheConfig) -> KnnResult<()> {
        config.validate()?;
        info!("rebuilding native memory cache");
        let removed: Vec<_> = {
            let mut inner = self.inner.lock();
            let keys: Vec<String> = inner.entries.keys().cloned().collect();
            let removed = keys.iter().filter_map(|key| inner.remove(key)).collect();
            inner.config = config;
            removed
        };
        self.capacity_reached.store(false, Ordering::Release);
        for allocation in removed {
            allocation.close();
        }
        Ok(())
    }

    /// Remove and close entries idle past the expiry window. No-op when
    /// expiry is disabled.
    pub fn clean_up(&self) {
        let expired: Vec<_> = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let keys: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, entry)| inner.is_expired(entry, now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| inner.remove(key)).collect()
        };
        self.evictions
            .fetch_add(expired.len() as u64, Ordering::AcqRel);
        for allocation in expired {
            allocation.close();
        }
    }

    /// Total weight of cached entries in bytes.
    pub fn cache_size_bytes(&self) -> u64 {
        self.inner.lock().weight_bytes
    }

    /// Combined weight of index entries belonging to `index_name`.
    pub fn index_size_bytes(&self, index_name: &str) -> u64 {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| entry.allocation.index_name() == Some(index_name))
            .map(|entry| entry.allocation.size_bytes())
            .sum()
    }

    /// Number of index entries belonging to `index_name`.
    pub fn index_allocation_count(&self, index_name: &str) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| entry.allocation.index_name() == Some(index_name))
            .count()
    }

    /// Combined weight of training-data entries.
    pub fn training_data_size_bytes(&self) -> u64 {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| entry.allocation.is_training_data())
            .map(|entry| entry.allocation.size_bytes())
            .sum()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        let (entry_count, weight_bytes, max_weight_bytes) = {
            let inner = self.inner.lock();
            (
                inner.entries.len(),
                inner.weight_bytes,
                inner.config.max_weight_bytes,
            )
        };
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Acquire),
            misses: self.misses.load(Ordering::Acquire),
            evictions: self.evictions.load(Ordering::Acquire),
            entry_count,
            weight_bytes,
            max_weight_bytes,
            last_size_eviction: *self.last_size_eviction.lock(),
        }
    }

    /// Whether a size-based eviction or over-budget admission has occurred
    /// since the flag was last cleared.
    pub fn is_capacity_reached(&self) -> bool {
        self.capacity_reached.load(Ordering::Acquire)
    }

    pub fn set_capacity_reached(&self, reached: bool) {
        self.capacity_reached.store(reached, Ordering::Release);
    }

    fn lookup(&self, key: &str) -> Option<Arc<NativeMemoryAllocation>> {
        let mut expired = None;
        let found = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let state = inner
                .entries
                .get(key)
                .map(|entry| (inner.is_expired(entry, now), Arc::clone(&entry.allocation)));
            match state {
                Some((true, _)) => {
                    expired = inner.remove(key);
                    None
                }
                Some((false, allocation)) => {
                    inner.touch(key, now);
                    Some(allocation)
                }
                None => None,
            }
        };
        if let Some(allocation) = expired {
            self.evictions.fetch_add(1, Ordering::AcqRel);
            allocation.close();
        }
        found
    }

    /// Circuit breaker: reject un-forced loads whose declared size cannot
    /// fit the remaining budget, before any native memory is touched.
    fn check_admission_budget(
        &self,
        context: &dyn NativeMemoryEntryContext,
        allow_eviction: bool,
    ) -> KnnResult<()> {
        let inner = self.inner.lock();
        if !inner.config.is_weight_limited || allow_eviction {
            return Ok(());
        }
        let entry_size = context.size_bytes();
        if inner.weight_bytes + entry_size > inner.config.max_weight_bytes {
            warn!(
                key = context.key(),
                entry_size,
                cache_size = inner.weight_bytes,
                "rejecting cache load over native memory budget"
            );
            return Err(KnnError::OutOfNativeMemory {
                entry_size,
                cache_size: inner.weight_bytes,
                max_size: inner.config.max_weight_bytes,
            });
        }
        Ok(())
    }

    /// Insert a freshly loaded allocation, evicting idle LRU entries when
    /// permitted. Returns the allocation now resident under `key` and the
    /// allocations to close once the cache lock is released.
    fn admit(
        &self,
        key: &str,
        allocation: &Arc<NativeMemoryAllocation>,
        allow_eviction: bool,
    ) -> KnnResult<(
        Arc<NativeMemoryAllocation>,
        Vec<Arc<NativeMemoryAllocation>>,
    )> {
        let mut inner = self.inner.lock();

        // A resident entry wins over a racing load; the surplus allocation
        // goes back to the caller for closing.
        if let Some(entry) = inner.entries.get(key) {
            let resident = Arc::clone(&entry.allocation);
            inner.touch(key, Instant::now());
            return Ok((resident, vec![Arc::clone(allocation)]));
        }

        let size = allocation.size_bytes();
        let mut to_close = Vec::new();

        if inner.config.is_weight_limited
            && inner.weight_bytes + size > inner.config.max_weight_bytes
        {
            if !allow_eviction {
                return Err(KnnError::OutOfNativeMemory {
                    entry_size: size,
                    cache_size: inner.weight_bytes,
                    max_size: inner.config.max_weight_bytes,
                });
            }

            let mut position = 0;
            while inner.weight_bytes + size > inner.config.max_weight_bytes
                && position < inner.recency.len()
            {
                let candidate = inner.recency[position].clone();
                let in_use = inner
                    .entries
                    .get(&candidate)
                    .map(|entry| Arc::strong_count(&entry.allocation) > 1)
                    .unwrap_or(false);
                if in_use {
                    position += 1;
                    continue;
                }
                if let Some(evicted) = inner.remove(&candidate) {
                    debug!(key = %candidate, "evicting cache entry for space");
                    to_close.push(evicted);
                }
            }

            self.capacity_reached.store(true, Ordering::Release);
            if !to_close.is_empty() {
                self.evictions
                    .fetch_add(to_close.len() as u64, Ordering::AcqRel);
                *self.last_size_eviction.lock() = Some(SystemTime::now());
            }
            if inner.weight_bytes + size > inner.config.max_weight_bytes {
                warn!(
                    key,
                    entry_size = size,
                    cache_size = inner.weight_bytes,
                    "admitting entry over budget; remaining entries are in use"
                );
            }
        }

        inner.insert(key.to_string(), Arc::clone(allocation), Instant::now());
        Ok((Arc::clone(allocation), to_close))
    }

    /// Drop the key's gate once no other request holds it. A gate with
    /// waiters stays in the map so late arrivals keep joining the same
    /// gate; the last request through removes it.
    fn release_gate(&self, key: &str) {
        let mut in_flight = self.in_flight.lock();
        let waiters_remain = in_flight
            .get(key)
            .map(|gate| Arc::strong_count(gate) > 1)
            .unwrap_or(false);
        if !waiters_remain {
            in_flight.remove(key);
        }
    }
}

impl Drop for NativeMemoryCacheManager {
    fn drop(&mut self) {
        self.invalidate_all();
    }
}
