//! Batched transfer of vectors into native staging memory.
//!
//! Vectors destined for the native library are accumulated on the heap and
//! pushed off-heap in fixed-size batches, bounding peak staging memory at
//! roughly `transfer_limit * bytes_per_vector`. The off-heap buffer is
//! owned by this type and released on drop.

use tracing::trace;

use crate::error::{KnnError, KnnResult};
use crate::native::raw;

/// Accumulates packed vectors and moves them off-heap one batch at a time.
pub struct OffHeapVectorTransfer {
    bytes_per_vector: usize,
    transfer_limit: usize,
    pending: Vec<u8>,
    pending_count: usize,
    vector_address: usize,
}

impl OffHeapVectorTransfer {
    /// Create a transfer whose batch size is derived from a memory ceiling:
    /// `limit_bytes / bytes_per_vector` vectors per batch, never below one.
    pub fn new(bytes_per_vector: usize, limit_bytes: u64) -> Self {
        let limit = (limit_bytes / bytes_per_vector as u64).max(1) as usize;
        Self::with_limit(bytes_per_vector, limit)
    }

    /// Create a transfer with an explicit per-batch vector count.
    pub fn with_limit(bytes_per_vector: usize, transfer_limit: usize) -> Self {
        Self {
            bytes_per_vector,
            transfer_limit: transfer_limit.max(1),
            pending: Vec::with_capacity(transfer_limit.max(1) * bytes_per_vector),
            pending_count: 0,
            vector_address: 0,
        }
    }

    /// Number of vectors moved off-heap per batch.
    pub fn transfer_limit(&self) -> usize {
        self.transfer_limit
    }

    /// Address of the off-heap buffer, or 0 before the first batch has been
    /// pushed. Stable across batches.
    pub fn vector_address(&self) -> usize {
        self.vector_address
    }

    /// Queue one vector. When the batch fills, it is pushed off-heap and
    /// `Ok(true)` is returned; the off-heap buffer then holds exactly this
    /// batch (or, with `append`, everything transferred so far).
    ///
    /// With `append` false each pushed batch overwrites the previous one,
    /// so the buffer never grows past one batch.
    ///
    /// # Errors
    ///
    /// Returns [`KnnError::DimensionMismatch`] if the vector's length does
    /// not match the configured per-vector size.
    pub fn transfer(&mut self, vector: &[u8], append: bool) -> KnnResult<bool> {
        if vector.len() != self.bytes_per_vector {
            return Err(KnnError::DimensionMismatch {
                expected: self.bytes_per_vector,
                actual: vector.len(),
            });
        }
        self.pending.extend_from_slice(vector);
        self.pending_count += 1;
        if self.pending_count == self.transfer_limit {
            self.push(append);
            return Ok(true);
        }
        Ok(false)
    }

    /// Push any partially filled batch off-heap. Returns whether data was
    /// flushed. `append` must match the mode used for [`Self::transfer`].
    pub fn flush(&mut self, append: bool) -> KnnResult<bool> {
        if self.pending_count == 0 {
            return Ok(false);
        }
        self.push(append);
        Ok(true)
    }

    /// Release the off-heap buffer and discard anything pending. The
    /// transfer can be reused afterwards; the next batch allocates a fresh
    /// buffer.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.pending_count = 0;
        if self.vector_address != 0 {
            // SAFETY: self owns the buffer and the address is dropped here.
            unsafe { raw::free_vector_data(self.vector_address) };
            self.vector_address = 0;
        }
    }

    fn push(&mut self, append: bool) {
        let capacity = self.transfer_limit * self.bytes_per_vector;
        // SAFETY: the address is either 0 or a live buffer owned by self.
        self.vector_address = unsafe {
            raw::store_vector_data(self.vector_address, &self.pending, capacity, append)
        };
        trace!(
            count = self.pending_count,
            append,
            address = self.vector_address,
            "pushed vector batch off-heap"
        );
        self.pending.clear();
        self.pending_count = 0;
    }
}

impl Drop for OffHeapVectorTransfer {
    fn drop(&mut self) {
        if self.vector_address != 0 {
            // SAFETY: self owns the buffer and the address is dropped here.
            unsafe { raw::free_vector_data(self.vector_address) };
            self.vector_address = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::raw::live_native_objects;

    #[test]
    fn limit_derived_from_memory_ceiling() {
        assert_eq!(OffHeapVectorTransfer::new(40, 160).transfer_limit(), 4);
        assert_eq!(OffHeapVectorTransfer::new(40, 100).transfer_limit(), 2);
        // Ceiling below one vector still transfers one at a time.
        assert_eq!(OffHeapVectorTransfer::new(40, 10).transfer_limit(), 1);
    }

    #[test]
    fn batches_push_at_the_limit() {
        let mut transfer = OffHeapVectorTransfer::with_limit(2, 3);
        assert!(!transfer.transfer(&[1, 1], true).unwrap());
        assert!(!transfer.transfer(&[2, 2], true).unwrap());
        assert_eq!(transfer.vector_address(), 0);
        assert!(transfer.transfer(&[3, 3], true).unwrap());
        assert_ne!(transfer.vector_address(), 0);
    }

    #[test]
    fn address_stable_and_overwritten_without_append() {
        let mut transfer = OffHeapVectorTransfer::with_limit(1, 2);
        transfer.transfer(&[1], false).unwrap();
        transfer.transfer(&[2], false).unwrap();
        let first = transfer.vector_address();

        transfer.transfer(&[3], false).unwrap();
        transfer.transfer(&[4], false).unwrap();
        assert_eq!(transfer.vector_address(), first);
    }

    #[test]
    fn flush_pushes_partial_batch_only_when_nonempty() {
        let mut transfer = OffHeapVectorTransfer::with_limit(1, 4);
        assert!(!transfer.flush(true).unwrap());

        transfer.transfer(&[7], true).unwrap();
        assert!(transfer.flush(true).unwrap());
        assert!(!transfer.flush(true).unwrap());
        assert_ne!(transfer.vector_address(), 0);
    }

    #[test]
    fn rejects_wrong_vector_length() {
        let mut transfer = OffHeapVectorTransfer::with_limit(4, 2);
        assert!(matches!(
            transfer.transfer(&[0u8; 3], true),
            Err(KnnError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn reset_frees_and_allows_reuse() {
        let before = live_native_objects();
        let mut transfer = OffHeapVectorTransfer::with_limit(1, 2);
        transfer.transfer(&[1], true).unwrap();
        transfer.transfer(&[2], true).unwrap();
        assert_eq!(live_native_objects(), before + 1);

        transfer.reset();
        assert_eq!(transfer.vector_address(), 0);
        assert_eq!(live_native_objects(), before);

        transfer.transfer(&[3], true).unwrap();
        transfer.transfer(&[4], true).unwrap();
        assert_ne!(transfer.vector_address(), 0);
    }

    #[test]
    fn drop_releases_the_buffer() {
        let before = live_native_objects();
        {
            let mut transfer = OffHeapVectorTransfer::with_limit(1, 1);
            transfer.transfer(&[5], true).unwrap();
            assert_eq!(live_native_objects(), before + 1);
        }
        assert_eq!(live_native_objects(), before);
    }
}
