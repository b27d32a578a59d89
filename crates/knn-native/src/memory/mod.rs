//! Native memory lifecycle: allocations, the weighted cache, and shared
//! per-model state.

pub mod allocation;
pub mod cache;
pub mod entry;
pub mod shared;

pub use allocation::{
    AllocationKind, AllocationReadGuard, AllocationWriteGuard, NativeMemoryAllocation,
};
pub use cache::{CacheStatsSnapshot, NativeMemoryCacheManager};
pub use entry::{
    AnonymousEntryContext, IndexEntryContext, NativeMemoryEntryContext, TrainingDataEntryContext,
};
pub use shared::{SharedIndexState, SharedIndexStateManager};
