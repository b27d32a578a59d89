//! Native index build pipeline.

pub mod params;
pub mod remote;
pub mod strategy;
pub mod writer;

pub use params::{BuildIndexParams, IndexParams};
pub use remote::{RemoteBuildStrategy, RemoteIndexClient};
pub use strategy::{BuildStrategy, CancelToken};
pub use writer::{MergeStats, NativeIndexWriter};
