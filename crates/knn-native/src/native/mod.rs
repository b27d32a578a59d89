//! In-process native index library and its raw address-based interface.

pub(crate) mod library;
pub mod raw;

pub use raw::Neighbor;
