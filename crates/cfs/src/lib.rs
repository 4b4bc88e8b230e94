#![forbid(unsafe_code)]
//! compactfs public API facade.
//!
//! Re-exports the read accessors from `cfs-core` through a stable external
//! interface. Enclosing filesystem layers depend on this crate.

pub use cfs_core::*;
