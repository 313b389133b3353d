//! Byte storage adapters for coffer.
//!
//! This crate provides concrete implementations of the
//! [`StorageAdapter`](coffer_core::StorageAdapter) trait:
//!
//! - [`FsAdapter`] stores objects under a local directory tree, addressed
//!   by generated `uuid:` storage ids and published atomically.

pub mod fs;

pub use fs::FsAdapter;
