//! coffer core types, traits, configuration, and errors.
//!
//! This crate provides the foundational building blocks for a coffer
//! storage site: the [`Artifact`] entity and its meta checksum, checksum
//! and partition-tag primitives, the [`StorageAdapter`] trait for byte
//! storage, site configuration, and the unified error type.

pub mod artifact;
pub mod checksum;
pub mod config;
pub mod error;
pub mod partition;
pub mod storage;
pub mod types;

pub use artifact::Artifact;
pub use checksum::{Checksum, DigestAlgorithm};
pub use config::{DaoConfig, FsConfig, SiteConfig, SyncConfig};
pub use error::{CofferError, TransferSide};
pub use storage::{StorageAdapter, StorageIterator};
pub use types::*;

/// Convenience Result type using [`CofferError`].
pub type Result<T> = std::result::Result<T, CofferError>;
