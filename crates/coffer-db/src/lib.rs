//! SQLite-backed artifact metadata store for coffer.
//!
//! [`ArtifactDao`] is one session on the store: point lookups by id or uri,
//! upserts keyed by uri with an explicit force-update mode for operational
//! fields, and deletes. Scans are exposed as [`ArtifactIterator`]s, each
//! owning a separate read session so that scanning never blocks writers.
//! [`IncludeClauses`] selects artifacts with operator-supplied SQL filters.

pub mod dao;
pub mod include;
pub mod iterator;
mod schema;

pub use dao::{ArtifactDao, META_CHECKSUM_ALGORITHM};
pub use include::IncludeClauses;
pub use iterator::ArtifactIterator;
