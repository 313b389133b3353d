//! coffer runtime: a storage site and the jobs that run against it.
//!
//! [`Site`] ties the filesystem byte storage and the artifact metadata
//! store together. [`ingest`] stores new bytes under an artifact,
//! [`FileSyncJob`] pulls an artifact's bytes from remote endpoints into the
//! site, and [`Validator`] reconciles what is stored with what the
//! inventory says should be stored.

pub mod ingest;
pub mod site;
pub mod sync;
pub mod validate;

pub use ingest::ingest;
pub use site::{artifact_stream, Site};
pub use sync::{ByteSource, EndpointFetcher, EndpointResolver, FileSyncJob, SyncOutcome};
pub use validate::{
    DefaultListener, Divergence, ReportPolicy, ValidateEventListener, ValidatePolicy,
    ValidateSummary, Validator,
};
