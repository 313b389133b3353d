//! The StorageAdapter trait: the single interface to byte storage.
//!
//! Every byte that enters or leaves a site goes through this trait. The
//! reference implementation is the filesystem adapter in `coffer-storage`;
//! other backends plug in behind the same contract.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::CofferError;
use crate::types::{NewArtifact, StorageLocation, StorageMetadata};
use crate::Result;

/// Ordered stream of stored objects. Errors surface on the pull that hit them.
pub type StorageIterator = BoxStream<'static, Result<StorageMetadata>>;

/// Byte storage for one site.
///
/// # Atomic puts
///
/// [`put`](StorageAdapter::put) stages the incoming bytes privately while
/// hashing and counting them, validates against any expected checksum and
/// length, and only then publishes the object under a freshly generated
/// content address. A failed put leaves nothing observable through
/// [`get`](StorageAdapter::get) or [`iterator`](StorageAdapter::iterator).
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Store the bytes read from `source` and return their metadata.
    ///
    /// Fails with [`CofferError::ChecksumMismatch`] or
    /// [`CofferError::LengthMismatch`] when validation fails, with a
    /// source-side [`CofferError::Transfer`] when reading `source` fails, and
    /// with [`CofferError::InvariantViolation`] if the generated address is
    /// already taken.
    async fn put(
        &self,
        artifact: &NewArtifact,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<StorageMetadata>;

    /// Stream the addressed object to `dest`.
    ///
    /// Fails with [`CofferError::NotFound`] for a missing object and with a
    /// sink-side [`CofferError::Transfer`] when writing `dest` fails.
    async fn get(
        &self,
        location: &StorageLocation,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()>;

    /// Stream a subset of the addressed object to `dest`.
    ///
    /// Adapters without cutout support reject the request explicitly.
    async fn get_cutouts(
        &self,
        location: &StorageLocation,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
        cutouts: &[String],
    ) -> Result<()> {
        let _ = (dest, cutouts);
        Err(CofferError::Unsupported {
            message: format!("cutouts not supported: {location}"),
        })
    }

    /// Remove the addressed object. Missing objects are [`CofferError::NotFound`].
    async fn delete(&self, location: &StorageLocation) -> Result<()>;

    /// Stored objects in [`StorageLocation`] order, optionally restricted to
    /// buckets starting with `bucket_prefix`.
    async fn iterator(&self, bucket_prefix: Option<&str>) -> Result<StorageIterator>;
}
