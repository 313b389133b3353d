//! Filesystem-backed storage adapter.
//!
//! [`FsAdapter`] implements the [`StorageAdapter`] trait on a local
//! directory tree:
//!
//! ```text
//! <root>/transaction/<uuid>            staged bytes, private to one put
//! <root>/transaction/<uuid>.meta       staged sidecar
//! <root>/content/<b0>/<b1>/../<uuid>   published bytes, one directory level per bucket char
//! <root>/content/<b0>/<b1>/../<uuid>.meta
//! ```
//!
//! Objects are named by opaque `uuid:` storage ids and carry no relation to
//! the artifact uri; the uri and checksum are kept in a JSON sidecar next
//! to the bytes. Publication hard-links the staged sidecar and then the
//! staged bytes into `content/`. `link(2)` refuses to replace an existing
//! name, so the data link is both the atomic publication point and the
//! collision check. Staging lives under the same root as the content tree,
//! so both are always on one filesystem.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use coffer_core::artifact::truncate_millis;
use coffer_core::partition::{is_bucket_prefix, partition, BUCKET_CHARS};
use coffer_core::{
    Checksum, CofferError, DigestAlgorithm, FsConfig, NewArtifact, Result, StorageAdapter,
    StorageIterator, StorageLocation, StorageMetadata,
};

const CONTENT_FOLDER: &str = "content";
const TXN_FOLDER: &str = "transaction";
const SIDECAR_EXT: &str = "meta";
const STORAGE_ID_SCHEME: &str = "uuid";
const COPY_BUFFER_SIZE: usize = 64 * 1024;

type IdGenerator = Arc<dyn Fn() -> Uuid + Send + Sync>;

/// What the sidecar records about a stored object.
#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    artifact_uri: String,
    content_checksum: Checksum,
}

/// A [`StorageAdapter`] backed by the local filesystem.
#[derive(Clone)]
pub struct FsAdapter {
    content_dir: PathBuf,
    txn_dir: PathBuf,
    bucket_length: usize,
    digest: DigestAlgorithm,
    next_id: IdGenerator,
}

impl std::fmt::Debug for FsAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsAdapter")
            .field("content_dir", &self.content_dir)
            .field("txn_dir", &self.txn_dir)
            .field("bucket_length", &self.bucket_length)
            .field("digest", &self.digest)
            .finish()
    }
}

impl FsAdapter {
    /// Open (creating if needed) an adapter rooted at `config.root`.
    ///
    /// The root must already exist; a missing or unwritable root is
    /// [`CofferError::StoreUnavailable`].
    pub async fn new(config: &FsConfig) -> Result<Self> {
        config.validate()?;
        let root = &config.root;
        let meta = fs::metadata(root).await.map_err(|e| {
            CofferError::unavailable(format!("storage root {} not accessible", root.display()), e)
        })?;
        if !meta.is_dir() {
            return Err(CofferError::StoreUnavailable {
                message: format!("storage root {} is not a directory", root.display()),
                source: None,
            });
        }

        let content_dir = root.join(CONTENT_FOLDER);
        let txn_dir = root.join(TXN_FOLDER);
        for dir in [&content_dir, &txn_dir] {
            fs::create_dir_all(dir).await.map_err(|e| {
                CofferError::unavailable(format!("Failed to create {}", dir.display()), e)
            })?;
        }

        info!(
            root = %root.display(),
            bucket_length = config.bucket_length,
            digest = %config.digest,
            "FsAdapter initialised"
        );
        Ok(Self {
            content_dir,
            txn_dir,
            bucket_length: config.bucket_length,
            digest: config.digest,
            next_id: Arc::new(Uuid::new_v4),
        })
    }

    /// Replace the storage id generator.
    ///
    /// Ids must be globally unique; a repeated id makes the next put fail
    /// with [`CofferError::InvariantViolation`].
    pub fn with_id_generator(mut self, generator: impl Fn() -> Uuid + Send + Sync + 'static) -> Self {
        self.next_id = Arc::new(generator);
        self
    }

    /// Directory holding published objects.
    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    /// Directory holding staged puts.
    pub fn txn_dir(&self) -> &Path {
        &self.txn_dir
    }

    /// Location for a freshly generated object id.
    fn location_for(&self, id: Uuid) -> StorageLocation {
        let storage_id = format!("{STORAGE_ID_SCHEME}:{id}");
        let bucket = partition(&storage_id, self.bucket_length);
        StorageLocation::new(storage_id, Some(bucket))
    }

    /// Resolve a location to the path of its bytes.
    ///
    /// Locations without a bucket are resolved through the partition
    /// function, so a bare storage id is enough to address an object.
    fn object_path(&self, location: &StorageLocation) -> Result<PathBuf> {
        let name = location
            .storage_id
            .strip_prefix(STORAGE_ID_SCHEME)
            .and_then(|rest| rest.strip_prefix(':'))
            .filter(|rest| Uuid::parse_str(rest).is_ok())
            .ok_or_else(|| {
                CofferError::invalid(format!("not a {STORAGE_ID_SCHEME} storage id: {location}"))
            })?;
        let bucket = match &location.storage_bucket {
            Some(b) => b.clone(),
            None => partition(&location.storage_id, self.bucket_length),
        };
        if bucket.len() != self.bucket_length || !is_bucket_prefix(&bucket) {
            return Err(CofferError::NotFound {
                key: location.to_string(),
            });
        }
        let mut path = self.content_dir.clone();
        for c in bucket.chars() {
            path.push(c.to_string());
        }
        path.push(name);
        Ok(path)
    }

    /// Claim the staging name for `id`. A name still held by another put is a collision.
    async fn open_staging(&self, id: Uuid, staged: &Path) -> Result<fs::File> {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(staged)
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    CofferError::InvariantViolation {
                        message: format!("storage id collision while staging: {}", self.location_for(id)),
                    }
                } else {
                    CofferError::storage(format!("Failed to create {}", staged.display()), e)
                }
            })
    }

    /// Copy `source` into the staging file while hashing and counting.
    async fn stage(
        &self,
        mut file: fs::File,
        staged: &Path,
        algorithm: DigestAlgorithm,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(Checksum, u64)> {
        let mut digester = algorithm.digester();
        let mut length = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = source
                .read(&mut buf)
                .await
                .map_err(|e| CofferError::source_side("Failed to read put source", e))?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await.map_err(|e| {
                CofferError::storage(format!("Failed to write {}", staged.display()), e)
            })?;
            digester.update(&buf[..n]);
            length += n as u64;
        }
        file.sync_all().await.map_err(|e| {
            CofferError::storage(format!("Failed to sync {}", staged.display()), e)
        })?;

        Ok((digester.finish(), length))
    }

    /// Link the staged sidecar and bytes into the content tree.
    async fn publish(
        &self,
        staged: &Path,
        staged_meta: &Path,
        location: &StorageLocation,
    ) -> Result<PathBuf> {
        let target = self.object_path(location)?;
        let target_meta = target.with_extension(SIDECAR_EXT);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CofferError::storage(format!("Failed to create {}", parent.display()), e)
            })?;
        }

        if let Err(e) = fs::hard_link(staged_meta, &target_meta).await {
            return Err(link_error(e, location, &target_meta));
        }
        if let Err(e) = fs::hard_link(staged, &target).await {
            // The sidecar link above succeeded, so that name is ours to remove.
            if let Err(cleanup) = fs::remove_file(&target_meta).await {
                warn!(path = %target_meta.display(), error = %cleanup, "Failed to remove sidecar");
            }
            return Err(link_error(e, location, &target));
        }
        Ok(target)
    }

    /// Stage, validate and publish one put. Staged files are left for the caller to discard.
    async fn put_staged(
        &self,
        id: Uuid,
        file: fs::File,
        staged: &Path,
        staged_meta: &Path,
        artifact: &NewArtifact,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<StorageMetadata> {
        let comparable = artifact
            .content_checksum
            .as_ref()
            .and_then(|c| c.digest_algorithm().map(|alg| (c, alg)));
        let algorithm = comparable.map(|(_, alg)| alg).unwrap_or(self.digest);

        let (checksum, length) = self.stage(file, staged, algorithm, source).await?;
        debug!(checksum = %checksum, length, "Staged put");

        match comparable {
            Some((expected, _)) if *expected != checksum => {
                return Err(CofferError::ChecksumMismatch {
                    expected: expected.to_string(),
                    actual: checksum.to_string(),
                });
            }
            Some(_) => {}
            None => {
                if let Some(expected) = &artifact.content_checksum {
                    debug!(expected = %expected, "Unknown checksum algorithm, not validated");
                }
            }
        }
        if let Some(expected) = artifact.content_length {
            if expected != length {
                return Err(CofferError::LengthMismatch {
                    expected,
                    actual: length,
                });
            }
        }

        let sidecar = Sidecar {
            artifact_uri: artifact.uri.clone(),
            content_checksum: checksum.clone(),
        };
        write_sidecar(staged_meta, &sidecar).await?;

        let location = self.location_for(id);
        let target = self.publish(staged, staged_meta, &location).await?;

        let mut metadata = StorageMetadata::new(location, checksum, length);
        metadata.artifact_uri = Some(artifact.uri.clone());
        metadata.content_last_modified = modified_time(&target).await?;
        Ok(metadata)
    }
}

#[async_trait]
impl StorageAdapter for FsAdapter {
    #[instrument(skip(self, artifact, source), fields(uri = %artifact.uri))]
    async fn put(
        &self,
        artifact: &NewArtifact,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<StorageMetadata> {
        let id = (self.next_id)();
        let staged = self.txn_dir.join(id.to_string());
        let staged_meta = staged.with_extension(SIDECAR_EXT);

        // The staging names belong to another put until this one claims them.
        let file = match self.open_staging(id, &staged).await {
            Ok(file) => file,
            Err(e) => {
                error!(error = %e, "Put failed");
                return Err(e);
            }
        };

        let result = self
            .put_staged(id, file, &staged, &staged_meta, artifact, source)
            .await;

        // Published objects are hard links, so the staged names can always go.
        discard(&staged).await;
        discard(&staged_meta).await;

        match &result {
            Ok(meta) => debug!(location = %meta.storage_location(), "Put published"),
            Err(e @ CofferError::InvariantViolation { .. }) => error!(error = %e, "Put failed"),
            Err(e) => warn!(error = %e, "Put rejected, staged data discarded"),
        }
        result
    }

    #[instrument(skip(self, dest), fields(location = %location))]
    async fn get(
        &self,
        location: &StorageLocation,
        dest: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<()> {
        let path = self.object_path(location)?;
        let mut file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                CofferError::NotFound {
                    key: location.storage_id.clone(),
                }
            } else {
                CofferError::storage(format!("Failed to open {}", path.display()), e)
            }
        })?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            let n = file.read(&mut buf).await.map_err(|e| {
                CofferError::source_side(format!("Failed to read {}", path.display()), e)
            })?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])
                .await
                .map_err(|e| CofferError::sink_side("Failed to write get destination", e))?;
            copied += n as u64;
        }
        dest.flush()
            .await
            .map_err(|e| CofferError::sink_side("Failed to flush get destination", e))?;
        debug!(bytes = copied, "Get complete");
        Ok(())
    }

    #[instrument(skip(self), fields(location = %location))]
    async fn delete(&self, location: &StorageLocation) -> Result<()> {
        let path = self.object_path(location)?;
        fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                CofferError::NotFound {
                    key: location.storage_id.clone(),
                }
            } else {
                CofferError::storage(format!("Failed to delete {}", path.display()), e)
            }
        })?;
        discard(&path.with_extension(SIDECAR_EXT)).await;
        debug!("Deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn iterator(&self, bucket_prefix: Option<&str>) -> Result<StorageIterator> {
        let prefix = bucket_prefix.unwrap_or_default().to_string();
        if !is_bucket_prefix(&prefix) {
            return Err(CofferError::invalid(format!("invalid bucket prefix: {prefix}")));
        }
        let walker = Walker {
            bucket_length: self.bucket_length,
            prefix,
            stack: vec![Frame {
                dir: self.content_dir.clone(),
                bucket: String::new(),
                entries: None,
            }],
        };
        let stream = futures::stream::try_unfold(walker, |mut walker| async move {
            let next = walker.next().await?;
            Ok::<_, CofferError>(next.map(|meta| (meta, walker)))
        });
        Ok(stream.boxed())
    }
}

/// One directory level of an in-progress scan. Entries are listed on first visit.
struct Frame {
    dir: PathBuf,
    bucket: String,
    entries: Option<VecDeque<String>>,
}

/// Lazy depth-first walk of the content tree in sorted name order.
struct Walker {
    bucket_length: usize,
    prefix: String,
    stack: Vec<Frame>,
}

impl Walker {
    async fn next(&mut self) -> Result<Option<StorageMetadata>> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            if frame.entries.is_none() {
                frame.entries = Some(read_sorted(&frame.dir).await?);
            }
            let Some(name) = frame.entries.as_mut().and_then(VecDeque::pop_front) else {
                self.stack.pop();
                continue;
            };
            let path = frame.dir.join(&name);

            if frame.bucket.len() < self.bucket_length {
                if name.len() != 1 || !BUCKET_CHARS.contains(name.as_str()) {
                    continue;
                }
                let bucket = format!("{}{}", frame.bucket, name);
                if !(bucket.starts_with(&self.prefix) || self.prefix.starts_with(&bucket)) {
                    continue;
                }
                self.stack.push(Frame {
                    dir: path,
                    bucket,
                    entries: None,
                });
                continue;
            }

            if !frame.bucket.starts_with(&self.prefix)
                || Path::new(&name).extension().is_some_and(|ext| ext == SIDECAR_EXT)
            {
                continue;
            }
            let location = StorageLocation::new(
                format!("{STORAGE_ID_SCHEME}:{name}"),
                Some(frame.bucket.clone()),
            );
            match read_metadata(&path, location).await? {
                Some(meta) => return Ok(Some(meta)),
                // deleted after the directory was listed
                None => continue,
            }
        }
    }
}

/// Sorted entry names of `dir`; a missing directory is empty.
async fn read_sorted(dir: &Path) -> Result<VecDeque<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => {
            return Err(CofferError::storage(
                format!("Failed to read directory {}", dir.display()),
                e,
            ))
        }
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| {
        CofferError::storage(
            format!("Failed to read directory entry in {}", dir.display()),
            e,
        )
    })? {
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names.into())
}

/// Build the metadata of a published object, or `None` if it vanished.
async fn read_metadata(path: &Path, location: StorageLocation) -> Result<Option<StorageMetadata>> {
    let file_meta = match fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CofferError::storage(
                format!("Failed to stat {}", path.display()),
                e,
            ))
        }
    };
    let sidecar_path = path.with_extension(SIDECAR_EXT);
    let raw = match fs::read(&sidecar_path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CofferError::storage(
                format!("Failed to read {}", sidecar_path.display()),
                e,
            ))
        }
    };
    let sidecar: Sidecar = serde_json::from_slice(&raw).map_err(|e| {
        CofferError::Serialization(format!("{}: {e}", sidecar_path.display()))
    })?;

    let mut meta = StorageMetadata::new(location, sidecar.content_checksum, file_meta.len());
    meta.artifact_uri = Some(sidecar.artifact_uri);
    meta.content_last_modified = file_meta
        .modified()
        .ok()
        .map(|t| truncate_millis(DateTime::<Utc>::from(t)));
    Ok(Some(meta))
}

async fn write_sidecar(path: &Path, sidecar: &Sidecar) -> Result<()> {
    let data =
        serde_json::to_vec(sidecar).map_err(|e| CofferError::Serialization(e.to_string()))?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| CofferError::storage(format!("Failed to create {}", path.display()), e))?;
    file.write_all(&data)
        .await
        .map_err(|e| CofferError::storage(format!("Failed to write {}", path.display()), e))?;
    file.sync_all()
        .await
        .map_err(|e| CofferError::storage(format!("Failed to sync {}", path.display()), e))
}

async fn modified_time(path: &Path) -> Result<Option<DateTime<Utc>>> {
    let meta = fs::metadata(path)
        .await
        .map_err(|e| CofferError::storage(format!("Failed to stat {}", path.display()), e))?;
    Ok(meta
        .modified()
        .ok()
        .map(|t| truncate_millis(DateTime::<Utc>::from(t))))
}

/// Remove a staged file if it is still there.
async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed staged file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove staged file"),
    }
}

fn link_error(e: std::io::Error, location: &StorageLocation, target: &Path) -> CofferError {
    if e.kind() == ErrorKind::AlreadyExists {
        CofferError::InvariantViolation {
            message: format!("storage id collision on put: {location}"),
        }
    } else {
        CofferError::storage(format!("Failed to publish {}", target.display()), e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_adapter(bucket_length: usize) -> (FsAdapter, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = FsConfig::new(tmp.path());
        config.bucket_length = bucket_length;
        let adapter = FsAdapter::new(&config).await.unwrap();
        (adapter, tmp)
    }

    async fn put_bytes(adapter: &FsAdapter, uri: &str, data: &[u8]) -> StorageMetadata {
        let mut source = data;
        adapter
            .put(&NewArtifact::new(uri), &mut source)
            .await
            .unwrap()
    }

    async fn get_bytes(adapter: &FsAdapter, location: &StorageLocation) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        adapter.get(location, &mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (adapter, _tmp) = test_adapter(3).await;
        let meta = put_bytes(&adapter, "cadc:TEST/a.fits", b"hello").await;
        assert_eq!(meta.content_length(), 5);
        assert_eq!(meta.content_checksum(), &DigestAlgorithm::Sha256.checksum(b"hello"));
        assert_eq!(meta.artifact_uri.as_deref(), Some("cadc:TEST/a.fits"));
        assert!(meta.content_last_modified.is_some());

        let bucket = meta.storage_location().storage_bucket.clone().unwrap();
        assert_eq!(bucket, partition(&meta.storage_location().storage_id, 3));

        assert_eq!(get_bytes(&adapter, meta.storage_location()).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_get_without_bucket() {
        let (adapter, _tmp) = test_adapter(2).await;
        let meta = put_bytes(&adapter, "cadc:TEST/a", b"abc").await;
        let bare = StorageLocation::new(meta.storage_location().storage_id.clone(), None);
        assert_eq!(get_bytes(&adapter, &bare).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let (adapter, _tmp) = test_adapter(2).await;
        let missing = StorageLocation::new(format!("uuid:{}", Uuid::new_v4()), None);
        let result = get_bytes(&adapter, &missing).await;
        assert!(matches!(result, Err(CofferError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_rejects_foreign_storage_id() {
        let (adapter, _tmp) = test_adapter(2).await;
        let bad = StorageLocation::new("uuid:../../etc/passwd", None);
        assert!(matches!(
            get_bytes(&adapter, &bad).await,
            Err(CofferError::InvalidArgument { .. })
        ));
        let other = StorageLocation::new("ceph:abc", None);
        assert!(adapter.delete(&other).await.is_err());
    }

    #[tokio::test]
    async fn test_delete() {
        let (adapter, _tmp) = test_adapter(2).await;
        let meta = put_bytes(&adapter, "cadc:TEST/a", b"abc").await;
        adapter.delete(meta.storage_location()).await.unwrap();
        assert!(matches!(
            get_bytes(&adapter, meta.storage_location()).await,
            Err(CofferError::NotFound { .. })
        ));
        assert!(matches!(
            adapter.delete(meta.storage_location()).await,
            Err(CofferError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_staging_is_empty_after_put() {
        let (adapter, _tmp) = test_adapter(2).await;
        put_bytes(&adapter, "cadc:TEST/a", b"abc").await;
        let mut source: &[u8] = b"abc";
        let bad = NewArtifact::new("cadc:TEST/b").with_length(4);
        assert!(adapter.put(&bad, &mut source).await.is_err());
        assert!(read_sorted(adapter.txn_dir()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cutouts_unsupported() {
        let (adapter, _tmp) = test_adapter(2).await;
        let meta = put_bytes(&adapter, "cadc:TEST/a", b"abc").await;
        let mut out = Vec::new();
        let result = adapter
            .get_cutouts(meta.storage_location(), &mut out, &["[1]".to_string()])
            .await;
        assert!(matches!(result, Err(CofferError::Unsupported { .. })));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_new_requires_existing_root() {
        let tmp = TempDir::new().unwrap();
        let config = FsConfig::new(tmp.path().join("missing"));
        let result = FsAdapter::new(&config).await;
        assert!(matches!(result, Err(CofferError::StoreUnavailable { .. })));
    }
}
