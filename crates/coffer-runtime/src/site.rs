//! A coffer storage site: byte storage plus its artifact inventory.
//!
//! [`Site`] is the main runtime entry point. It opens the filesystem
//! storage adapter and a metadata store session from one [`SiteConfig`]
//! and hands both to the jobs that run against the site.

use std::sync::{Arc, Mutex};

use futures::stream::{BoxStream, StreamExt};
use tracing::info;

use coffer_core::config::SiteConfig;
use coffer_core::error::CofferError;
use coffer_core::storage::StorageAdapter;
use coffer_core::{Artifact, Result};
use coffer_db::{ArtifactDao, ArtifactIterator, IncludeClauses};
use coffer_storage::FsAdapter;

/// Artifacts pulled from a blocking iterator per worker hop.
const STREAM_BATCH_SIZE: usize = 64;

/// One storage site.
///
/// The metadata session is shared behind a mutex and only ever used from
/// blocking worker threads (see [`Site::with_dao`]).
pub struct Site {
    /// Site configuration.
    pub config: SiteConfig,

    /// Byte storage for this site.
    pub storage: Arc<dyn StorageAdapter>,

    dao: Arc<Mutex<ArtifactDao>>,
}

impl Site {
    /// Open a site, creating the storage root and database if needed.
    pub async fn open(config: SiteConfig) -> Result<Self> {
        config.validate()?;
        let root = &config.storage.root;
        tokio::fs::create_dir_all(root).await.map_err(|e| {
            CofferError::unavailable(format!("Failed to create site root {}", root.display()), e)
        })?;
        let storage: Arc<dyn StorageAdapter> = Arc::new(FsAdapter::new(&config.storage).await?);

        let db_config = config.database.clone();
        let dao = blocking(move || ArtifactDao::open(&db_config)).await?;

        info!(
            root = %config.storage.root.display(),
            database = %config.database.database.display(),
            bucket_length = config.storage.bucket_length,
            "coffer site opened"
        );
        Ok(Self::from_parts(config, storage, dao))
    }

    /// Assemble a site from an already opened adapter and session.
    pub fn from_parts(config: SiteConfig, storage: Arc<dyn StorageAdapter>, dao: ArtifactDao) -> Self {
        Self {
            config,
            storage,
            dao: Arc::new(Mutex::new(dao)),
        }
    }

    /// Run `f` against the site's metadata session on a blocking thread.
    pub async fn with_dao<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ArtifactDao) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let dao = Arc::clone(&self.dao);
        blocking(move || {
            let mut guard = dao.lock().map_err(|_| CofferError::Internal {
                message: "metadata session lock poisoned".to_string(),
            })?;
            f(&mut guard)
        })
        .await
    }

    /// An independent metadata session over the same database.
    pub async fn dao_session(&self) -> Result<ArtifactDao> {
        self.with_dao(|dao| dao.duplicate()).await
    }

    /// Stored artifacts as an async stream, see [`ArtifactDao::stored_iterator`].
    pub async fn stored_artifacts(
        &self,
        bucket_prefix: Option<&str>,
    ) -> Result<BoxStream<'static, Result<Artifact>>> {
        let prefix = bucket_prefix.map(str::to_string);
        let iter = self
            .with_dao(move |dao| Ok(dao.stored_iterator(prefix.as_deref())))
            .await?;
        Ok(artifact_stream(iter))
    }

    /// Artifacts stored without a bucket, see [`ArtifactDao::unbucketed_iterator`].
    pub async fn unbucketed_artifacts(&self) -> Result<BoxStream<'static, Result<Artifact>>> {
        let iter = self.with_dao(|dao| Ok(dao.unbucketed_iterator())).await?;
        Ok(artifact_stream(iter))
    }

    /// Unstored artifacts as an async stream, see [`ArtifactDao::unstored_iterator`].
    pub async fn unstored_artifacts(
        &self,
        bucket_prefix: Option<&str>,
    ) -> Result<BoxStream<'static, Result<Artifact>>> {
        let prefix = bucket_prefix.map(str::to_string);
        let iter = self
            .with_dao(move |dao| Ok(dao.unstored_iterator(prefix.as_deref())))
            .await?;
        Ok(artifact_stream(iter))
    }

    /// Artifacts matching any of `clauses`, see [`ArtifactDao::included_iterator`].
    pub async fn included_artifacts(
        &self,
        clauses: IncludeClauses,
    ) -> Result<BoxStream<'static, Result<Artifact>>> {
        let iter = self
            .with_dao(move |dao| Ok(dao.included_iterator(&clauses)))
            .await?;
        Ok(artifact_stream(iter))
    }

    /// Log shutdown. Sessions close when the site is dropped.
    pub async fn shutdown(&self) {
        info!(root = %self.config.storage.root.display(), "coffer site shutting down");
    }
}

/// Run blocking work off the async executor.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CofferError::Internal {
            message: format!("Blocking task failed: {e}"),
        })?
}

/// Drive a blocking [`ArtifactIterator`] as an async stream.
///
/// The iterator is pulled in batches on blocking threads and closed when
/// the stream ends or is dropped.
pub fn artifact_stream(iter: ArtifactIterator) -> BoxStream<'static, Result<Artifact>> {
    futures::stream::unfold(Some(iter), |state| async move {
        let mut iter = state?;
        let joined = tokio::task::spawn_blocking(move || {
            let batch: Vec<Result<Artifact>> = iter.by_ref().take(STREAM_BATCH_SIZE).collect();
            (batch, iter)
        })
        .await;
        match joined {
            Ok((batch, _)) if batch.is_empty() => None,
            Ok((batch, iter)) => Some((batch, Some(iter))),
            Err(e) => Some((
                vec![Err(CofferError::Internal {
                    message: format!("Iterator task failed: {e}"),
                })],
                None,
            )),
        }
    })
    .flat_map(futures::stream::iter)
    .boxed()
}
