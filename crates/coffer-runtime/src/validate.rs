//! Validation: reconcile byte storage with the artifact inventory.
//!
//! A [`Validator`] walks one bucket prefix of the site in storage-location
//! order, merging the storage adapter's listing with the stored-artifact
//! scan. Every position where the two sides are compared becomes a
//! [`Divergence`], which is handed to an injected [`ValidatePolicy`]. The
//! policy decides what, if anything, to do by calling the six operations
//! of a [`ValidateEventListener`]; the validator itself never acts.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use coffer_core::error::CofferError;
use coffer_core::partition::partition;
use coffer_core::{Artifact, Result, StorageLocation, StorageMetadata};

use crate::site::Site;

/// One comparison between byte storage and the inventory.
#[derive(Debug, Clone)]
pub enum Divergence {
    /// A stored object no artifact points at.
    StorageOnly(StorageMetadata),
    /// An artifact whose stored object is missing.
    ArtifactOnly(Artifact),
    /// Both sides agree on the location; contents may still differ.
    Matched {
        artifact: Artifact,
        storage: StorageMetadata,
    },
}

impl Divergence {
    /// For [`Divergence::Matched`]: whether length agrees and, when both
    /// sides use the same digest algorithm, checksum agrees.
    pub fn is_consistent(&self) -> bool {
        match self {
            Divergence::Matched { artifact, storage } => {
                let (expected, actual) = (artifact.content_checksum(), storage.content_checksum());
                artifact.content_length() == storage.content_length()
                    && (expected.algorithm() != actual.algorithm() || expected == actual)
            }
            _ => false,
        }
    }
}

/// Operations available to a [`ValidatePolicy`].
#[async_trait]
pub trait ValidateEventListener: Send + Sync {
    /// Create an artifact for a stored object.
    async fn create_artifact(&self, storage: &StorageMetadata) -> Result<()>;

    /// Delete a stored object.
    async fn delete_stored(&self, storage: &StorageMetadata) -> Result<()>;

    /// Delete an artifact.
    async fn delete_artifact(&self, artifact: &Artifact) -> Result<()>;

    /// Clear the artifact's storage location so it is synced again.
    async fn mark_as_new(&self, artifact: &Artifact) -> Result<()>;

    /// Replace the artifact with one describing the stored object.
    async fn replace_artifact(&self, artifact: &Artifact, storage: &StorageMetadata) -> Result<()>;

    /// Refresh the artifact's metadata from the stored object.
    async fn update_artifact(&self, artifact: &Artifact, storage: &StorageMetadata) -> Result<()>;
}

/// Decides how to react to each divergence.
#[async_trait]
pub trait ValidatePolicy: Send + Sync {
    async fn resolve(&self, divergence: Divergence, listener: &dyn ValidateEventListener) -> Result<()>;
}

/// A policy that only logs what it sees.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReportPolicy;

#[async_trait]
impl ValidatePolicy for ReportPolicy {
    async fn resolve(&self, divergence: Divergence, _listener: &dyn ValidateEventListener) -> Result<()> {
        match &divergence {
            Divergence::StorageOnly(s) => {
                info!(location = %s.storage_location(), uri = ?s.artifact_uri, "stored object without artifact")
            }
            Divergence::ArtifactOnly(a) => info!(artifact = %a, "artifact without stored object"),
            Divergence::Matched { artifact, .. } if !divergence.is_consistent() => {
                info!(artifact = %artifact, "artifact and stored object disagree")
            }
            Divergence::Matched { artifact, .. } => debug!(artifact = %artifact, "consistent"),
        }
        Ok(())
    }
}

/// Counts from one validation run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValidateSummary {
    pub storage_only: usize,
    pub artifact_only: usize,
    pub matched: usize,
    pub inconsistent: usize,
}

/// Listener operations carried out against a site.
pub struct DefaultListener {
    site: Arc<Site>,
}

impl DefaultListener {
    pub fn new(site: Arc<Site>) -> Self {
        Self { site }
    }

    fn artifact_from(storage: &StorageMetadata) -> Result<Artifact> {
        let uri = storage.artifact_uri.clone().ok_or_else(|| {
            CofferError::invalid(format!("no artifact uri recorded for {}", storage.storage_location()))
        })?;
        let mut artifact = Artifact::new(
            uri,
            storage.content_checksum().clone(),
            storage.content_last_modified.unwrap_or_else(Utc::now),
            storage.content_length(),
        )?;
        artifact.storage_location = Some(storage.storage_location().clone());
        Ok(artifact)
    }
}

#[async_trait]
impl ValidateEventListener for DefaultListener {
    async fn create_artifact(&self, storage: &StorageMetadata) -> Result<()> {
        let mut artifact = Self::artifact_from(storage)?;
        debug!(artifact = %artifact, "create artifact");
        self.site.with_dao(move |dao| dao.put(&mut artifact, true)).await
    }

    async fn delete_stored(&self, storage: &StorageMetadata) -> Result<()> {
        debug!(location = %storage.storage_location(), "delete stored object");
        match self.site.storage.delete(storage.storage_location()).await {
            Err(CofferError::NotFound { .. }) => Ok(()),
            other => other,
        }
    }

    async fn delete_artifact(&self, artifact: &Artifact) -> Result<()> {
        debug!(artifact = %artifact, "delete artifact");
        let id = artifact.id();
        self.site.with_dao(move |dao| dao.delete(id)).await
    }

    async fn mark_as_new(&self, artifact: &Artifact) -> Result<()> {
        debug!(artifact = %artifact, "mark as new");
        let mut artifact = artifact.clone();
        artifact.storage_location = None;
        self.site.with_dao(move |dao| dao.put(&mut artifact, true)).await
    }

    async fn replace_artifact(&self, artifact: &Artifact, storage: &StorageMetadata) -> Result<()> {
        debug!(artifact = %artifact, location = %storage.storage_location(), "replace artifact");
        let id = artifact.id();
        let mut replacement = Self::artifact_from(storage)?;
        self.site
            .with_dao(move |dao| {
                dao.delete(id)?;
                dao.put(&mut replacement, true)
            })
            .await
    }

    async fn update_artifact(&self, artifact: &Artifact, storage: &StorageMetadata) -> Result<()> {
        debug!(artifact = %artifact, location = %storage.storage_location(), "update artifact");
        let mut artifact = artifact.clone();
        let content_last_modified = storage
            .content_last_modified
            .unwrap_or_else(|| artifact.content_last_modified());
        artifact.set_content(
            storage.content_checksum().clone(),
            content_last_modified,
            storage.content_length(),
        )?;
        artifact.storage_location = Some(storage.storage_location().clone());
        self.site.with_dao(move |dao| dao.put(&mut artifact, true)).await
    }
}

/// Merges byte storage and the inventory for one bucket prefix.
pub struct Validator {
    site: Arc<Site>,
    policy: Arc<dyn ValidatePolicy>,
    listener: Arc<dyn ValidateEventListener>,
}

impl Validator {
    pub fn new(
        site: Arc<Site>,
        policy: Arc<dyn ValidatePolicy>,
        listener: Arc<dyn ValidateEventListener>,
    ) -> Self {
        Self {
            site,
            policy,
            listener,
        }
    }

    /// Validate everything whose storage bucket starts with `bucket_prefix`.
    ///
    /// An artifact recorded without a storage bucket is compared under the
    /// bucket its storage id partitions to.
    #[instrument(skip(self))]
    pub async fn run(&self, bucket_prefix: Option<&str>) -> Result<ValidateSummary> {
        let mut stored = self.site.storage.iterator(bucket_prefix).await?;
        let mut artifacts = InventorySide::open(&self.site, bucket_prefix).await?;
        let mut summary = ValidateSummary::default();

        let mut next_stored = pull(&mut stored).await?;
        loop {
            let order = match (&next_stored, artifacts.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(s), Some(location)) => s.storage_location().cmp(location),
            };
            let divergence = match (order, next_stored.take()) {
                (Ordering::Less, Some(s)) => {
                    next_stored = pull(&mut stored).await?;
                    Divergence::StorageOnly(s)
                }
                (Ordering::Equal, Some(s)) => {
                    next_stored = pull(&mut stored).await?;
                    Divergence::Matched {
                        artifact: artifacts.take().await?,
                        storage: s,
                    }
                }
                (_, s) => {
                    next_stored = s;
                    Divergence::ArtifactOnly(artifacts.take().await?)
                }
            };

            match &divergence {
                Divergence::StorageOnly(_) => summary.storage_only += 1,
                Divergence::ArtifactOnly(_) => summary.artifact_only += 1,
                Divergence::Matched { .. } => {
                    summary.matched += 1;
                    if !divergence.is_consistent() {
                        summary.inconsistent += 1;
                    }
                }
            }
            if let Err(e) = self.policy.resolve(divergence, self.listener.as_ref()).await {
                warn!(error = %e, "Validation policy failed");
                return Err(e);
            }
        }

        info!(
            storage_only = summary.storage_only,
            artifact_only = summary.artifact_only,
            matched = summary.matched,
            inconsistent = summary.inconsistent,
            "Validation complete"
        );
        Ok(summary)
    }
}

/// The inventory side of the merge in storage-location order.
///
/// The stored scan yields bucketed rows first, then rows without a bucket.
/// The latter are loaded up front, keyed by their computed bucket, and
/// interleaved with the bucketed rows.
struct InventorySide {
    bucketed: Option<BoxStream<'static, Result<Artifact>>>,
    head: Option<(StorageLocation, Artifact)>,
    unbucketed: BTreeMap<StorageLocation, Artifact>,
}

impl InventorySide {
    async fn open(site: &Site, bucket_prefix: Option<&str>) -> Result<Self> {
        let bucket_length = site.config.storage.bucket_length;
        let prefix = bucket_prefix.unwrap_or("");
        let mut unbucketed = BTreeMap::new();
        let mut rows = site.unbucketed_artifacts().await?;
        while let Some(artifact) = pull(&mut rows).await? {
            let location = location_of(&artifact)?;
            let bucket = partition(&location.storage_id, bucket_length);
            if bucket.starts_with(prefix) {
                let key = StorageLocation::new(location.storage_id.clone(), Some(bucket));
                unbucketed.insert(key, artifact);
            }
        }
        if !unbucketed.is_empty() {
            debug!(count = unbucketed.len(), "artifacts without a storage bucket");
        }

        let mut side = Self {
            bucketed: Some(site.stored_artifacts(bucket_prefix).await?),
            head: None,
            unbucketed,
        };
        side.advance().await?;
        Ok(side)
    }

    async fn advance(&mut self) -> Result<()> {
        let Some(stream) = self.bucketed.as_mut() else {
            return Ok(());
        };
        match pull(stream).await? {
            Some(artifact) if location_of(&artifact)?.storage_bucket.is_some() => {
                self.head = Some((location_of(&artifact)?.clone(), artifact));
            }
            _ => self.bucketed = None,
        }
        Ok(())
    }

    fn head_first(&self) -> bool {
        match (&self.head, self.unbucketed.keys().next()) {
            (Some((head, _)), Some(first)) => head <= first,
            (head, _) => head.is_some(),
        }
    }

    fn peek(&self) -> Option<&StorageLocation> {
        if self.head_first() {
            self.head.as_ref().map(|(location, _)| location)
        } else {
            self.unbucketed.keys().next()
        }
    }

    /// Remove the artifact at [`peek`](Self::peek).
    async fn take(&mut self) -> Result<Artifact> {
        let next = if self.head_first() {
            let next = self.head.take().map(|(_, artifact)| artifact);
            self.advance().await?;
            next
        } else {
            self.unbucketed.pop_first().map(|(_, artifact)| artifact)
        };
        next.ok_or_else(|| CofferError::Internal {
            message: "inventory side of the merge is exhausted".to_string(),
        })
    }
}

async fn pull<T>(stream: &mut BoxStream<'static, Result<T>>) -> Result<Option<T>> {
    stream.next().await.transpose()
}

fn location_of(artifact: &Artifact) -> Result<&StorageLocation> {
    artifact.storage_location.as_ref().ok_or_else(|| CofferError::Internal {
        message: format!("stored scan returned {artifact} without a location"),
    })
}
