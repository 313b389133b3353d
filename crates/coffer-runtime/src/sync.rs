//! File sync: copy an artifact's bytes into this site from remote endpoints.
//!
//! A [`FileSyncJob`] asks an [`EndpointResolver`] where the bytes of one
//! artifact can be downloaded, streams them from those endpoints through an
//! [`EndpointFetcher`] into the site's byte storage, and finally records
//! the new storage location on the artifact with a forced put.
//!
//! Per endpoint, failures are handled as follows:
//!
//! | failure                                   | action                       |
//! |-------------------------------------------|------------------------------|
//! | endpoint reports not found                | drop endpoint for good       |
//! | transient open or source read failure     | try next endpoint            |
//! | checksum or length mismatch               | try next endpoint            |
//! | local store write failure                 | end this pass, retry later   |
//! | anything else                             | abandon the job              |
//!
//! Passes are separated by the configured retry delays.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use coffer_core::error::{CofferError, TransferSide};
use coffer_core::{NewArtifact, Result, StorageMetadata, SyncConfig};

use crate::site::Site;

/// A readable byte stream opened on a remote endpoint.
pub type ByteSource = Box<dyn AsyncRead + Unpin + Send>;

/// Negotiates download endpoints for an artifact.
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    /// Candidate download URLs for `artifact_uri`, in preference order.
    async fn resolve(&self, artifact_uri: &str) -> Result<Vec<Url>>;
}

/// Opens download endpoints.
#[async_trait]
pub trait EndpointFetcher: Send + Sync {
    /// Open `endpoint` for reading. A missing resource is [`CofferError::NotFound`].
    async fn open(&self, endpoint: &Url) -> Result<ByteSource>;
}

/// How a sync job ended.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Bytes stored and location recorded.
    Synced(StorageMetadata),
    /// The resolver offered no usable endpoint.
    NoEndpoints,
    /// Every pass failed on transient errors.
    Exhausted { passes: usize },
    /// A non-retryable failure ended the job.
    Abandoned(CofferError),
}

/// What to do after one endpoint failed.
enum Next {
    Endpoint,
    DropEndpoint,
    EndPass,
    Abandon,
}

fn classify_open(e: &CofferError) -> Next {
    match e {
        CofferError::NotFound { .. } => Next::DropEndpoint,
        e if e.is_transient() => Next::Endpoint,
        _ => Next::Abandon,
    }
}

fn classify_put(e: &CofferError) -> Next {
    match e {
        CofferError::Transfer {
            side: TransferSide::Source,
            ..
        } => Next::Endpoint,
        CofferError::ChecksumMismatch { .. } | CofferError::LengthMismatch { .. } => Next::Endpoint,
        CofferError::Transfer { .. } | CofferError::Storage { .. } => Next::EndPass,
        _ => Next::Abandon,
    }
}

/// Sync the bytes of one artifact into a site.
pub struct FileSyncJob {
    artifact_uri: String,
    site: Arc<Site>,
    resolver: Arc<dyn EndpointResolver>,
    fetcher: Arc<dyn EndpointFetcher>,
    config: SyncConfig,
}

impl FileSyncJob {
    pub fn new(
        artifact_uri: impl Into<String>,
        site: Arc<Site>,
        resolver: Arc<dyn EndpointResolver>,
        fetcher: Arc<dyn EndpointFetcher>,
    ) -> Self {
        let config = site.config.sync.clone();
        Self {
            artifact_uri: artifact_uri.into(),
            site,
            resolver,
            fetcher,
            config,
        }
    }

    /// Override the retry policy taken from the site configuration.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the job.
    ///
    /// Errors are returned only for a missing artifact or an unusable
    /// metadata store; every transfer result is reported as a [`SyncOutcome`].
    #[instrument(skip(self), fields(uri = %self.artifact_uri))]
    pub async fn run(&self) -> Result<SyncOutcome> {
        let uri = self.artifact_uri.clone();
        let artifact = self
            .site
            .with_dao(move |dao| dao.get_by_uri(&uri))
            .await?
            .ok_or_else(|| CofferError::NotFound {
                key: self.artifact_uri.clone(),
            })?;

        let mut endpoints = match self.resolver.resolve(&self.artifact_uri).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                error!(error = %e, "Transfer negotiation failed");
                return Ok(SyncOutcome::Abandoned(e));
            }
        };
        if endpoints.is_empty() {
            warn!("No download endpoints");
            return Ok(SyncOutcome::NoEndpoints);
        }

        let request = NewArtifact::new(artifact.uri())
            .with_checksum(artifact.content_checksum().clone())
            .with_length(artifact.content_length());

        let passes = self.config.retry_delays.len() + 1;
        for pass in 0..passes {
            if pass > 0 {
                let delay = self.config.retry_delays[pass - 1];
                debug!(pass, ?delay, "Waiting before retry");
                tokio::time::sleep(delay).await;
            }
            match self.sync_pass(&request, &mut endpoints).await {
                Ok(Some(meta)) => return self.record(meta).await,
                Ok(None) if endpoints.is_empty() => {
                    warn!("All endpoints reported not found");
                    return Ok(SyncOutcome::NoEndpoints);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Sync abandoned");
                    return Ok(SyncOutcome::Abandoned(e));
                }
            }
        }
        warn!(passes, "Sync failed after all retries");
        Ok(SyncOutcome::Exhausted { passes })
    }

    /// One pass over the remaining endpoints.
    async fn sync_pass(
        &self,
        request: &NewArtifact,
        endpoints: &mut Vec<Url>,
    ) -> Result<Option<StorageMetadata>> {
        let mut index = 0;
        while index < endpoints.len() {
            let endpoint = endpoints[index].clone();
            let result = match self.fetcher.open(&endpoint).await {
                Ok(mut source) => self
                    .site
                    .storage
                    .put(request, source.as_mut())
                    .await
                    .map_err(|e| (e, classify_put as fn(&CofferError) -> Next)),
                Err(e) => Err((e, classify_open as fn(&CofferError) -> Next)),
            };
            let (e, classify) = match result {
                Ok(meta) => {
                    info!(endpoint = %endpoint, location = %meta.storage_location(), "Bytes stored");
                    return Ok(Some(meta));
                }
                Err(failure) => failure,
            };
            match classify(&e) {
                Next::Endpoint => {
                    info!(endpoint = %endpoint, error = %e, "Endpoint failed, trying next");
                    index += 1;
                }
                Next::DropEndpoint => {
                    info!(endpoint = %endpoint, error = %e, "Removing endpoint");
                    endpoints.remove(index);
                }
                Next::EndPass => {
                    warn!(endpoint = %endpoint, error = %e, "Store write failed");
                    return Ok(None);
                }
                Next::Abandon => return Err(e),
            }
        }
        Ok(None)
    }

    /// Record the new storage location on the artifact.
    async fn record(&self, meta: StorageMetadata) -> Result<SyncOutcome> {
        let uri = self.artifact_uri.clone();
        let location = meta.storage_location().clone();
        let recorded = self
            .site
            .with_dao(move |dao| match dao.get_by_uri(&uri)? {
                Some(mut current) => {
                    current.storage_location = Some(location);
                    dao.put(&mut current, true)?;
                    Ok(true)
                }
                None => Ok(false),
            })
            .await?;

        if recorded {
            info!(location = %meta.storage_location(), "Artifact synced");
            return Ok(SyncOutcome::Synced(meta));
        }

        // the artifact was deleted while the bytes were in flight
        warn!(location = %meta.storage_location(), "Artifact gone, removing stored bytes");
        if let Err(e) = self.site.storage.delete(meta.storage_location()).await {
            warn!(error = %e, "Failed to remove orphaned bytes");
        }
        Ok(SyncOutcome::Abandoned(CofferError::NotFound {
            key: self.artifact_uri.clone(),
        }))
    }
}
