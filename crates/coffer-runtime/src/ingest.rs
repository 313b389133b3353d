//! Storing new bytes and recording the artifact that points at them.

use chrono::{DateTime, Utc};
use tokio::io::AsyncRead;
use tracing::{info, instrument, warn};

use coffer_core::error::CofferError;
use coffer_core::{Artifact, NewArtifact, Result, StorageLocation, StorageMetadata};

use crate::site::Site;

/// Store `source` and put an artifact for it, replacing any artifact with
/// the same uri.
///
/// If the artifact cannot be recorded the new bytes are removed again.
/// Bytes of a replaced artifact are removed once the new row is in place.
#[instrument(skip(site, source, content_type), fields(uri = %request.uri))]
pub async fn ingest(
    site: &Site,
    request: NewArtifact,
    source: &mut (dyn AsyncRead + Unpin + Send),
    content_last_modified: DateTime<Utc>,
    content_type: Option<String>,
) -> Result<StorageMetadata> {
    let meta = site.storage.put(&request, source).await?;
    let location = meta.storage_location().clone();

    let mut artifact = match Artifact::new(
        request.uri,
        meta.content_checksum().clone(),
        content_last_modified,
        meta.content_length(),
    ) {
        Ok(a) => a,
        Err(e) => {
            discard(site, &location).await;
            return Err(e);
        }
    };
    artifact.content_type = content_type;
    artifact.storage_location = Some(location.clone());

    let recorded = site
        .with_dao(move |dao| {
            let previous = dao
                .get_by_uri(artifact.uri())?
                .and_then(|a| a.storage_location);
            dao.put(&mut artifact, true)?;
            Ok(previous)
        })
        .await;
    let previous = match recorded {
        Ok(previous) => previous,
        Err(e) => {
            warn!(location = %location, error = %e, "Failed to record artifact");
            discard(site, &location).await;
            return Err(e);
        }
    };

    if let Some(old) = previous.filter(|old| *old != location) {
        match site.storage.delete(&old).await {
            Ok(()) | Err(CofferError::NotFound { .. }) => {}
            Err(e) => warn!(location = %old, error = %e, "Failed to remove replaced bytes"),
        }
    }
    info!(location = %location, checksum = %meta.content_checksum(), "Stored");
    Ok(meta)
}

/// Remove bytes no artifact will point at.
async fn discard(site: &Site, location: &StorageLocation) {
    if let Err(e) = site.storage.delete(location).await {
        warn!(location = %location, error = %e, "Failed to remove unrecorded bytes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use coffer_core::SiteConfig;
    use futures::TryStreamExt;

    async fn stored_objects(site: &Site) -> Vec<StorageMetadata> {
        site.storage.iterator(None).await.unwrap().try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn test_ingest_records_and_replaces() {
        let tmp = tempfile::TempDir::new().unwrap();
        let site = Site::open(SiteConfig::new(tmp.path())).await.unwrap();

        let mut first: &[u8] = b"first";
        let old = ingest(&site, NewArtifact::new("cadc:TEST/a"), &mut first, Utc::now(), None)
            .await
            .unwrap();
        let mut second: &[u8] = b"second";
        let new = ingest(
            &site,
            NewArtifact::new("cadc:TEST/a"),
            &mut second,
            Utc::now(),
            Some("text/plain".into()),
        )
        .await
        .unwrap();
        assert_ne!(old.storage_location(), new.storage_location());

        let objects = stored_objects(&site).await;
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].storage_location(), new.storage_location());

        let artifact = site
            .with_dao(|dao| dao.get_by_uri("cadc:TEST/a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(artifact.storage_location.as_ref(), Some(new.storage_location()));
        assert_eq!(artifact.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_failed_record_removes_new_bytes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = SiteConfig::new(tmp.path());
        config.database.busy_timeout = Duration::from_millis(50);
        let database = config.database.database.clone();
        let site = Site::open(config).await.unwrap();

        // another writer holds the database for the whole put
        let writer = rusqlite::Connection::open(&database).unwrap();
        writer.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let mut source: &[u8] = b"never recorded";
        let result = ingest(&site, NewArtifact::new("cadc:TEST/b"), &mut source, Utc::now(), None).await;
        assert!(result.is_err());
        assert!(stored_objects(&site).await.is_empty());

        writer.execute_batch("ROLLBACK").unwrap();
        assert!(site
            .with_dao(|dao| dao.get_by_uri("cadc:TEST/b"))
            .await
            .unwrap()
            .is_none());
    }
}
