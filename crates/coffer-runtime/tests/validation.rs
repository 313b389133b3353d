//! Integration test: reconciling byte storage with the inventory.
//!
//! Builds a site where storage and inventory disagree in every way the
//! validator distinguishes, checks the merge, repairs through the default
//! listener and checks that a second run finds nothing left to do.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;

use coffer_core::partition::partition;
use coffer_core::{
    Artifact, Checksum, NewArtifact, Result, SiteConfig, StorageLocation, StorageMetadata,
};
use coffer_runtime::{
    DefaultListener, Divergence, ReportPolicy, Site, ValidateEventListener, ValidatePolicy,
    ValidateSummary, Validator,
};

/// Records what it sees and does nothing.
#[derive(Default)]
struct RecordingPolicy {
    seen: Mutex<Vec<Divergence>>,
}

#[async_trait]
impl ValidatePolicy for RecordingPolicy {
    async fn resolve(&self, divergence: Divergence, _listener: &dyn ValidateEventListener) -> Result<()> {
        self.seen.lock().unwrap().push(divergence);
        Ok(())
    }
}

/// Storage wins: adopt orphaned objects, resync lost bytes, refresh stale rows.
struct RepairPolicy;

#[async_trait]
impl ValidatePolicy for RepairPolicy {
    async fn resolve(&self, divergence: Divergence, listener: &dyn ValidateEventListener) -> Result<()> {
        match &divergence {
            Divergence::StorageOnly(storage) => listener.create_artifact(storage).await,
            Divergence::ArtifactOnly(artifact) => listener.mark_as_new(artifact).await,
            Divergence::Matched { artifact, storage } if !divergence.is_consistent() => {
                listener.update_artifact(artifact, storage).await
            }
            Divergence::Matched { .. } => Ok(()),
        }
    }
}

struct Fixture {
    site: Arc<Site>,
    consistent: Artifact,
    orphan: StorageMetadata,
    lost: Artifact,
    stale: Artifact,
    _tmp: tempfile::TempDir,
}

async fn store(site: &Site, uri: &str, data: &[u8]) -> StorageMetadata {
    let mut source = data;
    site.storage
        .put(&NewArtifact::new(uri), &mut source)
        .await
        .expect("put should succeed")
}

async fn record(site: &Site, mut artifact: Artifact) -> Artifact {
    site.with_dao(move |dao| {
        dao.put(&mut artifact, true)?;
        Ok(artifact)
    })
    .await
    .unwrap()
}

fn artifact_for(uri: &str, checksum: Checksum, length: u64, location: StorageLocation) -> Artifact {
    let mut a = Artifact::new(uri, checksum, Utc::now(), length).unwrap();
    a.storage_location = Some(location);
    a
}

async fn fixture() -> Fixture {
    let tmp = tempfile::TempDir::new().unwrap();
    let site = Arc::new(Site::open(SiteConfig::new(tmp.path())).await.unwrap());

    let meta = store(&site, "cadc:TEST/consistent", b"consistent bytes").await;
    let consistent = record(
        &site,
        artifact_for(
            "cadc:TEST/consistent",
            meta.content_checksum().clone(),
            meta.content_length(),
            meta.storage_location().clone(),
        ),
    )
    .await;

    let orphan = store(&site, "cadc:TEST/orphan", b"nobody knows me").await;

    let missing_id = "uuid:00000000-0000-4000-8000-000000000001".to_string();
    let missing_bucket = partition(&missing_id, site.config.storage.bucket_length);
    let lost = record(
        &site,
        artifact_for(
            "cadc:TEST/lost",
            Checksum::parse("md5:d41d8cd98f00b204e9800998ecf8427e").unwrap(),
            10,
            StorageLocation::new(missing_id, Some(missing_bucket)),
        ),
    )
    .await;

    let meta = store(&site, "cadc:TEST/stale", b"new content").await;
    let stale = record(
        &site,
        artifact_for(
            "cadc:TEST/stale",
            Checksum::parse("md5:0123456789abcdef0123456789abcdef").unwrap(),
            3,
            meta.storage_location().clone(),
        ),
    )
    .await;

    Fixture {
        site,
        consistent,
        orphan,
        lost,
        stale,
        _tmp: tmp,
    }
}

fn validator(site: &Arc<Site>, policy: Arc<dyn ValidatePolicy>) -> Validator {
    Validator::new(
        Arc::clone(site),
        policy,
        Arc::new(DefaultListener::new(Arc::clone(site))),
    )
}

#[tokio::test]
async fn test_merge_classifies_every_divergence() {
    let f = fixture().await;
    let policy = Arc::new(RecordingPolicy::default());
    let summary = validator(&f.site, policy.clone()).run(None).await.unwrap();
    assert_eq!(
        summary,
        ValidateSummary {
            storage_only: 1,
            artifact_only: 1,
            matched: 2,
            inconsistent: 1,
        }
    );

    let seen = policy.seen.lock().unwrap();
    let locations: Vec<StorageLocation> = seen
        .iter()
        .map(|d| match d {
            Divergence::StorageOnly(s) => s.storage_location().clone(),
            Divergence::ArtifactOnly(a) => a.storage_location.clone().unwrap(),
            Divergence::Matched { storage, .. } => storage.storage_location().clone(),
        })
        .collect();
    let mut sorted = locations.clone();
    sorted.sort();
    assert_eq!(locations, sorted, "divergences arrive in location order");

    for d in seen.iter() {
        match d {
            Divergence::StorageOnly(s) => assert_eq!(s.storage_location(), f.orphan.storage_location()),
            Divergence::ArtifactOnly(a) => assert_eq!(a.id(), f.lost.id()),
            Divergence::Matched { artifact, .. } if d.is_consistent() => {
                assert_eq!(artifact.id(), f.consistent.id())
            }
            Divergence::Matched { artifact, .. } => assert_eq!(artifact.id(), f.stale.id()),
        }
    }
}

#[tokio::test]
async fn test_repair_then_revalidate_is_clean() {
    let f = fixture().await;
    validator(&f.site, Arc::new(RepairPolicy)).run(None).await.unwrap();

    let summary = validator(&f.site, Arc::new(ReportPolicy)).run(None).await.unwrap();
    assert_eq!(
        summary,
        ValidateSummary {
            storage_only: 0,
            artifact_only: 0,
            matched: 3,
            inconsistent: 0,
        }
    );

    // the lost artifact is queued for sync again
    let unstored: Vec<Artifact> = f
        .site
        .unstored_artifacts(None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(unstored.len(), 1);
    assert_eq!(unstored[0].id(), f.lost.id());

    // the orphan was adopted under the uri recorded with its bytes
    let adopted = f
        .site
        .with_dao(|dao| dao.get_by_uri("cadc:TEST/orphan"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(adopted.storage_location.as_ref(), Some(f.orphan.storage_location()));
    assert_eq!(adopted.content_checksum(), f.orphan.content_checksum());

    // the stale row now describes the stored bytes and kept its identity
    let id = f.stale.id();
    let refreshed = f.site.with_dao(move |dao| dao.get(id)).await.unwrap().unwrap();
    assert_eq!(refreshed.content_length(), b"new content".len() as u64);
}

#[tokio::test]
async fn test_prefix_restricts_both_sides() {
    let f = fixture().await;
    let bucket = f
        .orphan
        .storage_location()
        .storage_bucket
        .clone()
        .unwrap();
    let prefix = &bucket[..1];

    let expected = [
        f.consistent.storage_location.clone().unwrap(),
        f.orphan.storage_location().clone(),
        f.lost.storage_location.clone().unwrap(),
        f.stale.storage_location.clone().unwrap(),
    ]
    .iter()
    .filter(|l| l.storage_bucket.as_deref().is_some_and(|b| b.starts_with(prefix)))
    .count();

    let policy = Arc::new(RecordingPolicy::default());
    let summary = validator(&f.site, policy.clone()).run(Some(prefix)).await.unwrap();
    assert!(summary.storage_only >= 1);
    assert_eq!(
        summary.storage_only + summary.artifact_only + summary.matched,
        expected
    );
}

#[tokio::test]
async fn test_listener_deletes_and_replaces() {
    let f = fixture().await;
    let listener = DefaultListener::new(Arc::clone(&f.site));

    listener.delete_stored(&f.orphan).await.unwrap();
    // already gone is fine
    listener.delete_stored(&f.orphan).await.unwrap();
    let objects: Vec<StorageMetadata> = f.site.storage.iterator(None).await.unwrap().try_collect().await.unwrap();
    assert_eq!(objects.len(), 2);

    listener.delete_artifact(&f.lost).await.unwrap();
    let id = f.lost.id();
    assert!(f.site.with_dao(move |dao| dao.get(id)).await.unwrap().is_none());

    let stale_meta = objects
        .iter()
        .find(|m| Some(m.storage_location()) == f.stale.storage_location.as_ref())
        .unwrap()
        .clone();
    listener.replace_artifact(&f.stale, &stale_meta).await.unwrap();
    let replaced = f
        .site
        .with_dao(|dao| dao.get_by_uri("cadc:TEST/stale"))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(replaced.id(), f.stale.id());
    assert_eq!(replaced.content_checksum(), stale_meta.content_checksum());
}

#[tokio::test]
async fn test_location_without_bucket_matches_stored_object() {
    let tmp = tempfile::TempDir::new().unwrap();
    let site = Arc::new(Site::open(SiteConfig::new(tmp.path())).await.unwrap());
    let bucket_length = site.config.storage.bucket_length;

    let mut bucketless = Vec::new();
    for i in 0..6 {
        let uri = format!("cadc:TEST/legacy{i}");
        let meta = store(&site, &uri, format!("legacy bytes {i}").as_bytes()).await;
        let id = meta.storage_location().storage_id.clone();
        let a = record(
            &site,
            artifact_for(
                &uri,
                meta.content_checksum().clone(),
                meta.content_length(),
                StorageLocation::new(id, None),
            ),
        )
        .await;
        bucketless.push(a);
    }
    let meta = store(&site, "cadc:TEST/current", b"current bytes").await;
    record(
        &site,
        artifact_for(
            "cadc:TEST/current",
            meta.content_checksum().clone(),
            meta.content_length(),
            meta.storage_location().clone(),
        ),
    )
    .await;
    let missing_id = "uuid:00000000-0000-4000-8000-000000000002";
    let gone = record(
        &site,
        artifact_for(
            "cadc:TEST/gone",
            Checksum::parse("md5:d41d8cd98f00b204e9800998ecf8427e").unwrap(),
            10,
            StorageLocation::new(missing_id, None),
        ),
    )
    .await;

    let policy = Arc::new(RecordingPolicy::default());
    let summary = validator(&site, policy.clone()).run(None).await.unwrap();
    assert_eq!(
        summary,
        ValidateSummary {
            storage_only: 0,
            artifact_only: 1,
            matched: 7,
            inconsistent: 0,
        }
    );
    let seen = policy.seen.lock().unwrap();
    for d in seen.iter() {
        match d {
            Divergence::ArtifactOnly(a) => assert_eq!(a.id(), gone.id()),
            Divergence::Matched { artifact, storage } => assert_eq!(
                artifact.storage_location.as_ref().unwrap().storage_id,
                storage.storage_location().storage_id
            ),
            Divergence::StorageOnly(s) => panic!("unexpected storage-only {}", s.storage_location()),
        }
    }
    drop(seen);

    // a prefix selects bucketless rows by the bucket their id partitions to
    let target = bucketless[0].storage_location.clone().unwrap().storage_id;
    let prefix = partition(&target, bucket_length)[..1].to_string();
    let policy = Arc::new(RecordingPolicy::default());
    let summary = validator(&site, policy.clone()).run(Some(&prefix)).await.unwrap();
    assert_eq!(summary.storage_only, 0);
    assert!(summary.matched >= 1);
    assert!(policy.seen.lock().unwrap().iter().any(|d| matches!(
        d,
        Divergence::Matched { artifact, .. } if artifact.id() == bucketless[0].id()
    )));

    // repairing keeps every bucketless artifact attached to its bytes
    validator(&site, Arc::new(RepairPolicy)).run(None).await.unwrap();
    let unstored: Vec<Artifact> = site
        .unstored_artifacts(None)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(unstored.len(), 1);
    assert_eq!(unstored[0].id(), gone.id());
}

#[tokio::test]
async fn test_other_algorithm_with_matching_length_is_consistent() {
    let tmp = tempfile::TempDir::new().unwrap();
    let site = Arc::new(Site::open(SiteConfig::new(tmp.path())).await.unwrap());
    let meta = store(&site, "cadc:TEST/md5", b"hello").await;
    record(
        &site,
        artifact_for(
            "cadc:TEST/md5",
            Checksum::parse("md5:5d41402abc4b2a76b9719d911017c592").unwrap(),
            5,
            meta.storage_location().clone(),
        ),
    )
    .await;

    let summary = validator(&site, Arc::new(ReportPolicy)).run(None).await.unwrap();
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.inconsistent, 0);
}
