//! Storage-side value types shared by the metadata store and byte storage.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksum::Checksum;

/// Where an object's bytes live: an opaque, scheme-qualified content
/// address plus an optional partition tag.
///
/// Locations order by bucket (absent buckets last), then storage id. This is
/// the order both the metadata store and byte storage stream locations in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLocation {
    /// Globally unique content address, e.g. `uuid:0f8fad5b-...`.
    pub storage_id: String,
    /// Partition tag used for bucketed scans.
    pub storage_bucket: Option<String>,
}

impl StorageLocation {
    pub fn new(storage_id: impl Into<String>, storage_bucket: Option<String>) -> Self {
        Self {
            storage_id: storage_id.into(),
            storage_bucket,
        }
    }
}

impl Ord for StorageLocation {
    fn cmp(&self, other: &Self) -> Ordering {
        let bucket = match (&self.storage_bucket, &other.storage_bucket) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        bucket.then_with(|| self.storage_id.cmp(&other.storage_id))
    }
}

impl PartialOrd for StorageLocation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.storage_bucket {
            Some(b) => write!(f, "{}/{}", b, self.storage_id),
            None => write!(f, "{}", self.storage_id),
        }
    }
}

/// A site known to hold a copy of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteLocation(pub Uuid);

impl SiteLocation {
    pub fn new(site_id: Uuid) -> Self {
        Self(site_id)
    }

    pub fn site_id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SiteLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A put request to byte storage: the target uri plus optional values the
/// received bytes are validated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArtifact {
    pub uri: String,
    pub content_checksum: Option<Checksum>,
    pub content_length: Option<u64>,
}

impl NewArtifact {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content_checksum: None,
            content_length: None,
        }
    }

    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.content_checksum = Some(checksum);
        self
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }
}

/// Byte storage's view of a stored object.
///
/// Produced by storage adapters; callers receive it from `put` and
/// `iterator` and never assemble one themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetadata {
    storage_location: StorageLocation,
    content_checksum: Checksum,
    content_length: u64,
    /// Logical uri the object was stored for, if the adapter records it.
    pub artifact_uri: Option<String>,
    /// Time the object was published.
    pub content_last_modified: Option<DateTime<Utc>>,
}

impl StorageMetadata {
    /// For storage adapter implementations.
    pub fn new(storage_location: StorageLocation, content_checksum: Checksum, content_length: u64) -> Self {
        Self {
            storage_location,
            content_checksum,
            content_length,
            artifact_uri: None,
            content_last_modified: None,
        }
    }

    pub fn storage_location(&self) -> &StorageLocation {
        &self.storage_location
    }

    pub fn content_checksum(&self) -> &Checksum {
        &self.content_checksum
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_order_bucket_then_id() {
        let mut locs = vec![
            StorageLocation::new("uuid:b", None),
            StorageLocation::new("uuid:z", Some("1".into())),
            StorageLocation::new("uuid:a", None),
            StorageLocation::new("uuid:a", Some("2".into())),
            StorageLocation::new("uuid:c", Some("1".into())),
        ];
        locs.sort();
        let ids: Vec<String> = locs.iter().map(|l| l.to_string()).collect();
        assert_eq!(ids, vec!["1/uuid:c", "1/uuid:z", "2/uuid:a", "uuid:a", "uuid:b"]);
    }

    #[test]
    fn test_new_artifact_builder() {
        let n = NewArtifact::new("cadc:TEST/x")
            .with_checksum(Checksum::parse("sha256:00").unwrap())
            .with_length(1);
        assert_eq!(n.content_length, Some(1));
        assert_eq!(n.content_checksum.unwrap().algorithm(), "sha256");
    }

    #[test]
    fn test_site_location_serializes_as_uuid() {
        let id = Uuid::new_v4();
        let json = serde_json::to_string(&SiteLocation::new(id)).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
