//! The Artifact entity: the metadata record for one archived item.
//!
//! An [`Artifact`] carries two groups of fields. The *content identity*
//! fields (uri, content checksum, content last-modified, content length,
//! content type and encoding) describe the bytes and are covered by the
//! meta checksum. The *operational* annotations (storage location and site
//! locations) record where copies live; they may change freely without
//! affecting the meta checksum.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checksum::{Checksum, DigestAlgorithm};
use crate::error::CofferError;
use crate::partition::{partition, URI_BUCKET_LENGTH};
use crate::types::{SiteLocation, StorageLocation};
use crate::Result;

/// Metadata record for one archived item, identified by its `uri`.
///
/// Equality and hashing consider the `uri` only. Deserialization goes
/// through [`Artifact::restore`], so it rejects what construction rejects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ArtifactRecord")]
pub struct Artifact {
    id: Uuid,
    uri: String,
    uri_bucket: String,
    content_checksum: Checksum,
    content_last_modified: DateTime<Utc>,
    content_length: u64,

    /// MIME type of the content, if known.
    pub content_type: Option<String>,
    /// Content encoding (e.g. `gzip`), if any.
    pub content_encoding: Option<String>,

    last_modified: Option<DateTime<Utc>>,
    meta_checksum: Option<Checksum>,

    /// Where the bytes live in this site's byte storage. Not content identity.
    pub storage_location: Option<StorageLocation>,
    /// Sites known to hold a copy. Not content identity.
    pub site_locations: BTreeSet<SiteLocation>,
}

impl Artifact {
    /// Create a new artifact with a freshly generated id.
    ///
    /// `content_last_modified` is kept at millisecond precision.
    pub fn new(
        uri: impl Into<String>,
        content_checksum: Checksum,
        content_last_modified: DateTime<Utc>,
        content_length: u64,
    ) -> Result<Self> {
        Self::restore(
            Uuid::new_v4(),
            uri,
            content_checksum,
            content_last_modified,
            content_length,
        )
    }

    /// Reconstruct an artifact with a known id, e.g. from persisted state.
    pub fn restore(
        id: Uuid,
        uri: impl Into<String>,
        content_checksum: Checksum,
        content_last_modified: DateTime<Utc>,
        content_length: u64,
    ) -> Result<Self> {
        let uri = uri.into();
        validate_artifact_uri(&uri)?;
        if content_length == 0 {
            return Err(CofferError::invalid(format!(
                "invalid Artifact.contentLength: {content_length}"
            )));
        }
        let uri_bucket = partition(&uri, URI_BUCKET_LENGTH);
        Ok(Self {
            id,
            uri,
            uri_bucket,
            content_checksum,
            content_last_modified: truncate_millis(content_last_modified),
            content_length,
            content_type: None,
            content_encoding: None,
            last_modified: None,
            meta_checksum: None,
            storage_location: None,
            site_locations: BTreeSet::new(),
        })
    }

    /// Surrogate key.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Logical identifier.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Five character partition tag of the uri.
    pub fn bucket(&self) -> &str {
        &self.uri_bucket
    }

    pub fn content_checksum(&self) -> &Checksum {
        &self.content_checksum
    }

    pub fn content_last_modified(&self) -> DateTime<Utc> {
        self.content_last_modified
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Entity timestamp assigned by the metadata store on each put.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    /// Meta checksum assigned by the metadata store on each put.
    pub fn meta_checksum(&self) -> Option<&Checksum> {
        self.meta_checksum.as_ref()
    }

    /// Replace the content identity fields, keeping id, uri and annotations.
    pub fn set_content(
        &mut self,
        content_checksum: Checksum,
        content_last_modified: DateTime<Utc>,
        content_length: u64,
    ) -> Result<()> {
        if content_length == 0 {
            return Err(CofferError::invalid(format!(
                "invalid Artifact.contentLength: {content_length}"
            )));
        }
        self.content_checksum = content_checksum;
        self.content_last_modified = truncate_millis(content_last_modified);
        self.content_length = content_length;
        Ok(())
    }

    /// Record the entity state a metadata store assigned during `put`.
    pub fn set_entity_state(
        &mut self,
        id: Uuid,
        last_modified: DateTime<Utc>,
        meta_checksum: Checksum,
    ) {
        self.id = id;
        self.last_modified = Some(last_modified);
        self.meta_checksum = Some(meta_checksum);
    }

    /// Digest the content identity fields with `algorithm`.
    ///
    /// Fields are fed in a fixed order: uri, content checksum, content
    /// last-modified (big-endian epoch millis), content length (big-endian),
    /// content type, content encoding. Absent optional fields contribute
    /// nothing. Operational annotations are never part of the digest.
    pub fn compute_meta_checksum(&self, algorithm: DigestAlgorithm) -> Checksum {
        let mut d = algorithm.digester();
        d.update(self.uri.as_bytes());
        d.update(self.content_checksum.to_string().as_bytes());
        d.update(&self.content_last_modified.timestamp_millis().to_be_bytes());
        d.update(&(self.content_length as i64).to_be_bytes());
        if let Some(t) = &self.content_type {
            d.update(t.as_bytes());
        }
        if let Some(e) = &self.content_encoding {
            d.update(e.as_bytes());
        }
        d.finish()
    }
}

/// Serialized form of an [`Artifact`], checked on the way in.
#[derive(Deserialize)]
struct ArtifactRecord {
    id: Uuid,
    uri: String,
    content_checksum: Checksum,
    content_last_modified: DateTime<Utc>,
    content_length: u64,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content_encoding: Option<String>,
    #[serde(default)]
    last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    meta_checksum: Option<Checksum>,
    #[serde(default)]
    storage_location: Option<StorageLocation>,
    #[serde(default)]
    site_locations: BTreeSet<SiteLocation>,
}

impl TryFrom<ArtifactRecord> for Artifact {
    type Error = CofferError;

    fn try_from(record: ArtifactRecord) -> Result<Self> {
        let mut artifact = Artifact::restore(
            record.id,
            record.uri,
            record.content_checksum,
            record.content_last_modified,
            record.content_length,
        )?;
        artifact.content_type = record.content_type;
        artifact.content_encoding = record.content_encoding;
        artifact.last_modified = record.last_modified;
        artifact.meta_checksum = record.meta_checksum;
        artifact.storage_location = record.storage_location;
        artifact.site_locations = record.site_locations;
        Ok(artifact)
    }
}

impl PartialEq for Artifact {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for Artifact {}

impl Hash for Artifact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Artifact[{}][{}]", self.id, self.uri)
    }
}

/// Check that `uri` is usable as an artifact identifier.
///
/// A scheme and a non-empty path are required; whitespace, queries and
/// fragments are rejected.
pub fn validate_artifact_uri(uri: &str) -> Result<()> {
    if uri.chars().any(char::is_whitespace) {
        return Err(CofferError::invalid(format!(
            "invalid Artifact.uri (whitespace): {uri}"
        )));
    }
    let parsed = url::Url::parse(uri)
        .map_err(|e| CofferError::invalid(format!("invalid Artifact.uri {uri}: {e}")))?;
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(CofferError::invalid(format!(
            "invalid Artifact.uri (query or fragment): {uri}"
        )));
    }
    let path = parsed.path().trim_start_matches('/');
    if path.is_empty() {
        return Err(CofferError::invalid(format!(
            "invalid Artifact.uri (no path): {uri}"
        )));
    }
    Ok(())
}

/// Drop sub-millisecond precision so timestamps survive persistence unchanged.
pub fn truncate_millis(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Artifact {
        Artifact::new(
            "cadc:ARCHIVE/filename",
            Checksum::parse("md5:d41d8cd98f00b204e9800998ecf8427e").unwrap(),
            Utc::now(),
            666,
        )
        .unwrap()
    }

    #[test]
    fn test_new_computes_bucket() {
        let a = sample();
        assert_eq!(a.bucket(), partition("cadc:ARCHIVE/filename", 5));
        assert!(a.last_modified().is_none());
        assert!(a.meta_checksum().is_none());
    }

    #[test]
    fn test_rejects_zero_length() {
        let err = Artifact::new(
            "cadc:ARCHIVE/filename",
            Checksum::parse("md5:d41d8cd98f00b204e9800998ecf8427e").unwrap(),
            Utc::now(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, CofferError::InvalidArgument { .. }));
    }

    #[test]
    fn test_uri_validation() {
        assert!(validate_artifact_uri("cadc:ARCHIVE/filename").is_ok());
        assert!(validate_artifact_uri("mast:HST/product/x.fits").is_ok());
        assert!(validate_artifact_uri("ARCHIVE/filename").is_err());
        assert!(validate_artifact_uri("cadc:ARCHIVE/file name").is_err());
        assert!(validate_artifact_uri("cadc:ARCHIVE/f?x=1").is_err());
        assert!(validate_artifact_uri("cadc:").is_err());
    }

    #[test]
    fn test_equality_by_uri_only() {
        let a = sample();
        let mut b = sample();
        assert_ne!(a.id(), b.id());
        b.content_type = Some("text/plain".into());
        assert_eq!(a, b);
    }

    #[test]
    fn test_meta_checksum_ignores_operational_fields() {
        let mut a = sample();
        let before = a.compute_meta_checksum(DigestAlgorithm::Sha256);
        a.storage_location = Some(StorageLocation::new("uuid:abc", Some("0a".into())));
        a.site_locations.insert(SiteLocation::new(Uuid::new_v4()));
        assert_eq!(before, a.compute_meta_checksum(DigestAlgorithm::Sha256));
    }

    #[test]
    fn test_meta_checksum_tracks_content_fields() {
        let mut a = sample();
        let before = a.compute_meta_checksum(DigestAlgorithm::Sha256);
        a.content_type = Some("application/fits".into());
        let typed = a.compute_meta_checksum(DigestAlgorithm::Sha256);
        assert_ne!(before, typed);
        a.content_encoding = Some("gzip".into());
        assert_ne!(typed, a.compute_meta_checksum(DigestAlgorithm::Sha256));
    }

    #[test]
    fn test_meta_checksum_repeatable() {
        let a = sample();
        assert_eq!(
            a.compute_meta_checksum(DigestAlgorithm::Sha512),
            a.compute_meta_checksum(DigestAlgorithm::Sha512)
        );
        assert_eq!(
            a.compute_meta_checksum(DigestAlgorithm::Sha512).algorithm(),
            "sha512"
        );
    }

    #[test]
    fn test_content_last_modified_millis() {
        let a = sample();
        assert_eq!(a.content_last_modified().timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_deserialize_keeps_annotations() {
        let mut a = sample();
        a.content_type = Some("application/fits".into());
        a.storage_location = Some(StorageLocation::new("uuid:x", Some("abcd".into())));
        let json = serde_json::to_string(&a).unwrap();
        let back: Artifact = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), a.id());
        assert_eq!(back.bucket(), a.bucket());
        assert_eq!(back.content_type, a.content_type);
        assert_eq!(back.storage_location, a.storage_location);
    }

    #[test]
    fn test_deserialize_rejects_invalid_content() {
        let json = serde_json::to_value(sample()).unwrap();

        let mut zero = json.clone();
        zero["content_length"] = serde_json::json!(0);
        assert!(serde_json::from_value::<Artifact>(zero).is_err());

        let mut bad_uri = json.clone();
        bad_uri["uri"] = serde_json::json!("no scheme here");
        assert!(serde_json::from_value::<Artifact>(bad_uri).is_err());

        // the bucket is always recomputed from the uri
        let mut forged = json;
        forged["uri_bucket"] = serde_json::json!("zzzzz");
        let back: Artifact = serde_json::from_value(forged).unwrap();
        assert_eq!(back.bucket(), sample().bucket());
    }
}
