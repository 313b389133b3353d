//! The artifact metadata store.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use coffer_core::{Artifact, CofferError, DaoConfig, DigestAlgorithm, Result};

use crate::include::IncludeClauses;
use crate::iterator::{ArtifactIterator, Selection};
use crate::schema::{db_error, from_millis, open_connection, RawRow, COLUMNS};

/// Digest used for stored meta checksums.
pub const META_CHECKSUM_ALGORITHM: DigestAlgorithm = DigestAlgorithm::Sha256;

/// One session on the artifact store.
///
/// A session is a single SQLite connection. Use [`duplicate`](Self::duplicate)
/// for an independent session over the same database, e.g. to mutate rows
/// from one task while another iterates.
pub struct ArtifactDao {
    config: DaoConfig,
    conn: Connection,
}

impl std::fmt::Debug for ArtifactDao {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactDao")
            .field("database", &self.config.database)
            .finish()
    }
}

impl ArtifactDao {
    /// Open a session, creating the database and schema if needed.
    pub fn open(config: &DaoConfig) -> Result<Self> {
        config.validate()?;
        let conn = open_connection(config)?;
        info!(database = %config.database.display(), "ArtifactDao opened");
        Ok(Self {
            config: config.clone(),
            conn,
        })
    }

    /// An independent session over the same configuration.
    pub fn duplicate(&self) -> Result<Self> {
        Self::open(&self.config)
    }

    pub fn config(&self) -> &DaoConfig {
        &self.config
    }

    /// Look up an artifact by id.
    #[instrument(skip(self))]
    pub fn get(&self, id: Uuid) -> Result<Option<Artifact>> {
        self.query_one("id", &id.to_string())
    }

    /// Look up an artifact by uri.
    #[instrument(skip(self))]
    pub fn get_by_uri(&self, uri: &str) -> Result<Option<Artifact>> {
        self.query_one("uri", uri)
    }

    fn query_one(&self, column: &str, value: &str) -> Result<Option<Artifact>> {
        let sql = format!("SELECT {COLUMNS} FROM artifact WHERE {column} = ?1");
        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .map_err(|e| db_error("Failed to prepare artifact query", e))?;
        let row = stmt
            .query_row(params![value], RawRow::from_row)
            .optional()
            .map_err(|e| db_error(format!("Failed to get artifact by {column}"), e))?;
        row.map(RawRow::into_artifact).transpose()
    }

    /// Insert or update the artifact with the same uri.
    ///
    /// Content identity fields are always written and the meta checksum and
    /// last-modified timestamp are recomputed. On update the stored storage
    /// location and site locations are only replaced when `force_update` is
    /// set; a first insert always records them. The assigned id, timestamp
    /// and meta checksum are written back to `artifact`.
    #[instrument(skip(self, artifact), fields(uri = %artifact.uri()))]
    pub fn put(&mut self, artifact: &mut Artifact, force_update: bool) -> Result<()> {
        let meta_checksum = artifact.compute_meta_checksum(META_CHECKSUM_ALGORITHM);
        let site_locations = serde_json::to_string(&artifact.site_locations)
            .map_err(|e| CofferError::Serialization(e.to_string()))?;
        let (storage_id, storage_bucket) = match &artifact.storage_location {
            Some(loc) => (Some(loc.storage_id.as_str()), loc.storage_bucket.as_deref()),
            None => (None, None),
        };
        let content_length = i64::try_from(artifact.content_length())
            .map_err(|_| CofferError::invalid("content length exceeds i64"))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_error("Failed to begin put transaction", e))?;

        let existing: Option<(String, i64)> = tx
            .query_row(
                "SELECT id, last_modified FROM artifact WHERE uri = ?1",
                params![artifact.uri()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| db_error("Failed to read existing artifact", e))?;

        let now = Utc::now().timestamp_millis();
        let (id, last_modified) = match &existing {
            Some((id, previous)) => {
                let id = Uuid::parse_str(id).map_err(|e| CofferError::Internal {
                    message: format!("corrupt artifact id {id}: {e}"),
                })?;
                (id, now.max(previous + 1))
            }
            None => (artifact.id(), now),
        };
        let id_text = id.to_string();
        let checksum_text = artifact.content_checksum().to_string();
        let content_last_modified = artifact.content_last_modified().timestamp_millis();
        let meta_text = meta_checksum.to_string();

        let written = match (&existing, force_update) {
            (None, _) => tx.execute(
                "INSERT INTO artifact (content_checksum, content_last_modified, content_length, \
                 content_type, content_encoding, last_modified, meta_checksum, \
                 id, uri, uri_bucket, site_locations, storage_id, storage_bucket) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    checksum_text,
                    content_last_modified,
                    content_length,
                    artifact.content_type,
                    artifact.content_encoding,
                    last_modified,
                    meta_text,
                    id_text,
                    artifact.uri(),
                    artifact.bucket(),
                    site_locations,
                    storage_id,
                    storage_bucket,
                ],
            ),
            (Some(_), true) => tx.execute(
                "UPDATE artifact SET content_checksum = ?1, content_last_modified = ?2, \
                 content_length = ?3, content_type = ?4, content_encoding = ?5, \
                 last_modified = ?6, meta_checksum = ?7, \
                 site_locations = ?9, storage_id = ?10, storage_bucket = ?11 \
                 WHERE id = ?8",
                params![
                    checksum_text,
                    content_last_modified,
                    content_length,
                    artifact.content_type,
                    artifact.content_encoding,
                    last_modified,
                    meta_text,
                    id_text,
                    site_locations,
                    storage_id,
                    storage_bucket,
                ],
            ),
            (Some(_), false) => tx.execute(
                "UPDATE artifact SET content_checksum = ?1, content_last_modified = ?2, \
                 content_length = ?3, content_type = ?4, content_encoding = ?5, \
                 last_modified = ?6, meta_checksum = ?7 \
                 WHERE id = ?8",
                params![
                    checksum_text,
                    content_last_modified,
                    content_length,
                    artifact.content_type,
                    artifact.content_encoding,
                    last_modified,
                    meta_text,
                    id_text,
                ],
            ),
        }
        .map_err(|e| db_error(format!("Failed to put {}", artifact.uri()), e))?;

        tx.commit()
            .map_err(|e| db_error("Failed to commit put", e))?;

        artifact.set_entity_state(id, from_millis(last_modified)?, meta_checksum);
        debug!(
            id = %id,
            inserted = existing.is_none(),
            rows = written,
            "Put artifact"
        );
        Ok(())
    }

    /// Remove the artifact with `id`. Missing rows are not an error.
    #[instrument(skip(self))]
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM artifact WHERE id = ?1", params![id.to_string()])
            .map_err(|e| db_error(format!("Failed to delete {id}"), e))?;
        debug!(deleted, "Delete artifact");
        Ok(())
    }

    /// Artifacts with a storage location, ordered by storage bucket (absent
    /// buckets last) then storage id, optionally restricted to storage
    /// buckets starting with `bucket_prefix`.
    pub fn stored_iterator(&self, bucket_prefix: Option<&str>) -> ArtifactIterator {
        ArtifactIterator::new(
            self.config.clone(),
            Selection::Stored {
                prefix: bucket_prefix.map(str::to_string),
            },
        )
    }

    /// Artifacts whose storage location has no storage bucket, by storage id.
    ///
    /// These rows sort after every bucketed row in [`stored_iterator`](Self::stored_iterator)
    /// and never match a non-empty bucket prefix there.
    pub fn unbucketed_iterator(&self) -> ArtifactIterator {
        ArtifactIterator::new(self.config.clone(), Selection::Unbucketed)
    }

    /// Artifacts without a storage location, oldest `last_modified` first,
    /// optionally restricted to uri buckets starting with `bucket_prefix`.
    pub fn unstored_iterator(&self, bucket_prefix: Option<&str>) -> ArtifactIterator {
        ArtifactIterator::new(
            self.config.clone(),
            Selection::Unstored {
                prefix: bucket_prefix.map(str::to_string),
            },
        )
    }

    /// Artifacts matching any of `clauses`, ordered by uri bucket then uri.
    pub fn included_iterator(&self, clauses: &IncludeClauses) -> ArtifactIterator {
        ArtifactIterator::new(
            self.config.clone(),
            Selection::Included {
                condition: clauses.to_condition(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use coffer_core::{Checksum, StorageLocation};
    use tempfile::TempDir;

    fn open_dao() -> (ArtifactDao, TempDir) {
        let tmp = TempDir::new().unwrap();
        let dao = ArtifactDao::open(&DaoConfig::new(tmp.path().join("inv.db"))).unwrap();
        (dao, tmp)
    }

    fn sample(uri: &str) -> Artifact {
        Artifact::new(
            uri,
            Checksum::parse("md5:d41d8cd98f00b204e9800998ecf8427e").unwrap(),
            Utc::now(),
            666,
        )
        .unwrap()
    }

    #[test]
    fn test_put_assigns_entity_state() {
        let (mut dao, _tmp) = open_dao();
        let mut a = sample("cadc:ARCHIVE/filename");
        dao.put(&mut a, false).unwrap();
        assert!(a.last_modified().is_some());
        assert_eq!(
            a.meta_checksum(),
            Some(&a.compute_meta_checksum(META_CHECKSUM_ALGORITHM))
        );
    }

    #[test]
    fn test_update_keeps_stored_id() {
        let (mut dao, _tmp) = open_dao();
        let mut first = sample("cadc:ARCHIVE/same");
        dao.put(&mut first, false).unwrap();

        let mut second = sample("cadc:ARCHIVE/same");
        assert_ne!(first.id(), second.id());
        dao.put(&mut second, false).unwrap();
        assert_eq!(second.id(), first.id());
        assert!(second.last_modified() > first.last_modified());
    }

    #[test]
    fn test_content_update_recomputes_meta_checksum() {
        let (mut dao, _tmp) = open_dao();
        let mut a = sample("cadc:ARCHIVE/changing");
        dao.put(&mut a, false).unwrap();
        let before = a.meta_checksum().cloned();

        a.set_content(
            Checksum::parse("md5:0123456789abcdef0123456789abcdef").unwrap(),
            Utc::now() - Duration::hours(1),
            42,
        )
        .unwrap();
        a.content_type = Some("text/plain".into());
        dao.put(&mut a, false).unwrap();

        let stored = dao.get(a.id()).unwrap().unwrap();
        assert_eq!(stored.content_length(), 42);
        assert_eq!(stored.content_type.as_deref(), Some("text/plain"));
        assert_ne!(stored.meta_checksum().cloned(), before);
        assert_eq!(
            stored.meta_checksum(),
            Some(&stored.compute_meta_checksum(META_CHECKSUM_ALGORITHM))
        );
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let (dao, _tmp) = open_dao();
        dao.delete(Uuid::new_v4()).unwrap();
    }

    #[test]
    fn test_first_put_records_location() {
        let (mut dao, _tmp) = open_dao();
        let mut a = sample("cadc:ARCHIVE/located");
        a.storage_location = Some(StorageLocation::new("uuid:x", Some("ab".into())));
        dao.put(&mut a, false).unwrap();
        let stored = dao.get_by_uri(a.uri()).unwrap().unwrap();
        assert_eq!(stored.storage_location, a.storage_location);
    }
}
