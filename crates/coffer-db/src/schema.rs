//! SQLite schema, connection setup and row mapping for the artifact table.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use coffer_core::{Artifact, Checksum, CofferError, DaoConfig, Result, StorageLocation};

/// Current schema version, kept in `PRAGMA user_version`.
pub(crate) const SCHEMA_VERSION: i64 = 1;

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS artifact (
    id                    TEXT PRIMARY KEY,
    uri                   TEXT NOT NULL UNIQUE,
    uri_bucket            TEXT NOT NULL,
    content_checksum      TEXT NOT NULL,
    content_last_modified INTEGER NOT NULL,
    content_length        INTEGER NOT NULL,
    content_type          TEXT,
    content_encoding      TEXT,
    site_locations        TEXT NOT NULL DEFAULT '[]',
    storage_id            TEXT,
    storage_bucket        TEXT,
    last_modified         INTEGER NOT NULL,
    meta_checksum         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS artifact_stored
    ON artifact (storage_bucket IS NULL, COALESCE(storage_bucket, ''), storage_id)
    WHERE storage_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS artifact_unstored
    ON artifact (last_modified, id)
    WHERE storage_id IS NULL;
CREATE INDEX IF NOT EXISTS artifact_uri_bucket
    ON artifact (uri_bucket, uri);
";

/// Column list shared by every artifact query, in [`RawRow::from_row`] order.
pub(crate) const COLUMNS: &str = "id, uri, uri_bucket, content_checksum, content_last_modified, \
     content_length, content_type, content_encoding, site_locations, storage_id, storage_bucket, \
     last_modified, meta_checksum";

/// Map a SQLite failure into the error taxonomy.
///
/// Failures that mean the database cannot be used at all become
/// [`CofferError::StoreUnavailable`]; anything else is a storage error.
pub(crate) fn db_error(context: impl Into<String>, e: rusqlite::Error) -> CofferError {
    let unusable = matches!(
        &e,
        rusqlite::Error::SqliteFailure(f, _) if matches!(
            f.code,
            ErrorCode::CannotOpen
                | ErrorCode::PermissionDenied
                | ErrorCode::ReadOnly
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::FileLockingProtocolFailed
        )
    );
    if unusable {
        CofferError::unavailable(context, e)
    } else {
        CofferError::storage(context, e)
    }
}

/// Open a session on the configured database and make sure the schema exists.
pub(crate) fn open_connection(config: &DaoConfig) -> Result<Connection> {
    let path = &config.database;
    let mut conn = Connection::open(path)
        .map_err(|e| db_error(format!("Failed to open {}", path.display()), e))?;
    conn.busy_timeout(config.busy_timeout)
        .map_err(|e| db_error("Failed to set busy timeout", e))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| db_error("Failed to enable WAL", e))?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| db_error("Failed to set synchronous mode", e))?;
    init_schema(&mut conn, config)?;
    Ok(conn)
}

fn schema_version(conn: &Connection) -> Result<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| db_error("Failed to read schema version", e))
}

fn init_schema(conn: &mut Connection, config: &DaoConfig) -> Result<()> {
    match schema_version(conn)? {
        SCHEMA_VERSION => return Ok(()),
        0 => {}
        other => {
            return Err(CofferError::Config {
                message: format!(
                    "{} has schema version {other}, expected {SCHEMA_VERSION}",
                    config.database.display()
                ),
            })
        }
    }

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| db_error("Failed to start schema transaction", e))?;
    tx.execute_batch(CREATE_TABLES)
        .map_err(|e| db_error("Failed to create schema", e))?;
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| db_error("Failed to record schema version", e))?;
    tx.commit()
        .map_err(|e| db_error("Failed to commit schema", e))?;
    info!(database = %config.database.display(), version = SCHEMA_VERSION, "Artifact schema created");
    Ok(())
}

pub(crate) fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| CofferError::Internal {
        message: format!("timestamp out of range: {millis}"),
    })
}

/// One artifact row as stored, before validation.
#[derive(Debug, Clone)]
pub(crate) struct RawRow {
    pub id: String,
    pub uri: String,
    pub uri_bucket: String,
    pub content_checksum: String,
    pub content_last_modified: i64,
    pub content_length: i64,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub site_locations: String,
    pub storage_id: Option<String>,
    pub storage_bucket: Option<String>,
    pub last_modified: i64,
    pub meta_checksum: String,
}

impl RawRow {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uri: row.get(1)?,
            uri_bucket: row.get(2)?,
            content_checksum: row.get(3)?,
            content_last_modified: row.get(4)?,
            content_length: row.get(5)?,
            content_type: row.get(6)?,
            content_encoding: row.get(7)?,
            site_locations: row.get(8)?,
            storage_id: row.get(9)?,
            storage_bucket: row.get(10)?,
            last_modified: row.get(11)?,
            meta_checksum: row.get(12)?,
        })
    }

    pub fn into_artifact(self) -> Result<Artifact> {
        let id = Uuid::parse_str(&self.id).map_err(|e| CofferError::Internal {
            message: format!("corrupt artifact id {}: {e}", self.id),
        })?;
        let length = u64::try_from(self.content_length).map_err(|_| CofferError::Internal {
            message: format!("corrupt content length for {}: {}", self.uri, self.content_length),
        })?;
        let mut artifact = Artifact::restore(
            id,
            self.uri,
            Checksum::parse(&self.content_checksum)?,
            from_millis(self.content_last_modified)?,
            length,
        )?;
        artifact.content_type = self.content_type;
        artifact.content_encoding = self.content_encoding;
        artifact.site_locations = serde_json::from_str(&self.site_locations)
            .map_err(|e| CofferError::Serialization(format!("site_locations of {id}: {e}")))?;
        artifact.storage_location = self
            .storage_id
            .map(|storage_id| StorageLocation::new(storage_id, self.storage_bucket));
        artifact.set_entity_state(
            id,
            from_millis(self.last_modified)?,
            Checksum::parse(&self.meta_checksum)?,
        );
        debug!(artifact = %artifact, "Loaded artifact row");
        Ok(artifact)
    }
}
