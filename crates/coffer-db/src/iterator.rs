//! Closeable, ordered artifact iteration.
//!
//! An [`ArtifactIterator`] owns its own database session. The session is
//! opened on the first pull and holds one read transaction until the
//! iterator is exhausted, closed or dropped. Under WAL journaling that
//! transaction is a stable snapshot which takes no lock that blocks other
//! sessions, including the session that created the iterator, from
//! reading or writing any row.
//!
//! Rows are fetched in keyset pages: each page query resumes strictly
//! after the last key yielded, so rows are never yielded twice.

use std::collections::VecDeque;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tracing::{debug, warn};

use coffer_core::partition::is_bucket_prefix;
use coffer_core::{Artifact, CofferError, DaoConfig, Result};

use crate::schema::{db_error, open_connection, RawRow, COLUMNS};

/// Which rows an iterator yields, and in which order.
#[derive(Debug, Clone)]
pub(crate) enum Selection {
    /// Rows with a storage location, by (bucket with nulls last, storage id),
    /// filtered on the storage bucket.
    Stored { prefix: Option<String> },
    /// Rows with a storage location but no storage bucket, by storage id.
    Unbucketed,
    /// Rows without a storage location, by (last modified, id), filtered on
    /// the uri bucket.
    Unstored { prefix: Option<String> },
    /// Rows matching an include condition, by (uri bucket, uri).
    Included { condition: String },
}

/// Key of the last row yielded.
#[derive(Debug, Clone)]
enum Cursor {
    Start,
    Stored {
        null_bucket: bool,
        bucket: String,
        storage_id: String,
    },
    Unbucketed {
        storage_id: String,
    },
    Unstored {
        last_modified: i64,
        id: String,
    },
    Included {
        uri_bucket: String,
        uri: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Pending,
    Open,
    Exhausted,
    Closed,
}

/// A lazy, forward-only sequence of artifacts backed by its own session.
///
/// Errors, including an unreachable database, are reported by the pull that
/// hits them. After an error, exhaustion or [`close`](Self::close) the
/// iterator yields nothing more.
pub struct ArtifactIterator {
    config: DaoConfig,
    selection: Selection,
    conn: Option<Connection>,
    page: VecDeque<RawRow>,
    cursor: Cursor,
    state: State,
}

impl ArtifactIterator {
    pub(crate) fn new(config: DaoConfig, selection: Selection) -> Self {
        Self {
            config,
            selection,
            conn: None,
            page: VecDeque::new(),
            cursor: Cursor::Start,
            state: State::Pending,
        }
    }

    /// Whether another artifact is available. False after close.
    pub fn has_next(&mut self) -> Result<bool> {
        match self.fill() {
            Ok(more) => Ok(more),
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Release the session. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        self.release();
        self.page.clear();
        self.state = State::Closed;
    }

    /// End the read transaction and drop the connection, keeping buffered rows.
    fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!(error = %e, "Failed to end iterator read transaction");
            }
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "Failed to close iterator session");
            }
            debug!("Iterator session released");
        }
    }

    /// Make sure at least one row is buffered, fetching a page if needed.
    fn fill(&mut self) -> Result<bool> {
        if !self.page.is_empty() {
            return Ok(true);
        }
        match self.state {
            State::Exhausted | State::Closed => return Ok(false),
            State::Pending => {
                self.validate()?;
                let conn = open_connection(&self.config)?;
                conn.execute_batch("BEGIN DEFERRED")
                    .map_err(|e| db_error("Failed to begin iterator transaction", e))?;
                self.conn = Some(conn);
                self.state = State::Open;
            }
            State::Open => {}
        }

        let rows = self.fetch_page()?;
        if rows.len() < self.config.fetch_size {
            self.state = State::Exhausted;
            self.release();
        }
        if let Some(last) = rows.last() {
            self.cursor = self.cursor_after(last);
        }
        self.page.extend(rows);
        Ok(!self.page.is_empty())
    }

    fn validate(&self) -> Result<()> {
        match &self.selection {
            Selection::Stored { prefix: Some(p) } | Selection::Unstored { prefix: Some(p) }
                if !is_bucket_prefix(p) =>
            {
                Err(CofferError::invalid(format!("invalid bucket prefix: {p}")))
            }
            _ => Ok(()),
        }
    }

    fn cursor_after(&self, row: &RawRow) -> Cursor {
        match &self.selection {
            Selection::Stored { .. } => Cursor::Stored {
                null_bucket: row.storage_bucket.is_none(),
                bucket: row.storage_bucket.clone().unwrap_or_default(),
                storage_id: row.storage_id.clone().unwrap_or_default(),
            },
            Selection::Unbucketed => Cursor::Unbucketed {
                storage_id: row.storage_id.clone().unwrap_or_default(),
            },
            Selection::Unstored { .. } => Cursor::Unstored {
                last_modified: row.last_modified,
                id: row.id.clone(),
            },
            Selection::Included { .. } => Cursor::Included {
                uri_bucket: row.uri_bucket.clone(),
                uri: row.uri.clone(),
            },
        }
    }

    /// SQL and parameters for the next page.
    fn page_query(&self) -> (String, Vec<Value>) {
        let mut sql = format!("SELECT {COLUMNS} FROM artifact WHERE ");
        let mut params: Vec<Value> = Vec::new();

        let order = match &self.selection {
            Selection::Stored { prefix } => {
                sql.push_str("storage_id IS NOT NULL");
                push_prefix(&mut sql, &mut params, "storage_bucket", prefix.as_deref());
                if let Cursor::Stored {
                    null_bucket,
                    bucket,
                    storage_id,
                } = &self.cursor
                {
                    sql.push_str(
                        " AND (storage_bucket IS NULL, COALESCE(storage_bucket, ''), storage_id) > (?, ?, ?)",
                    );
                    params.push(Value::Integer(i64::from(*null_bucket)));
                    params.push(Value::Text(bucket.clone()));
                    params.push(Value::Text(storage_id.clone()));
                }
                "storage_bucket IS NULL, COALESCE(storage_bucket, ''), storage_id"
            }
            Selection::Unbucketed => {
                sql.push_str("storage_id IS NOT NULL AND storage_bucket IS NULL");
                if let Cursor::Unbucketed { storage_id } = &self.cursor {
                    sql.push_str(" AND storage_id > ?");
                    params.push(Value::Text(storage_id.clone()));
                }
                "storage_id"
            }
            Selection::Unstored { prefix } => {
                sql.push_str("storage_id IS NULL");
                push_prefix(&mut sql, &mut params, "uri_bucket", prefix.as_deref());
                if let Cursor::Unstored { last_modified, id } = &self.cursor {
                    sql.push_str(" AND (last_modified, id) > (?, ?)");
                    params.push(Value::Integer(*last_modified));
                    params.push(Value::Text(id.clone()));
                }
                "last_modified, id"
            }
            Selection::Included { condition } => {
                sql.push('(');
                sql.push_str(condition);
                sql.push(')');
                if let Cursor::Included { uri_bucket, uri } = &self.cursor {
                    sql.push_str(" AND (uri_bucket, uri) > (?, ?)");
                    params.push(Value::Text(uri_bucket.clone()));
                    params.push(Value::Text(uri.clone()));
                }
                "uri_bucket, uri"
            }
        };

        sql.push_str(" ORDER BY ");
        sql.push_str(order);
        sql.push_str(" LIMIT ?");
        params.push(Value::Integer(
            i64::try_from(self.config.fetch_size).unwrap_or(i64::MAX),
        ));
        (sql, params)
    }

    fn fetch_page(&mut self) -> Result<Vec<RawRow>> {
        let (sql, params) = self.page_query();
        let conn = self.conn.as_ref().ok_or_else(|| CofferError::Internal {
            message: "iterator session is not open".to_string(),
        })?;
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| db_error("Failed to prepare iterator query", e))?;
        let rows = stmt
            .query_map(params_from_iter(params), RawRow::from_row)
            .map_err(|e| db_error("Failed to run iterator query", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_error("Failed to read iterator row", e))?;
        debug!(rows = rows.len(), "Fetched iterator page");
        Ok(rows)
    }
}

fn push_prefix(sql: &mut String, params: &mut Vec<Value>, column: &str, prefix: Option<&str>) {
    if let Some(p) = prefix.filter(|p| !p.is_empty()) {
        sql.push_str(&format!(" AND substr({column}, 1, ?) = ?"));
        params.push(Value::Integer(p.len() as i64));
        params.push(Value::Text(p.to_string()));
    }
}

impl Iterator for ArtifactIterator {
    type Item = Result<Artifact>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => return Some(Err(e)),
        }
        let row = self.page.pop_front()?;
        match row.into_artifact() {
            Ok(artifact) => Some(Ok(artifact)),
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}

impl Drop for ArtifactIterator {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ArtifactIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactIterator")
            .field("selection", &self.selection)
            .field("state", &self.state)
            .field("buffered", &self.page.len())
            .finish()
    }
}
