//! Site configuration.
//!
//! Configuration values are immutable once built and passed by reference to
//! the components they configure. [`SiteConfig::new`] fills in defaults for
//! a site rooted at one directory; [`SiteConfig::from_json_file`] loads an
//! explicit configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checksum::DigestAlgorithm;
use crate::error::CofferError;
use crate::partition::MAX_STORAGE_BUCKET_LENGTH;
use crate::Result;

/// Default storage bucket length: 16^4 leaf directories.
const DEFAULT_BUCKET_LENGTH: usize = 4;

/// Default number of rows an iterator fetches per query.
const DEFAULT_FETCH_SIZE: usize = 1000;

/// Default time a metadata session waits on a locked database.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default backoff between file-sync attempts.
const DEFAULT_RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(2), Duration::from_secs(4)];

/// Configuration for the filesystem storage adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    /// Root directory; `content/` and `transaction/` are created beneath it.
    pub root: PathBuf,

    /// Number of hex characters in generated storage buckets (1..=7).
    #[serde(default = "default_bucket_length")]
    pub bucket_length: usize,

    /// Digest used for stored content when the caller gives no comparable checksum.
    #[serde(default)]
    pub digest: DigestAlgorithm,
}

impl FsConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bucket_length: DEFAULT_BUCKET_LENGTH,
            digest: DigestAlgorithm::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_length == 0 || self.bucket_length > MAX_STORAGE_BUCKET_LENGTH {
            return Err(CofferError::Config {
                message: format!(
                    "bucket_length must be in [1,{MAX_STORAGE_BUCKET_LENGTH}], found {}",
                    self.bucket_length
                ),
            });
        }
        Ok(())
    }
}

/// Configuration for a metadata store session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaoConfig {
    /// SQLite database file.
    pub database: PathBuf,

    /// Rows fetched per iterator query.
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,

    /// How long a session waits for another session's write lock.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: Duration,
}

impl DaoConfig {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            fetch_size: DEFAULT_FETCH_SIZE,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch_size == 0 {
            return Err(CofferError::Config {
                message: "fetch_size must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Retry policy for the file-sync job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Sleep before each retry; the number of entries bounds the retries.
    #[serde(default = "default_retry_delays")]
    pub retry_delays: Vec<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_delays: default_retry_delays(),
        }
    }
}

/// Everything needed to open a storage site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    pub storage: FsConfig,
    pub database: DaoConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl SiteConfig {
    /// Defaults for a site whose byte storage and database share `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let database = root.join("inventory.db");
        Self {
            storage: FsConfig::new(root),
            database: DaoConfig::new(database),
            sync: SyncConfig::default(),
        }
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CofferError::Config {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| CofferError::Serialization(format!("{}: {e}", path.display())))?;
        config.validate()?;
        debug!(path = %path.display(), root = %config.storage.root.display(), "Loaded site configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.database.validate()
    }
}

fn default_bucket_length() -> usize {
    DEFAULT_BUCKET_LENGTH
}

fn default_fetch_size() -> usize {
    DEFAULT_FETCH_SIZE
}

fn default_busy_timeout() -> Duration {
    DEFAULT_BUSY_TIMEOUT
}

fn default_retry_delays() -> Vec<Duration> {
    DEFAULT_RETRY_DELAYS.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_defaults() {
        let config = SiteConfig::new("/data/site");
        assert_eq!(config.storage.bucket_length, DEFAULT_BUCKET_LENGTH);
        assert_eq!(config.database.database, PathBuf::from("/data/site/inventory.db"));
        assert_eq!(config.database.fetch_size, DEFAULT_FETCH_SIZE);
        assert_eq!(config.sync.retry_delays.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bucket_length_bounds() {
        let mut fs = FsConfig::new("/tmp");
        fs.bucket_length = 0;
        assert!(matches!(fs.validate(), Err(CofferError::Config { .. })));
        fs.bucket_length = MAX_STORAGE_BUCKET_LENGTH + 1;
        assert!(fs.validate().is_err());
        fs.bucket_length = MAX_STORAGE_BUCKET_LENGTH;
        assert!(fs.validate().is_ok());
    }

    #[test]
    fn test_json_file_with_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("site.json");
        std::fs::write(
            &path,
            r#"{"storage": {"root": "/srv/coffer", "bucket_length": 3},
                "database": {"database": "/srv/coffer/inv.db"}}"#,
        )
        .unwrap();
        let config = SiteConfig::from_json_file(&path).unwrap();
        assert_eq!(config.storage.bucket_length, 3);
        assert_eq!(config.storage.digest, DigestAlgorithm::Sha256);
        assert_eq!(config.database.busy_timeout, DEFAULT_BUSY_TIMEOUT);
        assert_eq!(config.sync.retry_delays, DEFAULT_RETRY_DELAYS.to_vec());
    }

    #[test]
    fn test_json_file_rejects_bad_bucket_length() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("site.json");
        std::fs::write(
            &path,
            r#"{"storage": {"root": "/srv", "bucket_length": 9},
                "database": {"database": "/srv/inv.db"}}"#,
        )
        .unwrap();
        assert!(SiteConfig::from_json_file(&path).is_err());
    }
}
