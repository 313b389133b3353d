//! coffer CLI: inspect and maintain a single storage site.
//!
//! - `coffer put <URI> <FILE>` store a file and record its artifact
//! - `coffer get <STORAGE_ID> <OUT>` stream stored bytes (`-` for stdout)
//! - `coffer delete <STORAGE_ID>` remove stored bytes
//! - `coffer list | stored | unstored [--bucket P]`, `coffer include <DIR>` scans
//! - `coffer validate [--bucket P]` report storage/inventory divergence

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::error;
use tracing_subscriber::EnvFilter;

use coffer_core::{Artifact, Checksum, CofferError, NewArtifact, Result, SiteConfig, StorageLocation};
use coffer_db::IncludeClauses;
use coffer_runtime::{ingest, DefaultListener, ReportPolicy, Site, Validator};

#[derive(Parser)]
#[command(name = "coffer", version, about = "Archival byte storage and artifact inventory")]
struct Cli {
    #[command(flatten)]
    site: SiteArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct SiteArgs {
    /// Site configuration file (JSON)
    #[arg(long, conflicts_with = "root")]
    config: Option<PathBuf>,

    /// Site root; storage and database live beneath it with default settings
    #[arg(long)]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Store a file and record it under an artifact uri
    Put {
        uri: String,
        file: PathBuf,
        /// Expected checksum, `{algorithm}:{hex}`
        #[arg(long)]
        checksum: Option<String>,
        /// Expected length in bytes
        #[arg(long)]
        length: Option<u64>,
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Write stored bytes to a file, or stdout for `-`
    Get { storage_id: String, out: PathBuf },
    /// Remove stored bytes
    Delete { storage_id: String },
    /// List stored objects
    List {
        #[arg(long)]
        bucket: Option<String>,
    },
    /// List artifacts with a storage location
    Stored {
        #[arg(long)]
        bucket: Option<String>,
    },
    /// List artifacts waiting for their bytes
    Unstored {
        #[arg(long)]
        bucket: Option<String>,
    },
    /// List artifacts selected by the *.sql clauses in a directory
    Include { dir: PathBuf },
    /// Compare stored objects with the inventory and report differences
    Validate {
        #[arg(long)]
        bucket: Option<String>,
    },
}

impl SiteArgs {
    fn load(&self) -> Result<SiteConfig> {
        match (&self.config, &self.root) {
            (Some(path), _) => SiteConfig::from_json_file(path),
            (None, Some(root)) => Ok(SiteConfig::new(root)),
            (None, None) => Err(CofferError::Config {
                message: "one of --config or --root is required".to_string(),
            }),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "coffer failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let site = Arc::new(Site::open(cli.site.load()?).await?);
    let result = match cli.command {
        Command::Put {
            uri,
            file,
            checksum,
            length,
            content_type,
        } => {
            let mut request = NewArtifact::new(uri);
            if let Some(text) = checksum {
                request = request.with_checksum(Checksum::parse(&text)?);
            }
            if let Some(length) = length {
                request = request.with_length(length);
            }
            put(&site, &file, request, content_type).await
        }
        Command::Get { storage_id, out } => get(&site, &storage_id, &out).await,
        Command::Delete { storage_id } => {
            site.storage.delete(&StorageLocation::new(storage_id, None)).await
        }
        Command::List { bucket } => list(&site, bucket.as_deref()).await,
        Command::Stored { bucket } => print_artifacts(site.stored_artifacts(bucket.as_deref()).await?).await,
        Command::Unstored { bucket } => {
            print_artifacts(site.unstored_artifacts(bucket.as_deref()).await?).await
        }
        Command::Include { dir } => {
            let clauses = IncludeClauses::load(&dir)?;
            print_artifacts(site.included_artifacts(clauses).await?).await
        }
        Command::Validate { bucket } => {
            let listener = Arc::new(DefaultListener::new(Arc::clone(&site)));
            let summary = Validator::new(Arc::clone(&site), Arc::new(ReportPolicy), listener)
                .run(bucket.as_deref())
                .await?;
            println!(
                "storage-only: {}\nartifact-only: {}\nmatched: {} ({} inconsistent)",
                summary.storage_only, summary.artifact_only, summary.matched, summary.inconsistent
            );
            Ok(())
        }
    };
    site.shutdown().await;
    result
}

async fn put(
    site: &Site,
    file: &Path,
    request: NewArtifact,
    content_type: Option<String>,
) -> Result<()> {
    let mut source = tokio::fs::File::open(file)
        .await
        .map_err(|e| CofferError::source_side(format!("Failed to open {}", file.display()), e))?;
    let modified: DateTime<Utc> = source
        .metadata()
        .await
        .and_then(|m| m.modified())
        .map(DateTime::from)
        .unwrap_or_else(|_| Utc::now());

    let meta = ingest(site, request, &mut source, modified, content_type).await?;
    println!(
        "{}\t{}\t{}",
        meta.storage_location(),
        meta.content_checksum(),
        meta.content_length()
    );
    Ok(())
}

async fn get(site: &Site, storage_id: &str, out: &Path) -> Result<()> {
    let location = StorageLocation::new(storage_id, None);
    if out == Path::new("-") {
        let mut stdout = tokio::io::stdout();
        site.storage.get(&location, &mut stdout).await?;
        return stdout
            .flush()
            .await
            .map_err(|e| CofferError::sink_side("Failed to flush stdout", e));
    }
    let mut file = tokio::fs::File::create(out)
        .await
        .map_err(|e| CofferError::sink_side(format!("Failed to create {}", out.display()), e))?;
    site.storage.get(&location, &mut file).await?;
    file.sync_all()
        .await
        .map_err(|e| CofferError::sink_side(format!("Failed to sync {}", out.display()), e))
}

async fn list(site: &Site, prefix: Option<&str>) -> Result<()> {
    let mut objects = site.storage.iterator(prefix).await?;
    while let Some(meta) = objects.next().await {
        let meta = meta?;
        println!(
            "{}\t{}\t{}\t{}",
            meta.storage_location(),
            meta.content_checksum(),
            meta.content_length(),
            meta.artifact_uri.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn print_artifacts(mut artifacts: BoxStream<'static, Result<Artifact>>) -> Result<()> {
    while let Some(artifact) = artifacts.next().await {
        let artifact = artifact?;
        let location = artifact
            .storage_location
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{}\t{}\t{}",
            artifact.id(),
            artifact.uri(),
            artifact.content_checksum(),
            location
        );
    }
    Ok(())
}
