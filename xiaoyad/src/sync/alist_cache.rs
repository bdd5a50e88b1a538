//! Snapshot of every file the Alist listing API can serve, kept in
//! `<media_dir>/.alist.db` and regenerated once it is a day old.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use xiaoya_core::{AlistClient, FileRecord, RemoteTree, Visitor, WalkError, WalkFlow};

use super::index::{IndexError, IndexStore, IndexTx};

pub const ALIST_INDEX_FILE_NAME: &str = ".alist.db";
const STAGING_SUFFIX: &str = ".rebuild";
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("alist walk failed: {0}")]
    Remote(String),
    #[error("alist listed no files")]
    Empty,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub struct AlistSnapshot {
    client: AlistClient,
    media_dir: PathBuf,
    ttl: Duration,
}

impl AlistSnapshot {
    pub fn new(client: AlistClient, media_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            media_dir: media_dir.into(),
            ttl: SNAPSHOT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn db_path(&self) -> PathBuf {
        self.media_dir.join(ALIST_INDEX_FILE_NAME)
    }

    /// Cached snapshot, rebuilt first when it is missing, expired or empty.
    pub async fn load_on_demand(&self) -> Result<Vec<FileRecord>, SnapshotError> {
        tokio::fs::create_dir_all(&self.media_dir).await?;
        let db_path = self.db_path();
        let metadata = match tokio::fs::metadata(&db_path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return self.rebuild().await,
            Err(err) => return Err(err.into()),
        };

        let age = metadata.modified()?.elapsed().unwrap_or_default();
        if age >= self.ttl {
            tracing::info!(age_secs = age.as_secs(), "alist snapshot expired");
            return self.rebuild().await;
        }

        let files = self.load_cached().await?;
        if files.is_empty() {
            tracing::info!("alist snapshot is empty");
            return self.rebuild().await;
        }
        Ok(files)
    }

    /// Reads the snapshot as it is, creating an empty one when absent.
    pub async fn load_cached(&self) -> Result<Vec<FileRecord>, SnapshotError> {
        tracing::info!("reading alist manifests from cache");
        let store = IndexStore::open(&self.db_path()).await?;
        let files = store.list().await;
        store.close().await;
        Ok(files?)
    }

    /// Crawls the listing API again from `/` into a staging database and
    /// swaps it in. A failed or empty crawl leaves the previous snapshot.
    pub async fn rebuild(&self) -> Result<Vec<FileRecord>, SnapshotError> {
        tracing::info!(endpoint = %self.client.endpoint(), "collecting available alist files");
        tokio::fs::create_dir_all(&self.media_dir).await?;
        let staging = self.staging_path();
        remove_database(&staging).await?;

        let store = IndexStore::open(&staging).await?;
        let collected = match self.collect(&store).await {
            Ok(()) => store.list().await.map_err(SnapshotError::from),
            Err(err) => Err(err),
        };
        store.close().await;
        let files = match collected {
            Ok(files) if files.is_empty() => Err(SnapshotError::Empty),
            other => other,
        };
        let files = match files {
            Ok(files) => files,
            Err(err) => {
                tracing::error!(error = %err, "alist snapshot was not replaced");
                remove_database(&staging).await?;
                return Err(err);
            }
        };

        remove_database(&self.db_path()).await?;
        tokio::fs::rename(&staging, self.db_path()).await?;
        remove_database(&staging).await?;
        tracing::info!(files = files.len(), "collected alist files");
        Ok(files)
    }

    fn staging_path(&self) -> PathBuf {
        self.media_dir
            .join(format!("{ALIST_INDEX_FILE_NAME}{STAGING_SUFFIX}"))
    }

    async fn collect(&self, store: &IndexStore) -> Result<(), SnapshotError> {
        let mut visitor = SnapshotVisitor {
            tx: store.begin().await?,
            endpoint: self.client.endpoint().to_string(),
            root: "/",
        };
        self.client.walk(visitor.root, &mut visitor).await?;
        visitor.tx.commit().await?;
        Ok(())
    }
}

struct SnapshotVisitor {
    tx: IndexTx,
    endpoint: String,
    root: &'static str,
}

impl Visitor for SnapshotVisitor {
    type Error = SnapshotError;

    async fn visit(
        &mut self,
        path: &str,
        entry: Result<&FileRecord, WalkError<'_>>,
    ) -> Result<WalkFlow, SnapshotError> {
        let entry = match entry {
            Ok(entry) => entry,
            // Below the root a failure only loses that subtree.
            Err(err) if path != self.root && err.path().is_some() => {
                let name = err.entry.map(|dir| dir.name.as_str()).unwrap_or_default();
                tracing::warn!(path, name, error = %err, "error validating alist file");
                return Ok(WalkFlow::Continue);
            }
            Err(err) => {
                tracing::error!(path, error = %err, "error validating alist file");
                return Err(SnapshotError::Remote(err.to_string()));
            }
        };
        if entry.is_dir {
            return Ok(WalkFlow::Continue);
        }

        let mut record = entry.clone();
        record.path = path.to_string();
        self.tx.upsert(&record).await?;
        tracing::debug!(endpoint = %self.endpoint, path, "verified file on alist");
        Ok(WalkFlow::Continue)
    }
}

/// Removes the snapshot database together with its WAL side files.
async fn remove_database(db_path: &Path) -> io::Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        match tokio::fs::remove_file(PathBuf::from(name)).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
