use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use xiaoya_core::FileRecord;
use xiaoya_core::record::{parent_dir, top_level_segment};

use super::index::{INDEX_FILE_NAME, IndexError, IndexStore};
use super::paths::{PathError, local_path_for, remove_empty_dirs, remove_file_if_exists};
use super::strm::{StrmRewriter, link_target, parse_link};
use super::transfer::{TransferError, copy_file, write_if_changed};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ReconcileError {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| ReconcileError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub placeholders: usize,
    pub copied: usize,
}

/// Turns the download cache into the served tree, dropping placeholders
/// whose targets the listing snapshot cannot confirm when purge is on.
pub struct Reconciler {
    media_dir: PathBuf,
    download_dir: PathBuf,
    served: IndexStore,
    downloads: IndexStore,
    rewriter: StrmRewriter,
    purge: bool,
    skip_prefixes: Vec<String>,
}

impl Reconciler {
    pub fn new(
        media_dir: impl Into<PathBuf>,
        download_dir: impl Into<PathBuf>,
        served: IndexStore,
        downloads: IndexStore,
        rewriter: StrmRewriter,
    ) -> Self {
        Self {
            media_dir: media_dir.into(),
            download_dir: download_dir.into(),
            served,
            downloads,
            rewriter,
            purge: true,
            skip_prefixes: Vec::new(),
        }
    }

    /// Opens the served index under `media_dir` and the download index under
    /// `download_dir`.
    pub async fn open(
        media_dir: &Path,
        download_dir: &Path,
        rewriter: StrmRewriter,
    ) -> Result<Self, ReconcileError> {
        let served = IndexStore::open(&media_dir.join(INDEX_FILE_NAME)).await?;
        let downloads = IndexStore::open(&download_dir.join(INDEX_FILE_NAME)).await?;
        Ok(Self::new(media_dir, download_dir, served, downloads, rewriter))
    }

    pub fn with_purge(mut self, purge: bool) -> Self {
        self.purge = purge;
        self
    }

    pub fn with_skip_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.skip_prefixes = prefixes
            .into_iter()
            .map(|prefix| format!("/{}", prefix.as_ref().trim_start_matches('/')))
            .filter(|prefix| prefix != "/")
            .collect();
        self
    }

    pub fn served(&self) -> &IndexStore {
        &self.served
    }

    pub async fn close(&self) {
        self.served.close().await;
        self.downloads.close().await;
    }

    /// Paths from `cached` that should be served. Touches no file.
    pub async fn compare(
        &self,
        cached: &[FileRecord],
        listing: &[FileRecord],
    ) -> Result<BTreeSet<String>, ReconcileError> {
        let listed: HashSet<&str> = listing.iter().map(|file| file.path.as_str()).collect();
        let mut placeholders: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for file in cached.iter().filter(|file| file.is_strm()) {
            placeholders
                .entry(parent_dir(&file.path))
                .or_default()
                .push(&file.path);
        }

        let mut excluded = HashSet::new();
        let mut per_root: BTreeMap<&str, usize> = BTreeMap::new();
        let mut valid_dirs = 0;
        for (dir, paths) in &placeholders {
            let mut valid = 0;
            for &path in paths {
                if self.is_skipped(path) {
                    valid += 1;
                    continue;
                }
                let source = local_path_for(&self.download_dir, path)?;
                let raw = match tokio::fs::read(&source).await {
                    Ok(raw) => String::from_utf8_lossy(&raw).into_owned(),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(ReconcileError::io(&source)(err)),
                };
                let link = match parse_link(&raw) {
                    Ok(link) => link,
                    Err(err) => {
                        tracing::error!(path, error = %err, "stream cannot be verified");
                        if self.purge {
                            excluded.insert(path);
                        }
                        continue;
                    }
                };
                let target = link_target(&link);
                if listed.contains(target.as_str()) {
                    valid += 1;
                } else if self.purge {
                    tracing::warn!(path, target = %target, "absent stream on alist");
                    excluded.insert(path);
                }
            }
            if valid > 0 {
                *per_root.entry(top_level_segment(dir)).or_default() += 1;
                valid_dirs += 1;
            }
        }

        for (root, directories) in &per_root {
            tracing::info!(root, directories, "valid metadata directories");
        }
        tracing::info!(
            valid = valid_dirs,
            total = placeholders.len(),
            "valid metadata directories in total"
        );

        Ok(cached
            .iter()
            .map(|file| file.path.as_str())
            .filter(|path| !excluded.contains(path))
            .map(str::to_string)
            .collect())
    }

    /// Deletes served files outside `preserve` and returns the preserved
    /// paths whose served copy needs publishing.
    pub async fn prepare(
        &self,
        preserve: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, ReconcileError> {
        tokio::fs::create_dir_all(&self.media_dir)
            .await
            .map_err(ReconcileError::io(&self.media_dir))?;

        let mut served: HashMap<String, FileRecord> = HashMap::new();
        for record in self.served.list().await? {
            if preserve.contains(&record.path) {
                served.insert(record.path.clone(), record);
                continue;
            }
            self.unpublish(&record).await?;
        }

        let mut changed = BTreeSet::new();
        for path in preserve {
            let Some(remote) = self.downloads.get(path).await? else {
                continue;
            };
            if remote.is_strm() || remote.supersedes(served.get(path)) {
                changed.insert(path.clone());
            }
        }
        tracing::info!(preserved = preserve.len(), changed = changed.len(), "prepared metadata update");
        Ok(changed)
    }

    /// Publishes every path in `changed` from the download cache.
    pub async fn sync(&self, changed: &BTreeSet<String>) -> Result<PublishSummary, ReconcileError> {
        tracing::info!(files = changed.len(), "finalizing updates");
        let mut summary = PublishSummary::default();
        for path in changed {
            let Some(record) = self.downloads.get(path).await? else {
                continue;
            };
            let source = local_path_for(&self.download_dir, path)?;
            let target = local_path_for(&self.media_dir, path)?;
            if record.is_strm() {
                if self.publish_placeholder(&record, &source, &target).await? {
                    summary.placeholders += 1;
                }
            } else {
                let mut tx = self.served.begin().await?;
                copy_file(&source, &target).await?;
                tx.upsert(&record).await?;
                tx.commit().await?;
                tracing::info!(path, "published metadata file");
                summary.copied += 1;
            }
        }
        tracing::info!(
            placeholders = summary.placeholders,
            copied = summary.copied,
            "done"
        );
        Ok(summary)
    }

    async fn publish_placeholder(
        &self,
        record: &FileRecord,
        source: &Path,
        target: &Path,
    ) -> Result<bool, ReconcileError> {
        let raw = tokio::fs::read(source)
            .await
            .map_err(ReconcileError::io(source))?;
        let mut contents = self.rewriter.rewrite(&String::from_utf8_lossy(&raw));
        contents.push('\n');

        let written = write_if_changed(target, contents.as_bytes()).await?;
        let recorded = self.served.get(&record.path).await?.as_ref() == Some(record);
        if !recorded {
            self.served.upsert(record).await?;
        }
        if written {
            tracing::info!(path = %record.path, "published stream link");
        }
        Ok(written || !recorded)
    }

    async fn unpublish(&self, record: &FileRecord) -> Result<(), ReconcileError> {
        let local = local_path_for(&self.media_dir, &record.path)?;
        let mut tx = self.served.begin().await?;
        tx.delete(&record.path).await?;
        remove_file_if_exists(&local)
            .await
            .map_err(ReconcileError::io(&local))?;
        tx.commit().await?;
        if let Some(parent) = local.parent() {
            remove_empty_dirs(parent, &self.media_dir)
                .await
                .map_err(ReconcileError::io(parent))?;
        }
        tracing::info!(path = %record.path, "removed unverified metadata file");
        Ok(())
    }

    fn is_skipped(&self, path: &str) -> bool {
        self.skip_prefixes
            .iter()
            .any(|prefix| path == prefix || path.starts_with(&format!("{prefix}/")))
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
