use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use url::Url;
use xiaoya_core::record::{parent_dir, top_level_segment};
use xiaoya_core::{
    FileRecord, MirrorCrawler, Op, RemoteError, RemoteTree, Visitor, WalkError, WalkFlow,
};

use super::index::{IndexError, IndexStore};
use super::paths::{PathError, local_path_for, remove_empty_dirs, remove_file_if_exists};
use super::transfer::{TransferError, write_response};

/// Top-level directories mirrored when none are configured.
pub const DEFAULT_SELECTED_PATHS: &[&str] = &[
    "/115",
    "/ISO",
    "/PikPak",
    "/动漫",
    "/每日更新",
    "/电影",
    "/电视剧",
    "/纪录片",
    "/纪录片（已刮削）",
    "/综艺",
    "/音乐",
];

pub const MAX_WORKERS: usize = 8;
pub const MAX_RETRY_ROUNDS: usize = 5;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("walk failed at {path}: {reason}")]
    Walk { path: String, reason: String },
    #[error("maximum retry attempts exceeded ({failed} file(s) still failing)")]
    RetriesExhausted { failed: usize },
    #[error("worker pool is closed")]
    PoolClosed,
    #[error("download task failed: {0}")]
    Join(#[from] JoinError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub files: usize,
    pub written: usize,
    pub retry_rounds: usize,
    pub purged: usize,
}

/// Mirrors the remote metadata tree into the download directory.
pub struct DownloadEngine {
    crawler: MirrorCrawler,
    index: IndexStore,
    download_dir: PathBuf,
    selected_roots: HashSet<String>,
    purge: bool,
    workers: usize,
}

struct Pending {
    path: String,
    previous: Option<FileRecord>,
}

/// Directories the walk descended into, and those whose listing returned
/// at least one entry.
#[derive(Default)]
struct WalkedDirs {
    listed: HashSet<String>,
    populated: HashSet<String>,
}

#[derive(Default)]
struct RunState {
    seen: Mutex<HashMap<String, FileRecord>>,
    failed: Mutex<Vec<Pending>>,
    written: AtomicUsize,
}

impl DownloadEngine {
    pub fn new(crawler: MirrorCrawler, index: IndexStore, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            crawler,
            index,
            download_dir: download_dir.into(),
            selected_roots: selected_roots(DEFAULT_SELECTED_PATHS),
            purge: false,
            workers: default_workers(),
        }
    }

    /// Restricts the walk to the first segment of each path. An empty list
    /// keeps [`DEFAULT_SELECTED_PATHS`].
    pub fn with_selected_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let roots = selected_roots(paths);
        if !roots.is_empty() {
            self.selected_roots = roots;
        }
        self
    }

    pub fn with_purge(mut self, purge: bool) -> Self {
        self.purge = purge;
        self
    }

    /// Sets the worker count, bounded to `1..=MAX_WORKERS`.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.clamp(1, MAX_WORKERS);
        self
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub async fn local_files(&self) -> Result<Vec<FileRecord>, DownloadError> {
        Ok(self.index.list().await?)
    }

    /// Walks the whole remote tree and downloads new or changed files.
    pub async fn sync(self: &Arc<Self>) -> Result<SyncSummary, DownloadError> {
        tokio::fs::create_dir_all(&self.download_dir).await?;
        tracing::info!(
            dir = %self.download_dir.display(),
            workers = self.workers,
            "start metadata synchronization"
        );

        let state = Arc::new(RunState::default());
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut visitor = SyncVisitor {
            engine: self,
            state: &state,
            permits: &permits,
            tasks: JoinSet::new(),
            files: 0,
            dirs: WalkedDirs::default(),
        };
        let walked = self.crawler.walk("/", &mut visitor).await;
        let SyncVisitor {
            mut tasks,
            files,
            dirs,
            ..
        } = visitor;
        drain(&mut tasks).await?;
        if let Err(err) = walked {
            tracing::error!(error = %err, "metadata walk aborted");
            return Err(err);
        }

        let mut retry_rounds = 0;
        loop {
            let pending = std::mem::take(&mut *lock(&state.failed));
            if pending.is_empty() {
                break;
            }
            if retry_rounds == MAX_RETRY_ROUNDS {
                tracing::error!(
                    failed = pending.len(),
                    "metadata download has exceeded the maximum retry attempts"
                );
                return Err(DownloadError::RetriesExhausted {
                    failed: pending.len(),
                });
            }
            retry_rounds += 1;
            tracing::info!(
                round = retry_rounds,
                pending = pending.len(),
                "failed metadata entries will be retried"
            );
            let mut tasks = JoinSet::new();
            for entry in pending {
                self.spawn_fetch(&mut tasks, &permits, &state, entry).await?;
            }
            drain(&mut tasks).await?;
        }

        let seen = std::mem::take(&mut *lock(&state.seen));
        let purged = if self.purge {
            self.purge_unseen(&seen, &dirs).await?
        } else {
            0
        };

        let summary = SyncSummary {
            files,
            written: state.written.load(Ordering::Relaxed),
            retry_rounds,
            purged,
        };
        tracing::info!(
            files = summary.files,
            written = summary.written,
            purged = summary.purged,
            "finished metadata synchronization"
        );
        Ok(summary)
    }

    fn is_selected(&self, path: &str) -> bool {
        self.selected_roots.contains(top_level_segment(path))
    }

    /// Whether a file the walk never saw is known to be gone remotely. The
    /// deepest directory the walk listed above it must have returned entries,
    /// and the file must sit at the root or under a selected directory.
    fn is_gone(&self, path: &str, dirs: &WalkedDirs) -> bool {
        let mut dir = parent_dir(path);
        if dir != "/" && !self.is_selected(path) {
            return false;
        }
        loop {
            if dirs.listed.contains(dir) {
                return dirs.populated.contains(dir);
            }
            if dir == "/" {
                return false;
            }
            dir = parent_dir(dir);
        }
    }

    /// Index record for `path`, ignored when its cached file is gone.
    async fn previous_record(&self, path: &str) -> Result<Option<FileRecord>, DownloadError> {
        let Some(previous) = self.index.get(path).await? else {
            return Ok(None);
        };
        let local = local_path_for(&self.download_dir, path)?;
        if tokio::fs::try_exists(&local).await.unwrap_or(false) {
            Ok(Some(previous))
        } else {
            tracing::warn!(path, "missing cached file");
            Ok(None)
        }
    }

    async fn spawn_fetch(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        permits: &Arc<Semaphore>,
        state: &Arc<RunState>,
        entry: Pending,
    ) -> Result<(), DownloadError> {
        let permit = Arc::clone(permits)
            .acquire_owned()
            .await
            .map_err(|_| DownloadError::PoolClosed)?;
        let engine = Arc::clone(self);
        let state = Arc::clone(state);
        tasks.spawn(async move {
            let _permit = permit;
            let result = engine
                .fetch(&entry.path, entry.previous.as_ref(), &state)
                .await;
            match result {
                Ok(true) => {
                    state.written.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(path = %entry.path, error = %err, "failed to download");
                    lock(&state.failed).push(entry);
                }
            }
        });
        Ok(())
    }

    /// Tries each ranked mirror in turn. Returns whether bytes were written.
    async fn fetch(
        &self,
        path: &str,
        previous: Option<&FileRecord>,
        state: &RunState,
    ) -> Result<bool, DownloadError> {
        let mirrors = self.crawler.mirrors().active();
        let mut last_err = None;
        for (i, mirror) in mirrors.iter().enumerate() {
            match self.fetch_from(path, mirror, previous, state).await {
                Ok(written) => return Ok(written),
                Err(err) => {
                    if i + 1 < mirrors.len() {
                        tracing::warn!(path, %mirror, error = %err, "download failed, trying next mirror");
                    }
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            RemoteError::NoMirror {
                op: Op::Download,
                path: path.to_string(),
            }
            .into()
        }))
    }

    async fn fetch_from(
        &self,
        path: &str,
        mirror: &Url,
        previous: Option<&FileRecord>,
        state: &RunState,
    ) -> Result<bool, DownloadError> {
        let Some(file) = self.crawler.open(path, mirror).await? else {
            if let Some(previous) = previous {
                lock(&state.seen).insert(path.to_string(), previous.clone());
            }
            tracing::debug!(path, "ignored html document");
            return Ok(false);
        };

        let wanted = {
            let mut seen = lock(&state.seen);
            seen.insert(path.to_string(), file.record.clone());
            file.record.supersedes(previous)
        };
        if !wanted {
            tracing::debug!(path, "skipped unchanged file");
            return Ok(false);
        }

        tracing::info!(%mirror, path, "downloading");
        let target = local_path_for(&self.download_dir, path)?;
        let bytes = write_response(file.response, &target).await?;
        // The index is only touched once the file is in place.
        self.index.upsert(&file.record).await?;
        tracing::info!(path, bytes, "downloaded");
        Ok(true)
    }

    /// Drops cached files that the finished walk never saw remotely.
    async fn purge_unseen(
        &self,
        seen: &HashMap<String, FileRecord>,
        dirs: &WalkedDirs,
    ) -> Result<usize, DownloadError> {
        let mut purged = 0;
        for record in self.index.list().await? {
            if seen.contains_key(&record.path) {
                continue;
            }
            if !self.is_gone(&record.path, dirs) {
                tracing::debug!(path = %record.path, "kept file outside the walked tree");
                continue;
            }
            let local = local_path_for(&self.download_dir, &record.path)?;
            let mut tx = self.index.begin().await?;
            tx.delete(&record.path).await?;
            remove_file_if_exists(&local).await?;
            tx.commit().await?;
            if let Some(parent) = local.parent() {
                remove_empty_dirs(parent, &self.download_dir).await?;
            }
            tracing::info!(path = %record.path, "purged stale metadata file");
            purged += 1;
        }
        Ok(purged)
    }
}

struct SyncVisitor<'a> {
    engine: &'a Arc<DownloadEngine>,
    state: &'a Arc<RunState>,
    permits: &'a Arc<Semaphore>,
    tasks: JoinSet<()>,
    files: usize,
    dirs: WalkedDirs,
}

impl Visitor for SyncVisitor<'_> {
    type Error = DownloadError;

    async fn visit(
        &mut self,
        path: &str,
        entry: Result<&FileRecord, WalkError<'_>>,
    ) -> Result<WalkFlow, DownloadError> {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(path, error = %err, "error validating metadata file");
                return Err(DownloadError::Walk {
                    path: path.to_string(),
                    reason: err.to_string(),
                });
            }
        };

        if path != "/" {
            self.dirs.populated.insert(parent_dir(path).to_string());
        }
        if entry.is_dir {
            if path != "/" && !self.engine.is_selected(path) {
                tracing::info!(path, "skipped directory");
                return Ok(WalkFlow::SkipDir);
            }
            self.dirs.listed.insert(path.to_string());
            return Ok(WalkFlow::Continue);
        }

        let previous = self.engine.previous_record(path).await?;
        let pending = Pending {
            path: path.to_string(),
            previous,
        };
        self.engine
            .spawn_fetch(&mut self.tasks, self.permits, self.state, pending)
            .await?;
        self.files += 1;
        while let Some(done) = self.tasks.try_join_next() {
            done?;
        }
        Ok(WalkFlow::Continue)
    }
}

/// First segment of each selected path, without slashes.
pub fn selected_roots<I, S>(paths: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    paths
        .into_iter()
        .map(|path| top_level_segment(path.as_ref()).to_string())
        .filter(|segment| !segment.is_empty())
        .collect()
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_WORKERS)
}

async fn drain(tasks: &mut JoinSet<()>) -> Result<(), DownloadError> {
    while let Some(done) = tasks.join_next().await {
        done?;
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
