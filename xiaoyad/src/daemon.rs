use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use url::Url;
use xiaoya_core::{AlistClient, FileRecord, MirrorCrawler, MirrorSelector, RetryPolicy};

use crate::config::DaemonConfig;
use crate::sync::alist_cache::AlistSnapshot;
use crate::sync::engine::DownloadEngine;
use crate::sync::index::{INDEX_FILE_NAME, IndexStore};
use crate::sync::reconcile::Reconciler;
use crate::sync::strm::StrmRewriter;

/// Pause before a failed stage is retried in daemon mode.
pub const STAGE_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchMetadata,
    ResolveValidationSource,
    Compare,
    Prepare,
    Sync,
}

impl Stage {
    /// Process status of a one-shot run that failed in this stage.
    pub fn exit_status(self) -> i32 {
        match self {
            Stage::FetchMetadata => 2,
            Stage::ResolveValidationSource => 3,
            Stage::Compare => 126,
            Stage::Prepare => 127,
            Stage::Sync => 128,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::FetchMetadata => "FETCH_METADATA",
            Stage::ResolveValidationSource => "RESOLVE_VALIDATION_SOURCE",
            Stage::Compare => "COMPARE",
            Stage::Prepare => "PREPARE",
            Stage::Sync => "SYNC",
        })
    }
}

#[derive(Debug, Error)]
#[error("{stage} failed: {source:#}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: anyhow::Error,
}

impl StageError {
    pub fn exit_status(&self) -> i32 {
        self.stage.exit_status()
    }
}

/// Data handed from one stage to the next within a run.
#[derive(Default)]
struct RunState {
    cached: Vec<FileRecord>,
    listing: Vec<FileRecord>,
    preserve: BTreeSet<String>,
    changed: BTreeSet<String>,
    reconciler: Option<Reconciler>,
}

pub struct Daemon {
    config: DaemonConfig,
    retry_delay: Duration,
    remote_retry: RetryPolicy,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            retry_delay: STAGE_RETRY_DELAY,
            remote_retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Retry policy for every mirror and Alist request.
    pub fn with_remote_retry(mut self, retry: RetryPolicy) -> Self {
        self.remote_retry = retry;
        self
    }

    /// Runs the stage loop. Returns only in one-shot mode.
    pub async fn run(&self) -> Result<(), StageError> {
        if self.config.daemon {
            tracing::info!(schedule = %self.config.schedule, "run as daemon in foreground");
        }
        let mut state = RunState::default();
        let mut stage = Stage::FetchMetadata;
        loop {
            match self.step(stage, &mut state).await {
                Ok(Some(next)) => stage = next,
                Ok(None) => {
                    close(&mut state).await;
                    if !self.config.daemon {
                        return Ok(());
                    }
                    self.wait_for_next_run().await;
                    state = RunState::default();
                    stage = Stage::FetchMetadata;
                }
                Err(source) if self.config.daemon => {
                    tracing::error!(%stage, error = format!("{source:#}"), "critical error");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(source) => {
                    close(&mut state).await;
                    return Err(StageError { stage, source });
                }
            }
        }
    }

    /// Executes one stage and picks the next; `None` ends the run.
    async fn step(&self, stage: Stage, state: &mut RunState) -> anyhow::Result<Option<Stage>> {
        match stage {
            Stage::FetchMetadata => {
                state.cached = if self.config.mode.downloads_metadata() {
                    let files = self.fetch_metadata().await?;
                    tracing::info!(files = files.len(), "finished metadata download");
                    files
                } else {
                    let files = self.cached_metadata().await?;
                    tracing::info!(files = files.len(), "skipped metadata download");
                    files
                };
                Ok(Some(Stage::ResolveValidationSource))
            }
            Stage::ResolveValidationSource => {
                state.listing = self.resolve_listing().await?;
                Ok(self.config.mode.reconciles().then_some(Stage::Compare))
            }
            Stage::Compare => {
                let reconciler = match state.reconciler.take() {
                    Some(reconciler) => reconciler,
                    None => self.open_reconciler().await?,
                };
                let reconciler = state.reconciler.insert(reconciler);
                state.preserve = reconciler.compare(&state.cached, &state.listing).await?;
                tracing::info!(files = state.preserve.len(), "metadata files to sync");
                Ok(Some(Stage::Prepare))
            }
            Stage::Prepare => {
                let reconciler = state
                    .reconciler
                    .as_ref()
                    .context("reconciler is not open")?;
                state.changed = reconciler.prepare(&state.preserve).await?;
                tracing::info!(files = state.changed.len(), "files need to be updated");
                Ok(Some(Stage::Sync))
            }
            Stage::Sync => {
                let reconciler = state
                    .reconciler
                    .as_ref()
                    .context("reconciler is not open")?;
                reconciler.sync(&state.changed).await?;
                Ok(None)
            }
        }
    }

    async fn wait_for_next_run(&self) {
        let now = OffsetDateTime::now_utc();
        let next = self.config.schedule.next_run(now);
        tracing::info!(
            next = %next.format(&Rfc3339).unwrap_or_else(|_| next.to_string()),
            schedule = %self.config.schedule,
            "next task scheduled"
        );
        tokio::time::sleep(self.config.schedule.delay_from(now)).await;
    }

    async fn fetch_metadata(&self) -> anyhow::Result<Vec<FileRecord>> {
        tracing::info!("start metadata synchronization");
        let selector = MirrorSelector::connect(&self.config.mirror_urls)
            .await
            .context("failed to rank metadata mirrors")?;
        let cancel = CancellationToken::new();
        let revalidation = selector.spawn_revalidation(cancel.clone());

        let result = self.download(Arc::clone(&selector)).await;
        cancel.cancel();
        if let Err(err) = revalidation.await {
            tracing::warn!(error = %err, "mirror revalidation task failed");
        }
        result
    }

    async fn download(&self, selector: Arc<MirrorSelector>) -> anyhow::Result<Vec<FileRecord>> {
        let crawler = MirrorCrawler::new(selector)?.with_retry_policy(self.remote_retry);
        let index = IndexStore::open(&self.config.download_dir.join(INDEX_FILE_NAME))
            .await
            .context("failed to open download index")?;
        let engine = Arc::new(
            DownloadEngine::new(crawler, index.clone(), &self.config.download_dir)
                .with_selected_paths(&self.config.selected_paths)
                .with_purge(self.config.purge),
        );
        let result: anyhow::Result<Vec<FileRecord>> = async {
            engine.sync().await?;
            Ok(engine.local_files().await?)
        }
        .await;
        index.close().await;
        result
    }

    async fn cached_metadata(&self) -> anyhow::Result<Vec<FileRecord>> {
        let index = IndexStore::open(&self.config.download_dir.join(INDEX_FILE_NAME))
            .await
            .context("failed to open download index")?;
        let files = index.list().await;
        index.close().await;
        Ok(files?)
    }

    async fn resolve_listing(&self) -> anyhow::Result<Vec<FileRecord>> {
        let client =
            AlistClient::new(self.config.alist_url.as_str())?.with_retry_policy(self.remote_retry);
        let snapshot = AlistSnapshot::new(client, &self.config.media_dir);
        let files = if !self.config.mode.resolves_alist() {
            let files = snapshot.load_cached().await?;
            tracing::info!(files = files.len(), "found alist files (cached)");
            files
        } else if self.config.refresh_alist {
            snapshot.rebuild().await?
        } else {
            snapshot.load_on_demand().await?
        };
        tracing::info!(files = files.len(), "found alist files in total");
        Ok(files)
    }

    async fn open_reconciler(&self) -> anyhow::Result<Reconciler> {
        let rewriter = StrmRewriter::new(
            rewrite_endpoint(&self.config.alist_url),
            &self.config.alist_strm_root_path,
        );
        let reconciler = Reconciler::open(
            &self.config.media_dir,
            &self.config.download_dir,
            rewriter,
        )
        .await?
        .with_purge(self.config.purge)
        .with_skip_prefixes(&self.config.strm_skip_prefixes);
        Ok(reconciler)
    }
}

/// Endpoint placeholders are rewritten to; only its origin is used.
fn rewrite_endpoint(alist_url: &Url) -> Url {
    let mut endpoint = alist_url.clone();
    endpoint.set_path("/");
    endpoint.set_query(None);
    endpoint.set_fragment(None);
    endpoint
}

async fn close(state: &mut RunState) {
    if let Some(reconciler) = state.reconciler.take() {
        reconciler.close().await;
    }
}

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
