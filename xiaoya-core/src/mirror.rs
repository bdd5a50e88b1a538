use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use reqwest::Client;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::GLOBAL_USER_AGENT;

pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://emby.xiaoya.pro/",
    "https://icyou.eu.org/",
    "https://emby.8.net.co/",
    "https://emby.raydoom.tk/",
    "https://emby.kaiserver.uk/",
    "https://embyxiaoya.laogl.top/",
    "https://emby-data.poxi1221.eu.org/",
    "https://emby-data.ermaokj.cn/",
    "https://emby-data.bdbd.fun/",
    "https://emby-data.wwwh.eu.org/",
    "https://emby-data.ymschh.top/",
    "https://emby-data.wx1.us.kg/",
    "https://emby-data.r2s.site/",
    "https://emby-data.neversay.eu.org/",
    "https://emby-data.800686.xyz/",
];

/// Text every healthy mirror index page contains.
pub const PROBE_MARKER: &str = "每日更新";
pub const PROBE_COUNT: usize = 5;
pub const PROBE_MIN_SUCCESS: usize = 4;
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
pub const REVALIDATE_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const RANKING_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("no viable mirror")]
    NoViableMirror,
    #[error("invalid mirror url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedMirror {
    pub url: Url,
    pub latency: Duration,
}

/// Probes a pool of equivalent mirrors and keeps them ranked by latency.
///
/// The ranked list is only ever replaced as a whole, so [`MirrorSelector::active`]
/// never observes a half-updated ranking.
pub struct MirrorSelector {
    probe: Client,
    pool: Vec<Url>,
    marker: String,
    ranked: Mutex<Vec<Url>>,
}

impl MirrorSelector {
    /// Builds a selector over `pool`, or over [`DEFAULT_MIRRORS`] when empty.
    /// Nothing is probed until [`MirrorSelector::validate`] runs.
    pub fn new<I, S>(pool: I) -> Result<Self, MirrorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut urls = pool
            .into_iter()
            .map(|raw| parse_mirror(raw.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if urls.is_empty() {
            urls = DEFAULT_MIRRORS
                .iter()
                .map(|raw| parse_mirror(raw))
                .collect::<Result<Vec<_>, _>>()?;
        }
        let probe = Client::builder()
            .timeout(PROBE_TIMEOUT)
            .user_agent(GLOBAL_USER_AGENT)
            .build()?;
        Ok(Self {
            probe,
            pool: urls,
            marker: PROBE_MARKER.to_string(),
            ranked: Mutex::new(Vec::new()),
        })
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = marker.into();
        self
    }

    /// Builds a selector and ranks it, retrying the ranking up to
    /// [`RANKING_ATTEMPTS`] times.
    pub async fn connect<I, S>(pool: I) -> Result<Arc<Self>, MirrorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let selector = Arc::new(Self::new(pool)?);
        selector.validate_with_retries(RANKING_ATTEMPTS).await?;
        Ok(selector)
    }

    pub fn pool(&self) -> &[Url] {
        &self.pool
    }

    /// Snapshot of the current ranking, fastest first.
    pub fn active(&self) -> Vec<Url> {
        self.ranked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn validate_with_retries(
        &self,
        attempts: u32,
    ) -> Result<Vec<RankedMirror>, MirrorError> {
        let mut attempt = 1;
        loop {
            match self.validate().await {
                Ok(ranked) => return Ok(ranked),
                Err(err) if attempt < attempts.max(1) => {
                    tracing::warn!(attempt, error = %err, "mirror ranking failed, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Probes the pool one mirror at a time and replaces the ranking.
    ///
    /// On [`MirrorError::NoViableMirror`] the previous ranking is left intact.
    pub async fn validate(&self) -> Result<Vec<RankedMirror>, MirrorError> {
        tracing::info!(mirrors = self.pool.len(), "validating metadata mirrors");
        let mut ranked = Vec::with_capacity(self.pool.len());
        for mirror in &self.pool {
            if let Some(scored) = self.score(mirror).await {
                ranked.push(scored);
            }
        }
        ranked.sort_by_key(|m| m.latency);
        if ranked.is_empty() {
            return Err(MirrorError::NoViableMirror);
        }

        let urls = ranked.iter().map(|m| m.url.clone()).collect();
        *self.ranked.lock().unwrap_or_else(PoisonError::into_inner) = urls;
        Ok(ranked)
    }

    /// Re-ranks every `interval` until `cancel` fires. Failures keep the
    /// previous ranking.
    pub async fn run_revalidation(&self, interval: Duration, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.validate().await {
                        tracing::error!(error = %err, "failed to validate mirrors");
                    }
                }
            }
        }
    }

    pub fn spawn_revalidation(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let selector = Arc::clone(self);
        tokio::spawn(async move {
            selector
                .run_revalidation(REVALIDATE_INTERVAL, cancel)
                .await;
        })
    }

    async fn score(&self, mirror: &Url) -> Option<RankedMirror> {
        let mut latencies = Vec::with_capacity(PROBE_COUNT);
        for _ in 0..PROBE_COUNT {
            if let Some(latency) = self.probe_once(mirror).await {
                latencies.push(latency);
            }
        }
        if latencies.len() < PROBE_MIN_SUCCESS {
            tracing::warn!(%mirror, ok = latencies.len(), "invalid metadata mirror");
            return None;
        }
        let total: Duration = latencies.iter().sum();
        let latency = total / latencies.len() as u32;
        tracing::info!(
            %mirror,
            latency_ms = latency.as_millis() as u64,
            "validated metadata mirror"
        );
        Some(RankedMirror {
            url: mirror.clone(),
            latency,
        })
    }

    async fn probe_once(&self, mirror: &Url) -> Option<Duration> {
        let start = Instant::now();
        let response = self.probe.get(mirror.clone()).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body = response.text().await.ok()?;
        if !body.contains(&self.marker) {
            return None;
        }
        Some(start.elapsed())
    }
}

fn parse_mirror(raw: &str) -> Result<Url, MirrorError> {
    let normalized = format!("{}/", raw.trim().trim_end_matches('/'));
    Url::parse(&normalized).map_err(|source| MirrorError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}
