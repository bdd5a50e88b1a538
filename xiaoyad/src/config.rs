use std::path::PathBuf;

use clap::{ArgAction, Parser};
use thiserror::Error;
use url::Url;

use crate::schedule::{DEFAULT_INTERVAL_HOURS, Schedule, ScheduleError};
use crate::sync::strm::{SOURCE_ENDPOINT, SOURCE_ROOT_PATH};

/// Process status for a configuration that fails validation.
pub const INVALID_CONFIG_STATUS: i32 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid Alist url: {0}")]
    InvalidAlistUrl(String),
    #[error("alist url must be root path: {0}")]
    AlistUrlNotRoot(String),
    #[error("run mode must be between 0 and 7, got {0}")]
    InvalidMode(u8),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Maintains the metadata files of a xiaoya media library for Emby.
#[derive(Debug, Clone, Parser)]
#[command(name = "xiaoyad", version, about)]
pub struct Args {
    /// Run mode (4: scan metadata, 2: scan alist, 1: sync metadata)
    #[arg(long, env = "XIAOYA_MODE", default_value_t = 7)]
    pub mode: u8,

    /// Run as daemon in foreground
    #[arg(
        long,
        env = "XIAOYA_DAEMON",
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub daemon: bool,

    /// Hours between two run cycles. Ignored unless run as daemon.
    #[arg(long, env = "XIAOYA_RUN_INTERVAL_IN_HOUR", default_value_t = DEFAULT_INTERVAL_HOURS)]
    pub run_interval_in_hour: u64,

    /// Daily UTC start time (HH:MM); overrides the run interval
    #[arg(long, env = "XIAOYA_SCHEDULE")]
    pub schedule: Option<String>,

    /// Media directory of Emby to maintain metadata
    #[arg(short = 'd', long, env = "XIAOYA_MEDIA_DIR", default_value = "/media")]
    pub media_dir: PathBuf,

    /// Directory to download metadata to
    #[arg(short = 'D', long, env = "XIAOYA_DOWNLOAD_DIR", default_value = "/download")]
    pub download_dir: PathBuf,

    /// Purge files whose media is no longer available
    #[arg(
        short = 'p',
        long,
        env = "XIAOYA_PURGE",
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub purge: bool,

    /// Mirror URL to sync metadata from (repeatable)
    #[arg(short = 'm', long = "mirror-url", env = "XIAOYA_MIRROR_URL", value_delimiter = ',')]
    pub mirror_urls: Vec<String>,

    /// Endpoint of xiaoya Alist; changing it rewrites the links in strm files
    #[arg(short = 'u', long, env = "XIAOYA_ALIST_URL", default_value = SOURCE_ENDPOINT)]
    pub alist_url: String,

    /// Root path of strm files in xiaoya Alist
    #[arg(short = 'r', long, env = "XIAOYA_ALIST_STRM_ROOT_PATH", default_value = SOURCE_ROOT_PATH)]
    pub alist_strm_root_path: String,

    /// Top-level directory to mirror (repeatable)
    #[arg(long = "selected-path", env = "XIAOYA_SELECTED_PATH", value_delimiter = ',')]
    pub selected_paths: Vec<String>,

    /// Placeholders under this prefix are published without verification
    #[arg(long = "strm-skip-prefix", env = "XIAOYA_STRM_SKIP_PREFIX", value_delimiter = ',')]
    pub strm_skip_prefixes: Vec<String>,

    /// Crawl Alist again even when the cached snapshot is fresh
    #[arg(long, env = "XIAOYA_REFRESH_ALIST")]
    pub refresh_alist: bool,
}

/// Bitmask selecting the stages of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMode(u8);

impl RunMode {
    pub const DOWNLOAD_METADATA: u8 = 4;
    pub const RESOLVE_ALIST: u8 = 2;
    pub const RECONCILE: u8 = 1;
    pub const ALL: RunMode = RunMode(7);

    pub fn new(bits: u8) -> Result<Self, ConfigError> {
        if bits > Self::ALL.0 {
            return Err(ConfigError::InvalidMode(bits));
        }
        Ok(RunMode(bits))
    }

    pub fn downloads_metadata(self) -> bool {
        self.0 & Self::DOWNLOAD_METADATA != 0
    }

    pub fn resolves_alist(self) -> bool {
        self.0 & Self::RESOLVE_ALIST != 0
    }

    pub fn reconciles(self) -> bool {
        self.0 & Self::RECONCILE != 0
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub mode: RunMode,
    pub daemon: bool,
    pub schedule: Schedule,
    pub media_dir: PathBuf,
    pub download_dir: PathBuf,
    pub purge: bool,
    pub mirror_urls: Vec<String>,
    pub alist_url: Url,
    pub alist_strm_root_path: String,
    pub selected_paths: Vec<String>,
    pub strm_skip_prefixes: Vec<String>,
    pub refresh_alist: bool,
}

impl TryFrom<Args> for DaemonConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, ConfigError> {
        let schedule = match args.schedule.as_deref() {
            Some(daily) if !daily.trim().is_empty() => Schedule::daily(daily)?,
            _ => Schedule::every_hours(args.run_interval_in_hour)?,
        };
        Ok(Self {
            mode: RunMode::new(args.mode)?,
            daemon: args.daemon,
            schedule,
            media_dir: args.media_dir,
            download_dir: args.download_dir,
            purge: args.purge,
            mirror_urls: non_empty(args.mirror_urls),
            alist_url: validate_alist_url(&args.alist_url)?,
            alist_strm_root_path: args.alist_strm_root_path,
            selected_paths: non_empty(args.selected_paths),
            strm_skip_prefixes: non_empty(args.strm_skip_prefixes),
            refresh_alist: args.refresh_alist,
        })
    }
}

/// Normalises the Alist endpoint to end in `/` and requires it to be a
/// server root.
pub fn validate_alist_url(raw: &str) -> Result<Url, ConfigError> {
    let normalized = format!("{}/", raw.trim().trim_end_matches('/'));
    let url = Url::parse(&normalized).map_err(|_| ConfigError::InvalidAlistUrl(normalized.clone()))?;
    if url.path() != "/" {
        return Err(ConfigError::AlistUrlNotRoot(normalized));
    }
    Ok(url)
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}
