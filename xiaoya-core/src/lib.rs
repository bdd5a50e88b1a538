use std::time::Duration;

pub mod alist;
pub mod crawler;
pub mod error;
pub mod mirror;
pub mod record;
pub mod retry;
pub mod walk;

pub use alist::AlistClient;
pub use crawler::{MirrorCrawler, RemoteFile};
pub use error::{Failure, Op, RemoteError};
pub use mirror::{MirrorError, MirrorSelector, RankedMirror};
pub use record::FileRecord;
pub use retry::RetryPolicy;
pub use walk::{RemoteTree, Visitor, WalkError, WalkFlow};

/// Sent on every request; some mirrors reject non-browser clients.
pub const GLOBAL_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/96.0.4664.110 Safari/537.36";

/// Per-request timeout for the crawler and the listing API.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
