use std::fmt;
use std::io::ErrorKind;

use reqwest::StatusCode;
use thiserror::Error;

/// Remote operation a failure is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Head,
    Get,
    Download,
    Info,
    List,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Head => "Head",
            Op::Get => "Get",
            Op::Download => "Download",
            Op::Info => "Info",
            Op::List => "List",
        })
    }
}

/// Outcome of a single failed attempt.
#[derive(Debug, Error)]
pub enum Failure {
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("server returned {0}")]
    Status(StatusCode),
    #[error("api returned code {code}: {message}")]
    Api { code: i64, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl Failure {
    /// Connection resets, timeouts and truncated bodies.
    pub fn is_transient(&self) -> bool {
        matches!(self, Failure::Transport(_))
    }
}

impl From<reqwest::Error> for Failure {
    fn from(err: reqwest::Error) -> Self {
        if is_transient_transport(&err) {
            Failure::Transport(err)
        } else {
            Failure::Request(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{op} {path}: {source}")]
    Failed {
        op: Op,
        path: String,
        #[source]
        source: Failure,
    },
    #[error("{op} {path}: no viable mirror")]
    NoMirror { op: Op, path: String },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl RemoteError {
    pub fn failed(op: Op, path: &str, source: Failure) -> Self {
        RemoteError::Failed {
            op,
            path: path.to_string(),
            source,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            RemoteError::Failed { path, .. } | RemoteError::NoMirror { path, .. } => Some(path),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RemoteError::Failed {
                source: Failure::Status(StatusCode::NOT_FOUND),
                ..
            }
        )
    }
}

fn is_transient_transport(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() || err.is_body() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::TimedOut
            )
        {
            return true;
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_failures_are_not_transient() {
        let failure = Failure::Status(StatusCode::BAD_GATEWAY);
        assert!(!failure.is_transient());
    }

    #[test]
    fn errors_name_operation_and_path() {
        let err = RemoteError::failed(Op::List, "/电影", Failure::Status(StatusCode::NOT_FOUND));
        assert_eq!(err.to_string(), "List /电影: server returned 404 Not Found");
        assert_eq!(err.path(), Some("/电影"));
        assert!(err.is_not_found());
    }
}
