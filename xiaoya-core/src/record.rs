/// Extension of placeholder files that carry a single stream URL.
pub const STRM_EXTENSION: &str = ".strm";

/// One entry of a remote tree or of a local index.
///
/// `path` is a POSIX-style absolute path ("/电影/A/A.nfo") and is the key in
/// every index. Directories never take part in change detection, so their
/// `size`, `modified` and `etag` are informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub name: String,
    pub size: i64,
    pub modified: i64,
    pub etag: String,
    pub is_dir: bool,
}

impl FileRecord {
    pub fn file(path: impl Into<String>, size: i64, modified: i64, etag: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: base_name(&path).to_string(),
            path,
            size,
            modified,
            etag: etag.into(),
            is_dir: false,
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            name: base_name(&path).to_string(),
            path,
            size: 0,
            modified: 0,
            etag: String::new(),
            is_dir: true,
        }
    }

    pub fn is_strm(&self) -> bool {
        !self.is_dir && is_strm_path(&self.path)
    }

    /// Whether `self`, seen remotely, should replace `previous`.
    ///
    /// Only a strictly newer record that also differs in size or etag counts;
    /// a missing previous record always does.
    pub fn supersedes(&self, previous: Option<&FileRecord>) -> bool {
        match previous {
            None => true,
            Some(previous) => {
                self.modified > previous.modified
                    && (self.size != previous.size || self.etag != previous.etag)
            }
        }
    }
}

pub fn is_strm_path(path: &str) -> bool {
    base_name(path).ends_with(STRM_EXTENSION)
}

/// Last component of a slash separated path; "/" for the root.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Parent of a slash separated absolute path. The root is its own parent.
pub fn parent_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

pub fn join_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    let name = name.trim_matches('/');
    format!("{parent}/{name}")
}

/// First segment of an absolute path, without slashes; empty for "/".
pub fn top_level_segment(path: &str) -> &str {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
}
