use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::UNIX_EPOCH;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, LAST_MODIFIED};
use reqwest::{Client, Response};
use scraper::{Html, Selector};
use url::Url;

use crate::error::{Failure, Op, RemoteError};
use crate::mirror::MirrorSelector;
use crate::record::{FileRecord, base_name, join_path};
use crate::retry::RetryPolicy;
use crate::walk::RemoteTree;
use crate::{GLOBAL_USER_AGENT, REQUEST_TIMEOUT};

/// Size reported for directories, which the index server gives none for.
pub const DIRECTORY_SIZE_HINT: i64 = 128;

static ANCHOR_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// A file response whose body has not been consumed yet.
pub struct RemoteFile {
    pub record: FileRecord,
    pub response: Response,
}

/// Crawls the HTML directory index served by the metadata mirrors, falling
/// back through the ranked mirror list on every call.
#[derive(Clone)]
pub struct MirrorCrawler {
    http: Client,
    mirrors: Arc<MirrorSelector>,
    retry: RetryPolicy,
}

impl MirrorCrawler {
    pub fn new(mirrors: Arc<MirrorSelector>) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(GLOBAL_USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            mirrors,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn mirrors(&self) -> &Arc<MirrorSelector> {
        &self.mirrors
    }

    pub async fn head(&self, path: &str, mirror: &Url) -> Result<FileRecord, RemoteError> {
        let url = resource_url(mirror, path, false)?;
        let response = self
            .retry
            .run(Op::Head, path, || async {
                let response = self.http.head(url.clone()).send().await?;
                ensure_success(response)
            })
            .await?;

        if is_html(response.headers()) {
            let mut record = FileRecord::dir(path);
            record.size = DIRECTORY_SIZE_HINT;
            return Ok(record);
        }
        Ok(file_record(path, response.headers(), None))
    }

    /// Lists one directory on one mirror. A non-HTML answer lists nothing.
    pub async fn list(&self, path: &str, mirror: &Url) -> Result<Vec<FileRecord>, RemoteError> {
        let url = resource_url(mirror, path, true)?;
        let body = self
            .retry
            .run(Op::Get, path, || async {
                let response = ensure_success(self.http.get(url.clone()).send().await?)?;
                if !is_html(response.headers()) {
                    return Ok(None);
                }
                Ok(Some(response.text().await?))
            })
            .await?;

        Ok(body
            .map(|html| parse_listing(&url, path, &html))
            .unwrap_or_default())
    }

    /// Opens `path` for download from one mirror.
    ///
    /// `Ok(None)` means the mirror answered with an HTML document, which is
    /// never a metadata file.
    pub async fn open(&self, path: &str, mirror: &Url) -> Result<Option<RemoteFile>, RemoteError> {
        let url = resource_url(mirror, path, false)?;
        let response = self
            .retry
            .run(Op::Download, path, || async {
                let response = self.http.get(url.clone()).send().await?;
                ensure_success(response)
            })
            .await?;

        if is_html(response.headers()) {
            return Ok(None);
        }
        let record = file_record(path, response.headers(), response.content_length());
        Ok(Some(RemoteFile { record, response }))
    }
}

impl RemoteTree for MirrorCrawler {
    async fn stat(&self, path: &str) -> Result<FileRecord, RemoteError> {
        let mut last_err = None;
        for mirror in self.mirrors.active() {
            match self.head(path, &mirror).await {
                Ok(record) => return Ok(record),
                Err(err) => {
                    tracing::warn!(%mirror, path, error = %err, "stat failed on mirror");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RemoteError::NoMirror {
            op: Op::Head,
            path: path.to_string(),
        }))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileRecord>, RemoteError> {
        let mut last_err = None;
        for mirror in self.mirrors.active() {
            match self.list(path, &mirror).await {
                Ok(entries) => return Ok(entries),
                Err(err) => {
                    tracing::warn!(%mirror, path, error = %err, "listing failed on mirror");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RemoteError::NoMirror {
            op: Op::Get,
            path: path.to_string(),
        }))
    }
}

/// URL of `path` on `mirror`, one percent-encoded segment at a time.
pub fn resource_url(mirror: &Url, path: &str, directory: bool) -> Result<Url, url::ParseError> {
    let mut encoded = mirror.path().trim_end_matches('/').to_string();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        encoded.push('/');
        encoded.push_str(&urlencoding::encode(segment));
    }
    if directory || encoded.is_empty() {
        encoded.push('/');
    }
    let mut url = mirror.clone();
    url.set_path(&encoded);
    Ok(url)
}

/// Direct children of `dir_path` linked from an index page served at `base`.
/// Links are compared in decoded form.
pub fn parse_listing(base: &Url, dir_path: &str, html: &str) -> Vec<FileRecord> {
    let document = Html::parse_document(html);
    let base_path = decode_path(base.path());
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for anchor in document.select(&ANCHOR_SELECTOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(link) = base.join(href) else {
            continue;
        };
        if link.origin() != base.origin() {
            continue;
        }
        let link_path = decode_path(link.path());
        let Some(rel) = link_path.strip_prefix(base_path.as_str()) else {
            continue;
        };
        let (name, is_dir) = match rel.strip_suffix('/') {
            Some(name) => (name, true),
            None => (rel, false),
        };
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            continue;
        }

        let path = join_path(dir_path, name);
        if !seen.insert(path.clone()) {
            continue;
        }
        entries.push(if is_dir {
            FileRecord::dir(path)
        } else {
            FileRecord::file(path, 0, 0, "")
        });
    }
    entries
}

fn decode_path(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn ensure_success(response: Response) -> Result<Response, Failure> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(Failure::Status(response.status()))
    }
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
        .unwrap_or(false)
}

fn file_record(path: &str, headers: &HeaderMap, body_len: Option<u64>) -> FileRecord {
    let size = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .or_else(|| body_len.map(|len| len as i64))
        .unwrap_or_default();
    let modified = headers
        .get(LAST_MODIFIED)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| httpdate::parse_http_date(value).ok())
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default();
    let etag = headers
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    let mut record = FileRecord::file(path, size, modified, etag);
    record.name = base_name(path).to_string();
    record
}
