use reqwest::Client;
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

use crate::error::{Failure, Op, RemoteError};
use crate::record::{FileRecord, join_path};
use crate::retry::RetryPolicy;
use crate::walk::RemoteTree;
use crate::{GLOBAL_USER_AGENT, REQUEST_TIMEOUT};

pub const PAGE_SIZE: u32 = 64;
const API_OK: i64 = 200;

/// Client for the Alist `fs` listing API.
#[derive(Clone)]
pub struct AlistClient {
    http: Client,
    endpoint: Url,
    retry: RetryPolicy,
}

impl AlistClient {
    /// `endpoint` is the server root, e.g. `http://xiaoya.host:5678/`.
    pub fn new(endpoint: &str) -> Result<Self, RemoteError> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(GLOBAL_USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn get(&self, path: &str) -> Result<GetData, RemoteError> {
        let payload = GetPayload {
            path,
            password: "",
        };
        self.call(Op::Info, "api/fs/get", path, &payload).await
    }

    /// One page of a directory listing; pages start at 1.
    pub async fn list(&self, path: &str, page: u32, per_page: u32) -> Result<ListData, RemoteError> {
        let payload = ListPayload {
            path,
            page,
            per_page,
            password: "",
            refresh: false,
        };
        self.call(Op::List, "api/fs/list", path, &payload).await
    }

    async fn call<P, T>(&self, op: Op, api: &str, path: &str, payload: &P) -> Result<T, RemoteError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.endpoint.join(api)?;
        self.retry
            .run(op, path, || async {
                let response = self.http.post(url.clone()).json(payload).send().await?;
                if !response.status().is_success() {
                    return Err(Failure::Status(response.status()));
                }
                let body = response.bytes().await?;
                let envelope: Envelope<T> = serde_json::from_slice(&body)
                    .map_err(|err| Failure::Malformed(err.to_string()))?;
                if envelope.code != API_OK {
                    return Err(Failure::Api {
                        code: envelope.code,
                        message: envelope.message,
                    });
                }
                envelope
                    .data
                    .ok_or_else(|| Failure::Malformed("missing data".to_string()))
            })
            .await
    }
}

impl RemoteTree for AlistClient {
    async fn stat(&self, path: &str) -> Result<FileRecord, RemoteError> {
        let data = self.get(path).await?;
        Ok(data.into_record(path))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<FileRecord>, RemoteError> {
        let mut entries = Vec::new();
        let mut page = 1;
        loop {
            let data = self.list(path, page, PAGE_SIZE).await?;
            let content = data.content.unwrap_or_default();
            if content.is_empty() {
                break;
            }
            for entry in content {
                let child = join_path(path, &entry.name);
                entries.push(entry.into_record(&child));
            }
            if entries.len() as u64 >= data.total {
                break;
            }
            page += 1;
        }
        tracing::debug!(path, entries = entries.len(), "listed alist directory");
        Ok(entries)
    }
}

#[derive(Debug, Serialize)]
struct GetPayload<'a> {
    path: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct ListPayload<'a> {
    path: &'a str,
    page: u32,
    per_page: u32,
    password: &'a str,
    refresh: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetData {
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default, deserialize_with = "rfc3339_seconds")]
    pub modified: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub raw_url: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub readme: String,
    #[serde(rename = "type", default)]
    pub kind: i64,
}

impl GetData {
    fn into_record(self, path: &str) -> FileRecord {
        let mut record = FileRecord::file(path, self.size, self.modified, "");
        record.is_dir = self.is_dir;
        record
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListData {
    #[serde(default)]
    pub content: Option<Vec<ListEntry>>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub readme: String,
    #[serde(default)]
    pub write: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListEntry {
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default, deserialize_with = "rfc3339_seconds")]
    pub modified: i64,
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(rename = "type", default)]
    pub kind: i64,
}

impl ListEntry {
    fn into_record(self, path: &str) -> FileRecord {
        if self.is_dir {
            let mut record = FileRecord::dir(path);
            record.size = self.size;
            record.modified = self.modified;
            record
        } else {
            FileRecord::file(path, self.size, self.modified, "")
        }
    }
}

fn rfc3339_seconds<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(0),
        Some(raw) => OffsetDateTime::parse(raw, &Rfc3339)
            .map(|time| time.unix_timestamp())
            .map_err(serde::de::Error::custom),
    }
}
