//! Client for the remote resource store.
//!
//! The store is a json-server style REST API with one collection per
//! [`ResourceKind`]. Every call takes a [`CancellationToken`]; a cancelled
//! token aborts the request and any pending body read.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use reqwest::header::{ETAG, IF_MATCH};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Courses,
    Users,
}

impl ResourceKind {
    pub fn path(self) -> &'static str {
        match self {
            Self::Courses => "courses",
            Self::Users => "users",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{kind}/{id} not found")]
    NotFound { kind: ResourceKind, id: String },
    #[error("{kind}/{id} was modified concurrently")]
    Conflict { kind: ResourceKind, id: String },
    #[error("remote store returned status {0}")]
    Status(StatusCode),
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid store url: {0}")]
    Url(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ApiError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status(code) => code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Conflict { .. } | Self::Cancelled => true,
            Self::NotFound { .. } | Self::Url(_) => false,
        }
    }
}

/// A record together with the store's version tag, if it sent one.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub etag: Option<String>,
}

#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base: Url,
}

impl RestClient {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self, ApiError> {
        let mut base = Url::parse(base_url).map_err(|e| ApiError::Url(format!("{base_url}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ApiError::Url(base_url.to_owned()));
        }
        // join() replaces the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let mut builder = Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        Ok(Self {
            http: builder.build()?,
            base,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, kind: ResourceKind, id: Option<&str>) -> Result<Url, ApiError> {
        let rel = match id {
            Some(id) => format!("{}/{}", kind.path(), id),
            None => kind.path().to_owned(),
        };
        self.base
            .join(&rel)
            .map_err(|e| ApiError::Url(format!("{rel}: {e}")))
    }

    /// List every record of a collection.
    pub async fn list<T: DeserializeOwned>(
        &self,
        kind: ResourceKind,
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, ApiError> {
        self.list_where(kind, &[], cancel).await
    }

    /// List records matching exact field filters (`?field=value`).
    pub async fn list_where<T: DeserializeOwned>(
        &self,
        kind: ResourceKind,
        filters: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Vec<T>, ApiError> {
        let req = self.http.get(self.url(kind, None)?).query(filters);
        cancellable(cancel, async {
            let resp = checked(req, kind, "").await?;
            let records: Vec<serde_json::Value> = resp.json().await?;
            Ok(decode_records(kind, records))
        })
        .await
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        kind: ResourceKind,
        id: impl fmt::Display,
        cancel: &CancellationToken,
    ) -> Result<T, ApiError> {
        Ok(self.get_versioned(kind, id, cancel).await?.value)
    }

    pub async fn get_versioned<T: DeserializeOwned>(
        &self,
        kind: ResourceKind,
        id: impl fmt::Display,
        cancel: &CancellationToken,
    ) -> Result<Versioned<T>, ApiError> {
        let id = id.to_string();
        let req = self.http.get(self.url(kind, Some(&id))?);
        cancellable(cancel, async {
            let resp = checked(req, kind, &id).await?;
            let etag = resp
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            Ok(Versioned {
                value: resp.json().await?,
                etag,
            })
        })
        .await
    }

    pub async fn create<B, T>(
        &self,
        kind: ResourceKind,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let req = self.http.post(self.url(kind, None)?).json(body);
        cancellable(cancel, async {
            let resp = checked(req, kind, "").await?;
            Ok(resp.json().await?)
        })
        .await
    }

    /// Full replace. With `if_match` set the store rejects the write with
    /// `412` when the record changed since that tag was read.
    pub async fn replace<B, T>(
        &self,
        kind: ResourceKind,
        id: impl fmt::Display,
        body: &B,
        if_match: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let id = id.to_string();
        let mut req = self.http.put(self.url(kind, Some(&id))?).json(body);
        if let Some(tag) = if_match {
            req = req.header(IF_MATCH, tag);
        }
        cancellable(cancel, async {
            let resp = checked(req, kind, &id).await?;
            Ok(resp.json().await?)
        })
        .await
    }

    pub async fn patch<B, T>(
        &self,
        kind: ResourceKind,
        id: impl fmt::Display,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let id = id.to_string();
        let req = self.http.patch(self.url(kind, Some(&id))?).json(body);
        cancellable(cancel, async {
            let resp = checked(req, kind, &id).await?;
            Ok(resp.json().await?)
        })
        .await
    }

    pub async fn delete(
        &self,
        kind: ResourceKind,
        id: impl fmt::Display,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let id = id.to_string();
        let req = self.http.delete(self.url(kind, Some(&id))?);
        cancellable(cancel, async {
            checked(req, kind, &id).await?;
            Ok(())
        })
        .await
    }
}

async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    if cancel.is_cancelled() {
        return Err(ApiError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ApiError::Cancelled),
        res = fut => res,
    }
}

async fn checked(req: RequestBuilder, kind: ResourceKind, id: &str) -> Result<Response, ApiError> {
    let resp = req.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    tracing::debug!(%kind, id, %status, "remote store rejected request");
    Err(match status {
        StatusCode::NOT_FOUND => ApiError::NotFound {
            kind,
            id: id.to_owned(),
        },
        StatusCode::PRECONDITION_FAILED => ApiError::Conflict {
            kind,
            id: id.to_owned(),
        },
        other => ApiError::Status(other),
    })
}

/// Decode listed records one by one. A record this client cannot read is
/// logged and left out instead of failing the whole listing.
fn decode_records<T: DeserializeOwned>(kind: ResourceKind, records: Vec<serde_json::Value>) -> Vec<T> {
    records
        .into_iter()
        .filter_map(|record| {
            let id = record.get("id").cloned().unwrap_or_default();
            match serde_json::from_value(record) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(%kind, %id, error = %e, "skipping unreadable record");
                    None
                }
            }
        })
        .collect()
}
