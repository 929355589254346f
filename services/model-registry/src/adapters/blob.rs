//! Read-only artifact existence checks against blob storage.
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("unsupported artifact uri {0}")] UnsupportedUri(String),
    #[error("blob request failed: {0}")] Request(#[from] reqwest::Error),
    #[error("blob storage answered {0}")] Status(u16),
    #[error("io: {0}")] Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobPresence { Present, Missing }

/// Schemes an artifact URI may use.
pub const ARTIFACT_SCHEMES: &[&str] = &["s3", "gs", "http", "https", "file"];

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// HEAD-style probe of one object.
    async fn head(&self, uri: &str) -> Result<BlobPresence, BlobError>;
    async fn ping(&self) -> Result<(), BlobError>;
}

/// `s3://` and `gs://` URIs map onto `{endpoint}/{bucket}/{key}`; `http(s)://`
/// is probed directly and `file://` through the local filesystem.
pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: Option<Url>,
}

impl HttpBlobStore {
    pub fn new(endpoint: Option<&str>, timeout: Duration) -> Result<Self, BlobError> {
        let endpoint = match endpoint {
            Some(raw) => Some(Url::parse(raw).map_err(|_| BlobError::UnsupportedUri(raw.to_string()))?),
            None => None,
        };
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint })
    }

    fn resolve(&self, uri: &Url) -> Result<Url, BlobError> {
        match uri.scheme() {
            "http" | "https" => Ok(uri.clone()),
            "s3" | "gs" => {
                let base = self.endpoint.as_ref().ok_or_else(|| BlobError::UnsupportedUri(format!("{uri} (no blob endpoint configured)")))?;
                let bucket = uri.host_str().ok_or_else(|| BlobError::UnsupportedUri(uri.to_string()))?;
                let path = format!("{}/{}{}", base.as_str().trim_end_matches('/'), bucket, uri.path());
                Url::parse(&path).map_err(|_| BlobError::UnsupportedUri(uri.to_string()))
            }
            _ => Err(BlobError::UnsupportedUri(uri.to_string())),
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn head(&self, uri: &str) -> Result<BlobPresence, BlobError> {
        let parsed = Url::parse(uri).map_err(|_| BlobError::UnsupportedUri(uri.to_string()))?;
        if parsed.scheme() == "file" {
            let path = parsed.to_file_path().map_err(|_| BlobError::UnsupportedUri(uri.to_string()))?;
            return match tokio::fs::metadata(&path).await {
                Ok(_) => Ok(BlobPresence::Present),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BlobPresence::Missing),
                Err(e) => Err(e.into()),
            };
        }
        let target = self.resolve(&parsed)?;
        let resp = self.client.head(target).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(BlobPresence::Present),
            StatusCode::NOT_FOUND => Ok(BlobPresence::Missing),
            s => Err(BlobError::Status(s.as_u16())),
        }
    }

    async fn ping(&self) -> Result<(), BlobError> {
        let Some(endpoint) = &self.endpoint else { return Ok(()) };
        let resp = self.client.head(endpoint.clone()).send().await?;
        if resp.status().is_server_error() { return Err(BlobError::Status(resp.status().as_u16())); }
        Ok(())
    }
}
