use std::fmt::Debug;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("base url `{0}` cannot carry a path")]
    InvalidBaseUrl(String),
    #[error("could not build http client: {0}")]
    Client(String),
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("{url} returned an unusable body: {reason}")]
    Body { url: String, reason: String },
}

/// Source of manifest bodies for (feature, version).
#[async_trait]
pub trait ManifestFetcher: Send + Sync + Debug {
    async fn fetch(&self, feature: &str, version: &str) -> Result<String, FetchError>;
}

/// `GET {base}/Proton/{feature}/{version}`
#[derive(Debug, Clone)]
pub struct HttpManifestFetcher {
    base: Url,
    client: Client,
}

impl HttpManifestFetcher {
    pub fn new(base: Url) -> Result<Self, FetchError> {
        if base.cannot_be_a_base() {
            return Err(FetchError::InvalidBaseUrl(base.to_string()));
        }
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { base, client })
    }

    pub fn manifest_url(&self, feature: &str, version: &str) -> Result<Url, FetchError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InvalidBaseUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(["Proton", feature, version]);
        Ok(url)
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    #[tracing::instrument(skip(self))]
    async fn fetch(&self, feature: &str, version: &str) -> Result<String, FetchError> {
        let url = self.manifest_url(feature, version)?;
        let shown = url.to_string();

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport { url: shown.clone(), reason: e.to_string() })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: shown, status: status.as_u16() });
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Body { url: shown.clone(), reason: e.to_string() })?;
        validate_body(&shown, &body)?;
        debug!(url = %shown, bytes = body.len(), "manifest fetched");
        Ok(body)
    }
}

/// Reads `{root}/{feature}/{version}.json`. Lets a manifest tree on disk
/// stand in for the manifest server.
#[derive(Debug, Clone)]
pub struct DirectoryManifestFetcher {
    root: PathBuf,
}

impl DirectoryManifestFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ManifestFetcher for DirectoryManifestFetcher {
    async fn fetch(&self, feature: &str, version: &str) -> Result<String, FetchError> {
        let path = self.root.join(feature).join(format!("{}.json", version));
        let shown = path.display().to_string();
        let body = std::fs::read_to_string(&path)
            .map_err(|e| FetchError::Transport { url: shown.clone(), reason: e.to_string() })?;
        validate_body(&shown, &body)?;
        Ok(body)
    }
}

fn validate_body(url: &str, body: &str) -> Result<(), FetchError> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(_)) => Ok(()),
        Ok(_) => Err(FetchError::Body {
            url: url.to_string(),
            reason: "manifest root is not an object".to_string(),
        }),
        Err(e) => Err(FetchError::Body { url: url.to_string(), reason: e.to_string() }),
    }
}
