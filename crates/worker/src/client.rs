//! HTTP client for the blob server.

use std::time::Duration;

use reqwest::StatusCode;
use url::Url;

use lazyfs_common::Entry;

/// Server fetches can pull multi-megabyte shared objects; the timeout
/// is generous so only a truly wedged transfer gets abandoned.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("not found on blob server")]
    NotFound,

    #[error("unexpected status: {0}")]
    Status(StatusCode),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Client side of the blob server's fetch protocol. A path with a
/// trailing slash asks for a directory listing instead of an entry.
#[derive(Debug, Clone)]
pub struct BlobClient {
    base: Url,
    http: reqwest::Client,
}

impl BlobClient {
    pub fn new(base: Url) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { base, http })
    }

    /// Fetch a single entry, bytes included.
    pub async fn fetch_entry(&self, key: &str) -> Result<Entry, FetchError> {
        let response = self
            .http
            .get(self.fetch_url())
            .query(&[("filepath", key)])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            status => Err(FetchError::Status(status)),
        }
    }

    /// Fetch the listing for a directory: names and metadata only, no
    /// file contents.
    pub async fn fetch_listing(&self, dir_path: &str) -> Result<Vec<Entry>, FetchError> {
        let filepath = if dir_path.ends_with('/') {
            dir_path.to_string()
        } else {
            format!("{dir_path}/")
        };
        let response = self
            .http
            .get(self.fetch_url())
            .query(&[("filepath", filepath.as_str())])
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            status => Err(FetchError::Status(status)),
        }
    }

    fn fetch_url(&self) -> Url {
        let mut url = self.base.clone();
        url.set_path("/fetch");
        url
    }
}
