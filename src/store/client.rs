use std::time::Duration;

use reqwest::Client;

use super::AttachmentStore;
use super::error::FetchError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Fetches attachment bytes over HTTP(S), or from disk for `file://` URLs.
///
/// Authentication is expected to travel inside the URL (signed download
/// links), so no credentials are attached to requests.
pub struct HttpAttachmentStore {
    client: Client,
    max_bytes: u64,
}

impl HttpAttachmentStore {
    pub fn new(max_bytes: u64) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client, max_bytes })
    }

    fn check_size(&self, url: &str, size: u64) -> Result<(), FetchError> {
        if size > self.max_bytes {
            return Err(FetchError::TooLarge {
                url: url.to_string(),
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }

    async fn fetch_local(&self, url: &str, path: &str) -> Result<Vec<u8>, FetchError> {
        let metadata = tokio::fs::metadata(path).await?;
        self.check_size(url, metadata.len())?;
        Ok(tokio::fs::read(path).await?)
    }

    async fn fetch_remote(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        if let Some(len) = response.content_length() {
            self.check_size(url, len)?;
        }

        let body = response.bytes().await?;
        self.check_size(url, body.len() as u64)?;
        Ok(body.to_vec())
    }
}

impl AttachmentStore for HttpAttachmentStore {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        if let Some(path) = url.strip_prefix("file://") {
            return self.fetch_local(url, path).await;
        }
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.fetch_remote(url).await;
        }
        Err(FetchError::UnsupportedScheme(url.to_string()))
    }
}
