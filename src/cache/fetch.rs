// Remote image fetching.
// Wraps the HTTP client behind a trait so the cache can be driven without a network.

use async_trait::async_trait;
use reqwest::{
    Client,
    header::{ACCEPT, HeaderMap, HeaderValue, USER_AGENT},
};

use crate::error::{EgardenError, Result};

/// Source of remote image bytes.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Download the body at `uri`. Non-success statuses are errors.
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>>;
}

/// HTTP fetcher backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("image/*"));
        headers.insert(USER_AGENT, HeaderValue::from_static("egarden-core"));

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(EgardenError::Http)?;

        Ok(Self::with_client(client))
    }

    /// Use an existing client, e.g. one shared with other services.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        let response = self.client.get(uri).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EgardenError::FetchStatus {
                uri: uri.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_uri_is_an_error() {
        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher.fetch("not a uri").await.unwrap_err();
        assert!(matches!(err, EgardenError::Http(_)));
    }
}
