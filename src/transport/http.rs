//! HTTP fetch transport used by the poll scheduler.

use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::{FetchError, FetchResult, FetchTransport};
use crate::FieldDevice;

/// Fetches device data over HTTP. The client is built once and reused for
/// every request.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        HttpFetcher {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("Failed to build HTTP client"),
        }
    }
}

#[async_trait]
impl FetchTransport for HttpFetcher {
    async fn fetch(&self, device: &FieldDevice) -> FetchResult<Vec<u8>> {
        let url = format!("http://{}:{}/data", device.ip, device.port);

        trace!("requesting device data from {url}");

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let body = response.bytes().await?;

        trace!("fetched {} bytes from {}", body.len(), device.id);
        Ok(body.to_vec())
    }
}
