//! HTTP client for the pricing service REST endpoints.

use crate::backend::{BoxFuture, PricingBackend, SyncAck};
use crate::error::{RestError, RestResult};
use pricesync_core::{EntityId, PendingEdit};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a poll request.
#[derive(Debug, Serialize)]
struct PollRequest<'a> {
    ids: &'a [EntityId],
}

/// Body of a direct sync push.
#[derive(Debug, Serialize)]
struct SyncRequest<'a> {
    #[serde(rename = "type")]
    request_type: &'static str,
    edits: &'a [PendingEdit],
}

/// Client for the pricing service REST API.
pub struct HttpPricingClient {
    /// HTTP client.
    client: Client,
    /// Base URL, without trailing slash (e.g., "https://pricing.example.com/api").
    base_url: String,
}

impl HttpPricingClient {
    /// Create a new client.
    pub fn new(base_url: impl Into<String>) -> RestResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RestError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        let base_url: String = base_url.into();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn poll_url(&self) -> String {
        format!("{}/prices/poll", self.base_url)
    }

    fn sync_url(&self) -> String {
        format!("{}/prices/sync", self.base_url)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
    ) -> RestResult<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| RestError::HttpClient(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RestError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    /// Fetch current prices for `ids` as a raw message body.
    pub async fn fetch_prices(&self, ids: &[EntityId]) -> RestResult<String> {
        debug!(count = ids.len(), "Polling prices");

        let response = self.post_json(&self.poll_url(), &PollRequest { ids }).await?;
        response
            .text()
            .await
            .map_err(|e| RestError::ParseError(format!("Failed to read poll body: {e}")))
    }

    /// Push pending edits and return the service's per-edit verdict.
    pub async fn send_edits(&self, edits: &[PendingEdit]) -> RestResult<SyncAck> {
        info!(count = edits.len(), "Pushing pending edits");

        let request = SyncRequest {
            request_type: "sync",
            edits,
        };
        let response = self.post_json(&self.sync_url(), &request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| RestError::ParseError(format!("Failed to read sync body: {e}")))?;

        Ok(serde_json::from_str(&body)?)
    }
}

impl PricingBackend for HttpPricingClient {
    fn poll<'a>(&'a self, ids: &'a [EntityId]) -> BoxFuture<'a, RestResult<String>> {
        Box::pin(self.fetch_prices(ids))
    }

    fn push_edits<'a>(&'a self, edits: &'a [PendingEdit]) -> BoxFuture<'a, RestResult<SyncAck>> {
        Box::pin(self.send_edits(edits))
    }
}
