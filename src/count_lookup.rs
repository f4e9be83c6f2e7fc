//! Record count lookup against the data endpoint
//!
//! The count only decorates page copy, so every failure (timeout, non-2xx,
//! malformed payload, missing provider settings) yields `None`. Callers must
//! read `None` as "unknown", never as zero.

use crate::config::SeoConfig;
use crate::error::{Result, SeoError};
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct RecordsPayload {
    records: Vec<serde_json::Value>,
}

/// Bounded, cancellable count lookup
pub struct CountLookup {
    client: Client,
    timeout: Duration,
    data_endpoint_path: String,
    skip_header: String,
    data_base: String,
    data_table: String,
}

impl CountLookup {
    /// Create a CountLookup from configuration
    pub fn new(config: &SeoConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| SeoError::HttpError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(CountLookup {
            client,
            timeout: Duration::from_millis(config.count_lookup.timeout_ms),
            data_endpoint_path: config.data_endpoint_path.clone(),
            skip_header: config.skip_header.clone(),
            data_base: config.count_lookup.data_base.clone(),
            data_table: config.count_lookup.data_table.clone(),
        })
    }

    /// Override the default timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether provider settings are present; without them no lookup is made
    pub fn is_configured(&self) -> bool {
        !self.data_base.is_empty() && !self.data_table.is_empty()
    }

    /// Data endpoint URL for a category under `origin`
    pub fn endpoint_url(&self, origin: &str, category: &str) -> Result<url::Url> {
        let mut url = url::Url::parse(origin)
            .and_then(|o| o.join(&self.data_endpoint_path))
            .map_err(|e| SeoError::ParseError(format!("Invalid origin '{}': {}", origin, e)))?;

        url.query_pairs_mut()
            .clear()
            .append_pair("base", &self.data_base)
            .append_pair("table", &self.data_table)
            .append_pair("view", category);
        Ok(url)
    }

    /// Fetch the record count using the configured timeout
    pub async fn fetch_count(&self, origin: &str, category: &str) -> Option<usize> {
        self.fetch_count_with_timeout(origin, category, self.timeout).await
    }

    /// Fetch the record count, giving up after `timeout`.
    ///
    /// The in-flight request is dropped (and thereby aborted) on timeout.
    pub async fn fetch_count_with_timeout(
        &self,
        origin: &str,
        category: &str,
        timeout: Duration,
    ) -> Option<usize> {
        if !self.is_configured() {
            debug!("Count lookup skipped: data base/table not configured");
            return None;
        }

        match tokio::time::timeout(timeout, self.try_fetch_count(origin, category)).await {
            Ok(Ok(count)) => {
                info!("Count lookup for view={}: {}", category, count);
                Some(count)
            }
            Ok(Err(e)) => {
                warn!("Count lookup failed for view={}: {}", category, e);
                None
            }
            Err(_) => {
                warn!(
                    "Count lookup timed out for view={} after {}ms",
                    category,
                    timeout.as_millis()
                );
                None
            }
        }
    }

    /// Fetch the record count, reporting why it failed
    pub async fn try_fetch_count(&self, origin: &str, category: &str) -> Result<usize> {
        let url = self.endpoint_url(origin, category)?;
        debug!("Fetching count: url={}", url);

        let response = self
            .client
            .get(url.as_str())
            .header(ACCEPT, "application/json")
            .header(self.skip_header.as_str(), "1")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SeoError::upstream(
                status.as_u16(),
                format!("Data endpoint returned {}", status),
            ));
        }

        let body = response.bytes().await?;
        let payload: RecordsPayload = serde_json::from_slice(&body)?;
        Ok(payload.records.len())
    }
}
