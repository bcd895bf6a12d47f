//! Downstream publisher for the merged table.
//!
//! Rows go out as JSON batches over HTTP PUT. Each batch must acknowledge
//! exactly the number of rows it carried.

use std::time::Duration;

use async_trait::async_trait;
use linetag_shared::{LinetagError, PublishConfig, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::merger::{MergedRow, MergedTable};
use crate::retry::RetryPolicy;

const PUBLISH_TIMEOUT: Duration = Duration::from_secs(120);

/// Sink for a finished merged table. Returns acknowledged rows.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, table: &MergedTable) -> Result<usize>;
}

#[derive(Serialize)]
struct PublishBatch<'a> {
    run_date: &'a str,
    batch: usize,
    rows: &'a [MergedRow],
}

#[derive(Debug, Default, Deserialize)]
struct PublishAck {
    #[serde(default, alias = "count")]
    accepted: Option<usize>,
}

/// PUTs merged rows to an HTTP endpoint in fixed-size batches.
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: Client,
    endpoint: url::Url,
    batch_size: usize,
    retry: RetryPolicy,
}

impl HttpPublisher {
    pub fn new(endpoint: &str, batch_size: usize, retry: RetryPolicy) -> Result<Self> {
        if batch_size == 0 {
            return Err(LinetagError::validation("publish batch_size must be at least 1"));
        }
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| LinetagError::config(format!("invalid publish endpoint '{endpoint}': {e}")))?;
        let client = Client::builder()
            .timeout(PUBLISH_TIMEOUT)
            .build()
            .map_err(|e| LinetagError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            batch_size,
            retry,
        })
    }

    /// Build from the `[publish]` section; `None` when no endpoint is set.
    pub fn from_config(config: &PublishConfig, retry: RetryPolicy) -> Result<Option<Self>> {
        config
            .endpoint
            .as_deref()
            .map(|endpoint| Self::new(endpoint, config.batch_size, retry))
            .transpose()
    }

    async fn put_batch(&self, run_date: &str, batch: usize, rows: &[MergedRow]) -> Result<usize> {
        let body = PublishBatch {
            run_date,
            batch,
            rows,
        };
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = self.client.put(self.endpoint.clone()).json(&body).send().await;

            let retryable_error = match result {
                Ok(response) if response.status().is_success() => {
                    let text = response.text().await.map_err(|e| {
                        LinetagError::Publish(format!("batch {batch}: failed to read acknowledgement: {e}"))
                    })?;
                    let ack: PublishAck = if text.trim().is_empty() {
                        PublishAck::default()
                    } else {
                        serde_json::from_str(&text).map_err(|e| {
                            LinetagError::Publish(format!("batch {batch}: unreadable acknowledgement: {e}"))
                        })?
                    };
                    let Some(accepted) = ack.accepted else {
                        return Err(LinetagError::Publish(format!(
                            "batch {batch}: response did not acknowledge a row count"
                        )));
                    };
                    return Ok(accepted);
                }
                Ok(response) => {
                    let status = response.status();
                    if !is_retryable(status) {
                        return Err(LinetagError::Publish(format!(
                            "batch {batch}: endpoint returned HTTP {status}"
                        )));
                    }
                    format!("HTTP {status}")
                }
                Err(e) => format!("request failed: {e}"),
            };

            if attempt > self.retry.max_retries {
                return Err(LinetagError::Publish(format!(
                    "batch {batch}: gave up after {attempt} attempts ({retryable_error})"
                )));
            }
            warn!(batch, attempt, error = %retryable_error, "publish attempt failed, retrying");
            let delay = self.retry.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[async_trait]
impl Publisher for HttpPublisher {
    #[instrument(skip_all, fields(endpoint = %self.endpoint, rows = table.len()))]
    async fn publish(&self, table: &MergedTable) -> Result<usize> {
        let mut acknowledged = 0;
        for (batch, rows) in table.rows.chunks(self.batch_size).enumerate() {
            let accepted = self.put_batch(&table.run_date, batch, rows).await?;
            if accepted != rows.len() {
                return Err(LinetagError::Publish(format!(
                    "batch {batch}: sent {} rows, endpoint acknowledged {accepted}",
                    rows.len()
                )));
            }
            debug!(batch, accepted, "batch published");
            acknowledged += accepted;
        }

        info!(acknowledged, "merged table published");
        Ok(acknowledged)
    }
}
