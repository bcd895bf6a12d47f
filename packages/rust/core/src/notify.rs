//! Stage notifications over a chat webhook.
//!
//! Delivery is best-effort: [`notify_best_effort`] logs failures at warn and
//! never returns an error to the pipeline.

use std::time::Duration;

use async_trait::async_trait;
use linetag_shared::{LinetagError, Result};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::merger::MergedTable;
use crate::pass::PassReport;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Destination for one-line stage messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        debug!(message, "notification skipped (no webhook configured)");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Posts `{"text": message}` to a webhook URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: url::Url,
}

impl WebhookNotifier {
    pub fn new(webhook_url: &str) -> Result<Self> {
        let url = url::Url::parse(webhook_url)
            .map_err(|e| LinetagError::config(format!("invalid webhook URL: {e}")))?;
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| LinetagError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(&WebhookPayload { text: message })
            .send()
            .await
            .map_err(|e| LinetagError::Network(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LinetagError::Network(format!("webhook returned HTTP {status}")));
        }
        Ok(())
    }
}

/// Send a message, logging instead of failing.
pub async fn notify_best_effort(notifier: &dyn Notifier, message: &str) {
    if let Err(e) = notifier.notify(message).await {
        warn!(error = %e, "notification not delivered");
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

pub fn run_started(run_date: &str, records: usize) -> String {
    format!("linetag {run_date}: started with {records} records")
}

pub fn pass_finished(run_date: &str, report: &PassReport) -> String {
    format!("linetag {run_date}: {}", report.summary())
}

pub fn run_succeeded(run_date: &str, table: &MergedTable, published: Option<usize>) -> String {
    let mut message = format!(
        "linetag {run_date}: merged {} records, {} resolved, {} unresolved, {} chunks failed",
        table.len(),
        table.resolved(),
        table.unresolved(),
        table.failed_chunks.len(),
    );
    if let Some(rows) = published {
        message.push_str(&format!(", {rows} rows published"));
    }
    message
}

pub fn run_failed(run_date: &str, stage: &str, error: &LinetagError) -> String {
    format!("linetag {run_date}: FAILED during {stage}: {error}")
}
