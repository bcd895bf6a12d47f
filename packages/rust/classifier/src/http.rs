//! Classifier speaking the OpenAI-compatible chat-completions protocol.

use std::time::Duration;

use async_trait::async_trait;
use linetag_shared::{Chunk, ClassifierConfig, LinetagError, Proposal, ReferenceTaxonomy};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::Classifier;
use crate::error::ClassifyError;
use crate::profile::PromptProfile;
use crate::response::{align_with_chunk, parse_proposals};

/// User-Agent string for classification requests.
const USER_AGENT: &str = concat!("Linetag/", env!("CARGO_PKG_VERSION"));

/// Reply contract appended to every system prompt.
const REPLY_CONTRACT: &str = "Reply with a single JSON object of the form \
{\"results\": [{\"id\": <record id>, \"line\": <string or null>, \"item\": <string or null>}]} \
containing exactly one entry per input record. Use null when there is no match.";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct InputRecord<'a> {
    id: &'a str,
    keyword: &'a str,
    line: Option<&'a str>,
    item: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct InputPayload<'a> {
    records: Vec<InputRecord<'a>>,
}

// ---------------------------------------------------------------------------
// HttpClassifier
// ---------------------------------------------------------------------------

/// Chat-completions classifier over HTTP.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl HttpClassifier {
    /// Build a classifier for `base_url` (e.g. `https://api.openai.com/v1`).
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> linetag_shared::Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| LinetagError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key: api_key.into(),
        })
    }

    /// Build from the `[classifier]` config section and an already-resolved key.
    pub fn from_config(config: &ClassifierConfig, api_key: String) -> linetag_shared::Result<Self> {
        Self::new(
            &config.base_url,
            config.model.clone(),
            api_key,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn system_prompt(profile: &PromptProfile, reference: Option<&ReferenceTaxonomy>) -> String {
        let mut prompt = profile.instructions.trim().to_string();
        prompt.push_str("\n\n");
        prompt.push_str(REPLY_CONTRACT);

        if let (true, Some(taxonomy)) = (profile.attach_reference, reference) {
            prompt.push_str("\n\nReference taxonomy (Line: Item; Item; ...):\n");
            prompt.push_str(&taxonomy.render());
        }
        prompt
    }

    fn user_prompt(chunk: &Chunk) -> Result<String, ClassifyError> {
        let payload = InputPayload {
            records: chunk
                .records
                .iter()
                .map(|r| InputRecord {
                    id: r.id.as_str(),
                    keyword: &r.keyword,
                    line: r.line.as_deref(),
                    item: r.item.as_deref(),
                })
                .collect(),
        };
        serde_json::to_string(&payload)
            .map_err(|e| ClassifyError::backend(format!("failed to encode chunk: {e}"), false))
    }
}

/// Map a non-success HTTP status to a backend error.
fn status_error(status: StatusCode, body: &str) -> ClassifyError {
    let retryable = status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error();
    let snippet: String = body.chars().take(200).collect();
    ClassifyError::backend(format!("HTTP {status}: {snippet}"), retryable)
}

/// Map a transport failure to a backend error.
fn transport_error(err: &reqwest::Error) -> ClassifyError {
    let retryable = err.is_timeout() || err.is_connect() || err.is_request() || err.is_body();
    ClassifyError::backend(format!("transport: {err}"), retryable)
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(chunk = chunk.index, pass = %profile.pass, records = chunk.len()))]
    async fn classify(
        &self,
        chunk: &Chunk,
        profile: &PromptProfile,
        reference: Option<&ReferenceTaxonomy>,
    ) -> Result<Vec<Proposal>, ClassifyError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: Self::system_prompt(profile, reference),
                },
                ChatMessage {
                    role: "user",
                    content: Self::user_prompt(chunk)?,
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
            temperature: 0.0,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error(&e))?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        let reply: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| ClassifyError::format(format!("unreadable completion body: {e}")))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ClassifyError::format("completion has no message content"))?;

        let proposals = parse_proposals(&content)?;
        debug!(returned = proposals.len(), "classification reply parsed");
        Ok(align_with_chunk(chunk, proposals))
    }
}
