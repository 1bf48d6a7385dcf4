use reqwest::{Client, Url};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{ExamAiError, preview_key};

/// Gemini v1beta REST API base.
pub const DEFAULT_GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

/// What one `generateContent` call gave back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeminiReply {
    /// `candidates[0].content.parts[0].text`
    pub text: Option<String>,
    /// `usageMetadata.totalTokenCount`
    pub total_tokens: Option<u64>,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

/// HTTP leg of a call: one POST per prompt, key passed as `?key=`.
#[derive(Clone, Debug)]
pub struct GeminiTransport {
    client: Client,
    base: Url,
    model: String,
}

impl GeminiTransport {
    pub fn new(endpoint: &str, model: &str) -> Result<Self, ExamAiError> {
        Self::with_client(Client::new(), endpoint, model)
    }

    pub fn with_client(client: Client, endpoint: &str, model: &str) -> Result<Self, ExamAiError> {
        let base = Url::parse(endpoint).map_err(|source| ExamAiError::InvalidEndpoint {
            endpoint: endpoint.to_owned(),
            source,
        })?;
        if base.cannot_be_a_base() {
            return Err(ExamAiError::InvalidEndpoint {
                endpoint: endpoint.to_owned(),
                source: url::ParseError::RelativeUrlWithCannotBeABaseBase,
            });
        }
        Ok(Self {
            client,
            base,
            model: model.to_owned(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn generate_url(&self, key: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("models")
                .push(&format!("{}:generateContent", self.model));
        }
        url.query_pairs_mut().append_pair("key", key);
        url
    }

    /// Sends the prompt. Transport errors, non-2xx statuses, error-bearing
    /// bodies and undecodable envelopes all surface as `RequestFailed`; no
    /// usage is reported for them.
    pub async fn generate(&self, key: &str, prompt: &str) -> Result<GeminiReply, ExamAiError> {
        let body = GenerateBody {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };

        let response = self
            .client
            .post(self.generate_url(key))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                // The request URL carries the key in its query string.
                let err = err.without_url();
                warn!(key = %preview_key(key), error = %err, "AI request did not complete");
                ExamAiError::RequestFailed {
                    status: err.status(),
                    message: err.to_string(),
                }
            })?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|err| ExamAiError::RequestFailed {
            status: Some(status),
            message: err.without_url().to_string(),
        })?;
        debug!(key = %preview_key(key), %status, bytes = bytes.len(), "AI response received");

        let envelope: Option<Value> = serde_json::from_slice(&bytes).ok();
        if !status.is_success() {
            return Err(ExamAiError::RequestFailed {
                status: Some(status),
                message: envelope
                    .as_ref()
                    .and_then(error_message)
                    .unwrap_or_else(|| "provider returned an error status".to_owned()),
            });
        }

        let Some(envelope) = envelope else {
            return Err(ExamAiError::RequestFailed {
                status: Some(status),
                message: "provider response is not JSON".to_owned(),
            });
        };
        if envelope.get("error").is_some_and(|e| !e.is_null()) {
            return Err(ExamAiError::RequestFailed {
                status: Some(status),
                message: error_message(&envelope)
                    .unwrap_or_else(|| "provider reported an error".to_owned()),
            });
        }

        Ok(reply_from_envelope(&envelope))
    }
}

fn error_message(envelope: &Value) -> Option<String> {
    let error = envelope.get("error")?;
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| error.as_str().map(str::to_owned))
}

pub fn reply_from_envelope(envelope: &Value) -> GeminiReply {
    let text = envelope
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let total_tokens = envelope
        .pointer("/usageMetadata/totalTokenCount")
        .and_then(Value::as_u64);
    GeminiReply { text, total_tokens }
}
