//! Quota-aware Gemini client used to generate and grade exam questions.
//!
//! Several API keys share one quota document. Before every call a key is
//! picked that is still inside its per-minute token, per-minute request and
//! per-day request budgets; after the call its counters are folded back into
//! the document.

pub mod cache;
pub mod client;
pub mod extract;
pub mod gemini;
pub mod limits;
pub mod prompt;
pub mod recorder;
pub mod roster;
pub mod selector;
pub mod store;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use cache::{KeyCache, LAST_KEY_SLOT, MemoryKeyCache, SqliteKeyCache};
pub use client::{
    Alternative, Difficulty, EssayItem, ExamAi, GradeResult, Phase, Question, QuestionKind,
    QuestionRequest, QuestionType,
};
pub use extract::MalformedResponse;
pub use gemini::{DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL, GeminiReply, GeminiTransport};
pub use limits::{EffectiveUsage, KeyLimiter, QuotaLimits, QuotaRecord};
pub use recorder::UsageRecorder;
pub use roster::{KeyRoster, KeyUsage};
pub use selector::KeySelector;
pub use store::{
    DEFAULT_QUOTA_DOCUMENT, MemoryQuotaStore, QuotaDocument, QuotaSnapshot, QuotaStore,
    SqliteQuotaStore, WriteMode, open_pool,
};

#[derive(Debug, Error)]
pub enum ExamAiError {
    #[error("no AI key is within its budget right now, wait a moment or configure another key")]
    QuotaExhausted,
    #[error("AI request failed{}: {message}", status_suffix(.status))]
    RequestFailed {
        status: Option<StatusCode>,
        message: String,
    },
    #[error("malformed AI response: {0}")]
    MalformedAiResponse(#[from] MalformedResponse),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExamAiError {
    /// Whether the failure was caused by the AI provider or by the key budget,
    /// as opposed to local storage or caller input.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ExamAiError::QuotaExhausted
                | ExamAiError::RequestFailed { .. }
                | ExamAiError::MalformedAiResponse(_)
        )
    }
}

fn status_suffix(status: &Option<StatusCode>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

/// Current wall clock in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Short, log-safe prefix of a secret key.
pub fn preview_key(key: &str) -> String {
    let shown: String = key.chars().take(6).collect();
    format!("{shown}…")
}

/// Stable identifier for a key that does not reveal the secret.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(digest);
    encoded[..12].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_key_handles_short_and_multibyte_keys() {
        assert_eq!(preview_key("AIzaSyExample"), "AIzaSy…");
        assert_eq!(preview_key("ab"), "ab…");
        assert_eq!(preview_key("çãõéíúàb"), "çãõéíú…");
    }

    #[test]
    fn fingerprint_is_stable_and_opaque() {
        let first = key_fingerprint("AIzaSyExample");
        assert_eq!(first, key_fingerprint("AIzaSyExample"));
        assert_ne!(first, key_fingerprint("AIzaSyOther"));
        assert_eq!(first.len(), 12);
        assert!(!first.contains("AIza"));
    }

    #[test]
    fn request_failed_message_mentions_status() {
        let err = ExamAiError::RequestFailed {
            status: Some(StatusCode::BAD_GATEWAY),
            message: "upstream down".into(),
        };
        assert_eq!(
            err.to_string(),
            "AI request failed (502 Bad Gateway): upstream down"
        );
        assert!(err.is_upstream());
        let err = ExamAiError::RequestFailed {
            status: None,
            message: "timed out".into(),
        };
        assert_eq!(err.to_string(), "AI request failed: timed out");
        assert!(!ExamAiError::InvalidRequest("x".into()).is_upstream());
    }
}
