use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::limits::{EffectiveUsage, KeyLimiter, QuotaRecord};
use crate::store::{QuotaDocument, QuotaStore, WriteMode};
use crate::{ExamAiError, key_fingerprint, preview_key};

/// Per-key line of the admin usage report. Never carries the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyUsage {
    pub fingerprint: String,
    pub preview: String,
    pub effective: EffectiveUsage,
    pub total_tokens: u64,
    pub total_requests: u64,
    pub last_used_at: Option<i64>,
    pub within_budget: bool,
}

/// 管理员视角的 key 列表操作。
#[derive(Clone)]
pub struct KeyRoster {
    store: Arc<dyn QuotaStore>,
    limiter: KeyLimiter,
}

impl KeyRoster {
    pub fn new(store: Arc<dyn QuotaStore>, limiter: KeyLimiter) -> Self {
        Self { store, limiter }
    }

    /// Adds a key with zeroed counters. An existing key keeps its counters.
    pub async fn register(&self, key: &str) -> Result<(), ExamAiError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ExamAiError::InvalidRequest(
                "API key must not be empty".to_owned(),
            ));
        }
        self.store
            .write(key, &QuotaRecord::default(), WriteMode::CreateOnly)
            .await?;
        info!(key = %preview_key(key), "AI key registered");
        Ok(())
    }

    /// Whether `key` already has a record in the quota document.
    pub async fn is_registered(&self, key: &str) -> Result<bool, ExamAiError> {
        Ok(self.store.read().await?.contains_key(key.trim()))
    }

    pub async fn usage_report(&self, now: i64) -> Result<Vec<KeyUsage>, ExamAiError> {
        let records = self.store.read().await?;
        Ok(records
            .iter()
            .map(|(key, record)| KeyUsage {
                fingerprint: key_fingerprint(key),
                preview: preview_key(key),
                effective: self.limiter.effective_usage(record, now),
                total_tokens: record.total_tokens_ever,
                total_requests: record.total_requests_ever,
                last_used_at: (record.total_requests_ever > 0)
                    .then_some(record.last_request_minute_window_start),
                within_budget: self.limiter.is_within_budget(record, now),
            })
            .collect())
    }

    pub async fn export_document(&self) -> Result<QuotaDocument, ExamAiError> {
        Ok(QuotaDocument {
            ia_token: self.store.read().await?,
        })
    }

    /// Merges every record of `document` into the store, one key at a time.
    /// Window counters are taken as imported; lifetime totals keep the larger
    /// of the stored and imported values so they never go down. Keys absent
    /// from `document` are left as they are. Returns how many keys were
    /// written.
    pub async fn import_document(&self, document: &QuotaDocument) -> Result<usize, ExamAiError> {
        let current = self.store.read().await?;
        let mut written = 0;
        for (key, record) in &document.ia_token {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let mut merged = *record;
            if let Some(stored) = current.get(key) {
                merged.total_tokens_ever = merged.total_tokens_ever.max(stored.total_tokens_ever);
                merged.total_requests_ever =
                    merged.total_requests_ever.max(stored.total_requests_ever);
            }
            self.store.write(key, &merged, WriteMode::Merge).await?;
            written += 1;
        }
        info!(keys = written, "quota document imported");
        Ok(written)
    }
}
