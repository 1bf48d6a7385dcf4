use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::limits::{DAY_WINDOW_MS, MINUTE_WINDOW_MS, QuotaRecord, windowed};
use crate::store::{QuotaStore, WriteMode};
use crate::{ExamAiError, preview_key};

/// Folds the cost of a finished call into the key's counters.
///
/// Each write moves every window start to `now`, so the windows slide with
/// traffic instead of being anchored to a fixed origin.
pub fn charge(record: &QuotaRecord, tokens: u64, now: i64) -> QuotaRecord {
    QuotaRecord {
        tokens_this_minute: tokens.saturating_add(windowed(
            record.tokens_this_minute,
            record.last_token_window_start,
            now,
            MINUTE_WINDOW_MS,
        )),
        last_token_window_start: now,
        requests_this_minute: 1u64.saturating_add(windowed(
            record.requests_this_minute,
            record.last_request_minute_window_start,
            now,
            MINUTE_WINDOW_MS,
        )),
        last_request_minute_window_start: now,
        requests_today: 1u64.saturating_add(windowed(
            record.requests_today,
            record.last_request_day_window_start,
            now,
            DAY_WINDOW_MS,
        )),
        last_request_day_window_start: now,
        total_tokens_ever: record.total_tokens_ever.saturating_add(tokens),
        total_requests_ever: record.total_requests_ever.saturating_add(1),
    }
}

pub struct UsageRecorder {
    store: Arc<dyn QuotaStore>,
    // Serializes read-fold-write inside this process only; other instances
    // sharing the document still race with last-writer-wins.
    write_lock: Mutex<()>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Reads the document, charges `tokens` and one request to `key` and
    /// merge-writes the record back. Returns the record as written.
    pub async fn record_usage(
        &self,
        key: &str,
        tokens: u64,
        now: i64,
    ) -> Result<QuotaRecord, ExamAiError> {
        let _guard = self.write_lock.lock().await;

        let records = self.store.read().await?;
        let previous = records.get(key).copied().unwrap_or_default();
        let updated = charge(&previous, tokens, now);
        self.store.write(key, &updated, WriteMode::Merge).await?;

        debug!(
            key = %preview_key(key),
            tokens,
            tpm = updated.tokens_this_minute,
            rpm = updated.requests_this_minute,
            rpd = updated.requests_today,
            "usage recorded"
        );
        Ok(updated)
    }
}
