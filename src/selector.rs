use std::sync::Arc;

use tracing::debug;

use crate::limits::KeyLimiter;
use crate::store::{QuotaSnapshot, QuotaStore};
use crate::{ExamAiError, preview_key};

/// 挑选下一次调用使用的 API key。
///
/// A preferred key keeps being used while it has budget, which keeps a user
/// session on one key. Otherwise the first key within budget wins.
#[derive(Clone)]
pub struct KeySelector {
    store: Arc<dyn QuotaStore>,
    limiter: KeyLimiter,
}

impl KeySelector {
    pub fn new(store: Arc<dyn QuotaStore>, limiter: KeyLimiter) -> Self {
        Self { store, limiter }
    }

    pub fn limiter(&self) -> &KeyLimiter {
        &self.limiter
    }

    /// Reads the whole quota document and picks a key, `None` when every
    /// known key is over budget.
    pub async fn select_key(
        &self,
        preferred: Option<&str>,
        now: i64,
    ) -> Result<Option<String>, ExamAiError> {
        let records = self.store.read().await?;
        Ok(self.pick(preferred, &records, now))
    }

    pub fn pick(
        &self,
        preferred: Option<&str>,
        records: &QuotaSnapshot,
        now: i64,
    ) -> Option<String> {
        let preferred = preferred.map(str::trim).filter(|key| !key.is_empty());

        if let Some(key) = preferred {
            match records.get(key) {
                // Never charged yet, so nothing has been spent.
                None => {
                    debug!(key = %preview_key(key), "preferred key has no usage record");
                    return Some(key.to_owned());
                }
                Some(record) if self.limiter.is_within_budget(record, now) => {
                    return Some(key.to_owned());
                }
                Some(_) => {
                    debug!(key = %preview_key(key), "preferred key is over budget");
                }
            }
        }

        for (key, record) in records {
            if preferred == Some(key.as_str()) {
                continue;
            }
            let usage = self.limiter.effective_usage(record, now);
            let within = self.limiter.is_within_budget(record, now);
            debug!(
                key = %preview_key(key),
                tpm = usage.tokens_per_minute,
                rpm = usage.requests_per_minute,
                rpd = usage.requests_per_day,
                within,
                "evaluated key"
            );
            if within {
                return Some(key.clone());
            }
        }

        debug!(known = records.len(), "no key within budget");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{QuotaLimits, QuotaRecord};
    use crate::store::MemoryQuotaStore;

    const T0: i64 = 1_700_000_000_000;

    fn exhausted_at(at: i64) -> QuotaRecord {
        QuotaRecord {
            requests_this_minute: 15,
            last_request_minute_window_start: at,
            ..QuotaRecord::default()
        }
    }

    fn selector(records: QuotaSnapshot) -> KeySelector {
        KeySelector::new(
            Arc::new(MemoryQuotaStore::with_records(records)),
            KeyLimiter::new(QuotaLimits::default()),
        )
    }

    #[test]
    fn preferred_key_within_budget_wins() {
        let mut records = QuotaSnapshot::new();
        records.insert("a".into(), QuotaRecord::default());
        records.insert("b".into(), QuotaRecord::default());

        let picked = selector(QuotaSnapshot::new()).pick(Some("b"), &records, T0);
        assert_eq!(picked.as_deref(), Some("b"));
    }

    #[test]
    fn preferred_key_without_record_is_usable() {
        let mut records = QuotaSnapshot::new();
        records.insert("a".into(), exhausted_at(T0));

        let picked = selector(QuotaSnapshot::new()).pick(Some("fresh"), &records, T0);
        assert_eq!(picked.as_deref(), Some("fresh"));
    }

    #[test]
    fn exhausted_preferred_key_falls_back_to_next() {
        let mut records = QuotaSnapshot::new();
        records.insert("a".into(), exhausted_at(T0));
        records.insert("b".into(), exhausted_at(T0));
        records.insert("c".into(), QuotaRecord::default());

        let picked = selector(QuotaSnapshot::new()).pick(Some("a"), &records, T0 + 1);
        assert_eq!(picked.as_deref(), Some("c"));
    }

    #[test]
    fn nothing_within_budget_yields_none() {
        let mut records = QuotaSnapshot::new();
        records.insert("a".into(), exhausted_at(T0));
        records.insert("b".into(), exhausted_at(T0));

        let selector = selector(QuotaSnapshot::new());
        assert_eq!(selector.pick(Some("a"), &records, T0 + 1), None);
        assert_eq!(selector.pick(None, &records, T0 + 1), None);
    }

    #[test]
    fn empty_document_without_preference_yields_none() {
        let selector = selector(QuotaSnapshot::new());
        assert_eq!(selector.pick(None, &QuotaSnapshot::new(), T0), None);
        assert_eq!(selector.pick(Some("  "), &QuotaSnapshot::new(), T0), None);
    }

    #[test]
    fn expired_minute_window_makes_key_usable_again() {
        let mut records = QuotaSnapshot::new();
        records.insert("a".into(), exhausted_at(T0));

        let selector = selector(QuotaSnapshot::new());
        assert_eq!(selector.pick(None, &records, T0 + 59_999), None);
        assert_eq!(
            selector.pick(None, &records, T0 + 60_000).as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn select_key_reads_through_the_store() {
        let mut records = QuotaSnapshot::new();
        records.insert("a".into(), exhausted_at(T0));
        records.insert("b".into(), QuotaRecord::default());

        let selector = selector(records);
        let picked = selector.select_key(Some("a"), T0 + 1).await.unwrap();
        assert_eq!(picked.as_deref(), Some("b"));
    }
}
