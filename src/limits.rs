//! Per-key budget windows and the pure "can this key be used now" decision.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Length of the per-minute token and request windows.
pub const MINUTE_WINDOW_MS: i64 = 60_000;
/// Length of the per-day request window.
pub const DAY_WINDOW_MS: i64 = 86_400_000;

pub const DEFAULT_TOKENS_PER_MINUTE: u64 = 1_000_000;
pub const DEFAULT_REQUESTS_PER_MINUTE: u64 = 15;
pub const DEFAULT_REQUESTS_PER_DAY: u64 = 1_500;

/// 单个 API key 的用量计数，对应配额文档中 `iaToken.<key>` 的内容。
///
/// Every field decodes leniently: missing, null or non-numeric values become
/// zero, numeric strings are parsed and negatives clamp to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaRecord {
    #[serde(rename = "tpm", deserialize_with = "lenient_count")]
    pub tokens_this_minute: u64,
    #[serde(rename = "lastTpmReset", deserialize_with = "lenient_millis")]
    pub last_token_window_start: i64,
    #[serde(rename = "rpm", deserialize_with = "lenient_count")]
    pub requests_this_minute: u64,
    #[serde(rename = "lastRpmReset", deserialize_with = "lenient_millis")]
    pub last_request_minute_window_start: i64,
    #[serde(rename = "rpd", deserialize_with = "lenient_count")]
    pub requests_today: u64,
    #[serde(rename = "lastRpdReset", deserialize_with = "lenient_millis")]
    pub last_request_day_window_start: i64,
    #[serde(rename = "ttotal", deserialize_with = "lenient_count")]
    pub total_tokens_ever: u64,
    #[serde(rename = "rtotal", deserialize_with = "lenient_count")]
    pub total_requests_ever: u64,
}

/// Provider budget for a single key. Tune per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaLimits {
    pub tokens_per_minute: u64,
    pub requests_per_minute: u64,
    pub requests_per_day: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            tokens_per_minute: DEFAULT_TOKENS_PER_MINUTE,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            requests_per_day: DEFAULT_REQUESTS_PER_DAY,
        }
    }
}

/// Counter values that still count toward the budget at a given instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveUsage {
    pub tokens_per_minute: u64,
    pub requests_per_minute: u64,
    pub requests_per_day: u64,
}

/// Returns `count` while its window is still open, zero once it has elapsed.
pub fn windowed(count: u64, window_start: i64, now: i64, window_ms: i64) -> u64 {
    if now.saturating_sub(window_start) < window_ms {
        count
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyLimiter {
    limits: QuotaLimits,
}

impl KeyLimiter {
    pub fn new(limits: QuotaLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    pub fn effective_usage(&self, record: &QuotaRecord, now: i64) -> EffectiveUsage {
        EffectiveUsage {
            tokens_per_minute: windowed(
                record.tokens_this_minute,
                record.last_token_window_start,
                now,
                MINUTE_WINDOW_MS,
            ),
            requests_per_minute: windowed(
                record.requests_this_minute,
                record.last_request_minute_window_start,
                now,
                MINUTE_WINDOW_MS,
            ),
            requests_per_day: windowed(
                record.requests_today,
                record.last_request_day_window_start,
                now,
                DAY_WINDOW_MS,
            ),
        }
    }

    pub fn is_within_budget(&self, record: &QuotaRecord, now: i64) -> bool {
        let usage = self.effective_usage(record, now);
        usage.tokens_per_minute < self.limits.tokens_per_minute
            && usage.requests_per_minute < self.limits.requests_per_minute
            && usage.requests_per_day < self.limits.requests_per_day
    }
}

fn lenient_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().map(count_from_value).unwrap_or(0))
}

fn lenient_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let count = lenient_count(deserializer)?;
    Ok(i64::try_from(count).unwrap_or(i64::MAX))
}

fn count_from_value(value: &Value) -> u64 {
    let float = match value {
        Value::Number(number) => {
            if let Some(exact) = number.as_u64() {
                return exact;
            }
            number.as_f64()
        }
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    };
    float
        .filter(|f| f.is_finite() && *f > 0.0)
        .map(|f| f as u64)
        .unwrap_or(0)
}
