use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use tracing::debug;

use crate::limits::QuotaRecord;
use crate::{ExamAiError, now_millis, preview_key};

/// 默认的配额文档（collection/id）。
pub const DEFAULT_QUOTA_DOCUMENT: &str = "config/ia-quota";

/// Every known key and its counters, as read from the quota document.
pub type QuotaSnapshot = BTreeMap<String, QuotaRecord>;

/// Wire shape of the shared quota document: `{ "iaToken": { "<key>": {...} } }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDocument {
    #[serde(rename = "iaToken", default)]
    pub ia_token: QuotaSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace this key's record; every other key stays untouched.
    Merge,
    /// Insert the record only when the key has none yet.
    CreateOnly,
}

/// 配额文档的读写边界，所有实例共享同一份状态。
///
/// `read` always returns the whole document. `write` touches a single key.
/// No compare-and-swap is offered: concurrent writers race with
/// last-writer-wins semantics.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn read(&self) -> Result<QuotaSnapshot, ExamAiError>;

    async fn write(
        &self,
        key: &str,
        record: &QuotaRecord,
        mode: WriteMode,
    ) -> Result<(), ExamAiError>;
}

/// Opens the SQLite pool shared by the quota store and the local key cache.
///
/// `":memory:"` yields a single-connection in-memory database.
pub async fn open_pool(database_path: &str) -> Result<SqlitePool, ExamAiError> {
    let pool = if database_path == ":memory:" {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true);
        SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect_with(options)
            .await?
    };
    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct SqliteQuotaStore {
    pool: SqlitePool,
    document: String,
}

impl SqliteQuotaStore {
    pub async fn new(pool: SqlitePool, document: &str) -> Result<Self, ExamAiError> {
        let store = Self {
            pool,
            document: document.to_owned(),
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    async fn initialize_schema(&self) -> Result<(), ExamAiError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ia_tokens (
                document TEXT NOT NULL,
                api_key TEXT NOT NULL,
                tpm INTEGER NOT NULL DEFAULT 0,
                last_tpm_reset INTEGER NOT NULL DEFAULT 0,
                rpm INTEGER NOT NULL DEFAULT 0,
                last_rpm_reset INTEGER NOT NULL DEFAULT 0,
                rpd INTEGER NOT NULL DEFAULT 0,
                last_rpd_reset INTEGER NOT NULL DEFAULT 0,
                ttotal INTEGER NOT NULL DEFAULT 0,
                rtotal INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (document, api_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for SqliteQuotaStore {
    async fn read(&self) -> Result<QuotaSnapshot, ExamAiError> {
        let rows = sqlx::query(
            r#"
            SELECT
                api_key,
                tpm,
                last_tpm_reset,
                rpm,
                last_rpm_reset,
                rpd,
                last_rpd_reset,
                ttotal,
                rtotal
            FROM ia_tokens
            WHERE document = ?
            "#,
        )
        .bind(&self.document)
        .fetch_all(&self.pool)
        .await?;

        let snapshot = rows
            .into_iter()
            .map(|row| -> Result<(String, QuotaRecord), sqlx::Error> {
                let key: String = row.try_get("api_key")?;
                Ok((key, record_from_row(&row)?))
            })
            .collect::<Result<QuotaSnapshot, _>>()?;

        Ok(snapshot)
    }

    async fn write(
        &self,
        key: &str,
        record: &QuotaRecord,
        mode: WriteMode,
    ) -> Result<(), ExamAiError> {
        let conflict = match mode {
            WriteMode::Merge => {
                r#"
                DO UPDATE SET
                    tpm = excluded.tpm,
                    last_tpm_reset = excluded.last_tpm_reset,
                    rpm = excluded.rpm,
                    last_rpm_reset = excluded.last_rpm_reset,
                    rpd = excluded.rpd,
                    last_rpd_reset = excluded.last_rpd_reset,
                    ttotal = excluded.ttotal,
                    rtotal = excluded.rtotal,
                    updated_at = excluded.updated_at
                "#
            }
            WriteMode::CreateOnly => "DO NOTHING",
        };
        let statement = format!(
            r#"
            INSERT INTO ia_tokens (
                document,
                api_key,
                tpm,
                last_tpm_reset,
                rpm,
                last_rpm_reset,
                rpd,
                last_rpd_reset,
                ttotal,
                rtotal,
                updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(document, api_key) {conflict}
            "#
        );

        let result = sqlx::query(&statement)
            .bind(&self.document)
            .bind(key)
            .bind(to_sql(record.tokens_this_minute))
            .bind(record.last_token_window_start)
            .bind(to_sql(record.requests_this_minute))
            .bind(record.last_request_minute_window_start)
            .bind(to_sql(record.requests_today))
            .bind(record.last_request_day_window_start)
            .bind(to_sql(record.total_tokens_ever))
            .bind(to_sql(record.total_requests_ever))
            .bind(now_millis())
            .execute(&self.pool)
            .await?;

        debug!(
            key = %preview_key(key),
            ?mode,
            rows = result.rows_affected(),
            "quota record written"
        );
        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<QuotaRecord, sqlx::Error> {
    Ok(QuotaRecord {
        tokens_this_minute: from_sql(row.try_get("tpm")?),
        last_token_window_start: row.try_get("last_tpm_reset")?,
        requests_this_minute: from_sql(row.try_get("rpm")?),
        last_request_minute_window_start: row.try_get("last_rpm_reset")?,
        requests_today: from_sql(row.try_get("rpd")?),
        last_request_day_window_start: row.try_get("last_rpd_reset")?,
        total_tokens_ever: from_sql(row.try_get("ttotal")?),
        total_requests_ever: from_sql(row.try_get("rtotal")?),
    })
}

fn to_sql(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_sql(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Process-local quota document, for tests and single-instance embedding.
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    records: RwLock<QuotaSnapshot>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: QuotaSnapshot) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn read(&self) -> Result<QuotaSnapshot, ExamAiError> {
        Ok(self.records.read().await.clone())
    }

    async fn write(
        &self,
        key: &str,
        record: &QuotaRecord,
        mode: WriteMode,
    ) -> Result<(), ExamAiError> {
        let mut guard = self.records.write().await;
        match mode {
            WriteMode::Merge => {
                guard.insert(key.to_owned(), *record);
            }
            WriteMode::CreateOnly => {
                guard.entry(key.to_owned()).or_insert(*record);
            }
        }
        Ok(())
    }
}
