use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::ExamAiError;

/// Slot that remembers the last key that produced a usable answer.
pub const LAST_KEY_SLOT: &str = "ia_key";

/// Small local key-value store (string in, string out).
#[async_trait]
pub trait KeyCache: Send + Sync {
    async fn get(&self, slot: &str) -> Result<Option<String>, ExamAiError>;
    async fn set(&self, slot: &str, value: &str) -> Result<(), ExamAiError>;
}

#[derive(Debug, Clone)]
pub struct SqliteKeyCache {
    pool: SqlitePool,
}

impl SqliteKeyCache {
    pub async fn new(pool: SqlitePool) -> Result<Self, ExamAiError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS local_cache (
                slot TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl KeyCache for SqliteKeyCache {
    async fn get(&self, slot: &str) -> Result<Option<String>, ExamAiError> {
        let value =
            sqlx::query_scalar::<_, String>("SELECT value FROM local_cache WHERE slot = ? LIMIT 1")
                .bind(slot)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn set(&self, slot: &str, value: &str) -> Result<(), ExamAiError> {
        sqlx::query(
            r#"
            INSERT INTO local_cache (slot, value)
            VALUES (?, ?)
            ON CONFLICT(slot) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(slot)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyCache {
    slots: RwLock<HashMap<String, String>>,
}

impl MemoryKeyCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyCache for MemoryKeyCache {
    async fn get(&self, slot: &str) -> Result<Option<String>, ExamAiError> {
        Ok(self.slots.read().await.get(slot).cloned())
    }

    async fn set(&self, slot: &str, value: &str) -> Result<(), ExamAiError> {
        self.slots
            .write()
            .await
            .insert(slot.to_owned(), value.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::open_pool;

    #[tokio::test]
    async fn sqlite_cache_overwrites_slot() {
        let cache = SqliteKeyCache::new(open_pool(":memory:").await.unwrap())
            .await
            .unwrap();

        assert_eq!(cache.get(LAST_KEY_SLOT).await.unwrap(), None);
        cache.set(LAST_KEY_SLOT, "key-a").await.unwrap();
        cache.set(LAST_KEY_SLOT, "key-b").await.unwrap();
        assert_eq!(
            cache.get(LAST_KEY_SLOT).await.unwrap().as_deref(),
            Some("key-b")
        );
    }

    #[tokio::test]
    async fn memory_cache_keeps_slots_apart() {
        let cache = MemoryKeyCache::new();
        cache.set("one", "1").await.unwrap();
        cache.set("two", "2").await.unwrap();
        assert_eq!(cache.get("one").await.unwrap().as_deref(), Some("1"));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }
}
