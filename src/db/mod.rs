use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, info};

use crate::{config::DatabaseConfig, model::GenerationRecord};

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("pool error: {0}")]
    Pool(String),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("query error: {0}")]
    Query(String),
}

/// Append-only log of generations, backed by a SQLite pool.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Open the pool. A missing database file is created.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let pool = if config.is_in_memory() {
            // Every in-memory connection is its own database, so keep exactly one
            // alive for the lifetime of the pool.
            let opts = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DatabaseError::Pool(e.to_string()))?;
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(opts)
                .await
        } else {
            let opts = SqliteConnectOptions::new()
                .filename(&config.path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(config.pool_size)
                .connect_with(opts)
                .await
        }
        .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        info!(path = %config.path, pool_size = config.pool_size, "database pool ready");
        Ok(Self { pool })
    }

    /// Create the `requests` table if it does not exist yet.
    pub async fn initialize(&self) -> Result<(), DatabaseError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prompt TEXT NOT NULL,
                generated_text TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        Ok(())
    }

    pub async fn insert(
        &self,
        prompt: &str,
        generated_text: &str,
    ) -> Result<GenerationRecord, DatabaseError> {
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);

        let result = sqlx::query(
            "INSERT INTO requests (prompt, generated_text, created_at) VALUES (?, ?, ?)",
        )
        .bind(prompt)
        .bind(generated_text)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let id = result.last_insert_rowid();
        debug!(id, "generation record stored");

        Ok(GenerationRecord {
            id,
            prompt: prompt.to_string(),
            generated_text: generated_text.to_string(),
            created_at,
        })
    }

    /// Every record, oldest first.
    pub async fn list_all(&self) -> Result<Vec<GenerationRecord>, DatabaseError> {
        sqlx::query_as::<_, GenerationRecord>(
            "SELECT id, prompt, generated_text, created_at FROM requests ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::Query(e.to_string()))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    async fn memory_store() -> HistoryStore {
        let store = HistoryStore::connect(&DatabaseConfig::in_memory())
            .await
            .expect("connect");
        store.initialize().await.expect("initialize");
        store
    }

    #[tokio::test]
    async fn empty_store_lists_nothing() {
        let store = memory_store().await;
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let store = memory_store().await;
        store.insert("kept", "across init").await.unwrap();
        store.initialize().await.unwrap();
        store.initialize().await.unwrap();
        assert_eq!(store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lists_in_insertion_order() {
        let store = memory_store().await;
        let first = store.insert("one", "1").await.unwrap();
        let second = store.insert("two", "2").await.unwrap();
        let third = store.insert("three", "3").await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all, vec![first, second, third]);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn identical_inserts_are_distinct_records() {
        let store = memory_store().await;
        let a = store.insert("same", "same").await.unwrap();
        let b = store.insert("same", "same").await.unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.list_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn created_at_is_rfc3339() {
        let store = memory_store().await;
        let record = store.insert("p", "g").await.unwrap();
        assert!(DateTime::parse_from_rfc3339(&record.created_at).is_ok());
    }

    #[tokio::test]
    async fn empty_prompt_is_accepted_at_this_layer() {
        let store = memory_store().await;
        let record = store.insert("", "").await.unwrap();
        assert_eq!(record.prompt, "");
    }

    #[tokio::test]
    async fn insert_without_table_fails() {
        let store = HistoryStore::connect(&DatabaseConfig::in_memory())
            .await
            .unwrap();
        let err = store.insert("p", "g").await.unwrap_err();
        assert!(matches!(err, DatabaseError::Query(_)));
    }

    #[tokio::test]
    async fn file_database_is_created_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.db");
        let config = DatabaseConfig {
            path: path.to_string_lossy().to_string(),
            pool_size: 2,
        };

        let store = HistoryStore::connect(&config).await.unwrap();
        store.initialize().await.unwrap();
        store.insert("persisted", "to disk").await.unwrap();
        store.close().await;
        assert!(path.exists());

        let reopened = HistoryStore::connect(&config).await.unwrap();
        reopened.initialize().await.unwrap();
        let all = reopened.list_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].prompt, "persisted");
        assert_eq!(all[0].generated_text, "to disk");
    }
}
