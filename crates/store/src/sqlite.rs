//! SQLite state store.
//!
//! One table, `threads`, keyed by thread id. The state is stored as a JSON
//! document and replaced wholesale on every save.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use routeqa_core::error::StoreError;
use routeqa_core::{ConversationState, StateStore, ThreadId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tracing::info;

/// Thread persistence in a single SQLite file.
pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Open (or create) the database at `path`.
    ///
    /// Pass `":memory:"` for an ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        // A single connection keeps `:memory:` databases coherent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite state store initialized at {path}");
        Ok(store)
    }

    /// Wrap an existing pool, creating the schema if needed.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                id          TEXT PRIMARY KEY NOT NULL,
                state       TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("threads table: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn load(&self, thread: &ThreadId) -> Result<Option<ConversationState>, StoreError> {
        let row = sqlx::query("SELECT state FROM threads WHERE id = ?")
            .bind(thread.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("load thread: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let json: String = row
            .try_get("state")
            .map_err(|e| StoreError::QueryFailed(format!("state column: {e}")))?;
        let state = serde_json::from_str(&json)
            .map_err(|e| StoreError::Storage(format!("Corrupted state for thread {thread}: {e}")))?;
        Ok(Some(state))
    }

    async fn save(&self, thread: &ThreadId, state: &ConversationState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize thread: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO threads (id, state, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(thread.as_str())
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("save thread: {e}")))?;
        Ok(())
    }

    async fn delete(&self, thread: &ThreadId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM threads WHERE id = ?")
            .bind(thread.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("delete thread: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_threads(&self) -> Result<Vec<ThreadId>, StoreError> {
        let rows = sqlx::query("SELECT id FROM threads ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("list threads: {e}")))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("id")
                    .map(ThreadId::from)
                    .map_err(|e| StoreError::QueryFailed(format!("id column: {e}")))
            })
            .collect()
    }
}
