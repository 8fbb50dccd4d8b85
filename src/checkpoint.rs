// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable resume metadata.
//!
//! Stores the [`CommitMetadata`] of the last commit of each generation in
//! SQLite. On restart the initial sync manager and the steady-state manager
//! read it back to decide between a fresh start and a resume.
//!
//! # Monotonic Guard
//!
//! A commit whose operation time is older than the stored one is refused
//! (logged and counted, not an error). Late completions of superseded work
//! can therefore never move a generation's resume point backwards.
//!
//! ```text
//! commit(t=10) → stored t=10
//! commit(t=12) → stored t=12
//! commit(t=11) → refused, stored t=12
//! ```
//!
//! # SQLite Busy Handling
//!
//! Writes retry SQLITE_BUSY/SQLITE_LOCKED with exponential backoff
//! ([`RetryConfig::checkpoint`]).

use crate::config::CheckpointConfig;
use crate::error::{Result, SyncError};
use crate::interfaces::{BoxFuture, IndexCommitter};
use crate::model::{CommitMetadata, GenerationId};
use crate::resilience::RetryConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation: &'static str,
    retry: &RetryConfig,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < retry.max_attempts => {
                let delay = retry.delay_for_attempt(attempts);
                warn!(
                    operation,
                    attempts,
                    max_attempts = retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_retries_total(operation);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// SQLite-backed store of the last committed resume metadata per generation.
pub struct CheckpointStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<GenerationId, CommitMetadata>>,
    retry: RetryConfig,
}

impl CheckpointStore {
    /// Open (or create) the store described by `config`.
    pub async fn open(config: &CheckpointConfig) -> Result<Self> {
        let in_memory = config.sqlite_path == ":memory:";
        info!(path = %config.sqlite_path, "Opening checkpoint store");

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", config.sqlite_path)
        };
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| SyncError::transient(format!("invalid SQLite path: {e}")))?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        if config.wal_mode && !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // A second connection to `:memory:` would see a different database.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 2 })
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                index_id TEXT NOT NULL,
                generation INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (index_id, generation)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64, String)> =
            sqlx::query_as("SELECT index_id, generation, metadata FROM checkpoints")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (index_id, generation, metadata) in rows {
            match serde_json::from_str::<CommitMetadata>(&metadata) {
                Ok(meta) => {
                    cache.insert(GenerationId::new(index_id, generation as u64), meta);
                }
                Err(e) => {
                    warn!(index_id = %index_id, generation, error = %e, "Ignoring unreadable checkpoint");
                }
            }
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            retry: RetryConfig::checkpoint(),
        })
    }

    /// Persist `metadata` as the generation's resume point.
    ///
    /// Returns `Ok(false)` when the monotonic guard refused the write.
    pub async fn commit_metadata(
        &self,
        generation: &GenerationId,
        metadata: CommitMetadata,
    ) -> Result<bool> {
        let mut cache = self.cache.write().await;

        if let Some(existing) = cache.get(generation) {
            if let (Some(old), Some(new)) = (existing.operation_time(), metadata.operation_time()) {
                if new < old {
                    warn!(
                        generation = %generation,
                        stored = %old,
                        attempted = %new,
                        "Refusing to move checkpoint backwards"
                    );
                    crate::metrics::record_checkpoint_rejected(&generation.index_id);
                    return Ok(false);
                }
            }
        }

        let json = serde_json::to_string(&metadata)
            .map_err(|e| SyncError::transient(format!("encode checkpoint: {e}")))?;
        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        let index_id = generation.index_id.clone();
        let gen = generation.generation as i64;

        let result = execute_with_retry("commit", &self.retry, || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (index_id, generation, metadata, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(index_id, generation) DO UPDATE SET
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&index_id)
            .bind(gen)
            .bind(&json)
            .bind(now)
            .execute(pool)
            .await
        })
        .await;

        crate::metrics::record_checkpoint_commit(&generation.index_id, result.is_ok());
        result?;

        debug!(generation = %generation, op_time = ?metadata.operation_time(), "Checkpoint committed");
        cache.insert(generation.clone(), metadata);
        Ok(true)
    }

    /// Last committed metadata for the generation.
    pub async fn get(&self, generation: &GenerationId) -> Option<CommitMetadata> {
        self.cache.read().await.get(generation).cloned()
    }

    /// Forget a retired generation.
    pub async fn delete(&self, generation: &GenerationId) -> Result<()> {
        self.cache.write().await.remove(generation);

        let pool = &self.pool;
        let index_id = generation.index_id.clone();
        let gen = generation.generation as i64;
        execute_with_retry("delete", &self.retry, || async {
            sqlx::query("DELETE FROM checkpoints WHERE index_id = ? AND generation = ?")
                .bind(&index_id)
                .bind(gen)
                .execute(pool)
                .await
        })
        .await?;

        info!(generation = %generation, "Deleted checkpoint");
        Ok(())
    }

    /// Close the connection pool, checkpointing the WAL first.
    pub async fn close(&self) {
        let pool = &self.pool;
        if let Err(e) = execute_with_retry("wal_checkpoint", &self.retry, || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await
        {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

impl IndexCommitter for CheckpointStore {
    fn commit<'a>(
        &'a self,
        generation: &'a GenerationId,
        metadata: CommitMetadata,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.commit_metadata(generation, metadata).await?;
            Ok(())
        })
    }

    fn load<'a>(&'a self, generation: &'a GenerationId) -> BoxFuture<'a, Option<CommitMetadata>> {
        Box::pin(async move { Ok(self.get(generation).await) })
    }

    fn retire<'a>(&'a self, generation: &'a GenerationId) -> BoxFuture<'a, ()> {
        Box::pin(self.delete(generation))
    }
}
