//! Lock repository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::database::models::LockDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::domain::{Lock, LockKey};
use crate::{Error, Result};

/// Persisted named mutex between jobs.
#[async_trait]
pub trait LockRepository: Send + Sync {
    /// Create the lock `name` for `job_id`. Returns `false` if it already exists.
    async fn acquire(&self, name: &str, job_id: &str) -> Result<bool>;
    /// Delete the lock identified by `key`, returning it.
    async fn release(&self, key: &LockKey) -> Result<Lock>;
    async fn get(&self, key: &LockKey) -> Result<Option<Lock>>;
    /// Set the abort flag. Idempotent.
    async fn request_abort(&self, key: &LockKey) -> Result<()>;
    /// Delete every lock, returning how many were removed.
    async fn clear_all(&self) -> Result<u64>;
    async fn list(&self) -> Result<Vec<Lock>>;
}

/// SQLx implementation of LockRepository.
pub struct SqlxLockRepository {
    pool: SqlitePool,
}

impl SqlxLockRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn key_column(key: &LockKey) -> (&'static str, &str) {
    match key {
        LockKey::Name(name) => ("name", name.as_str()),
        LockKey::JobId(job_id) => ("job_id", job_id.as_str()),
    }
}

#[async_trait]
impl LockRepository for SqlxLockRepository {
    async fn acquire(&self, name: &str, job_id: &str) -> Result<bool> {
        let created_at = now_ms();
        let inserted = retry_on_sqlite_busy("acquire_lock", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO job_lock (name, job_id, created_at, abort_requested)
                VALUES (?, ?, ?, 0)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(name)
            .bind(job_id)
            .bind(created_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await?;

        if inserted {
            debug!(lock = name, job_id, "Lock acquired");
        } else {
            debug!(lock = name, job_id, "Lock already held");
        }
        Ok(inserted)
    }

    async fn release(&self, key: &LockKey) -> Result<Lock> {
        let (column, value) = key_column(key);
        let sql = format!("DELETE FROM job_lock WHERE {column} = ? RETURNING *");
        let released = retry_on_sqlite_busy("release_lock", || async {
            let row = sqlx::query_as::<_, LockDbModel>(&sql)
                .bind(value)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        })
        .await?
        .ok_or_else(|| Error::LockNotFound(key.to_string()))?;

        debug!(lock = %released.name, job_id = %released.job_id, "Lock released");
        Ok(released.into())
    }

    async fn get(&self, key: &LockKey) -> Result<Option<Lock>> {
        let (column, value) = key_column(key);
        let sql = format!("SELECT * FROM job_lock WHERE {column} = ?");
        let row = sqlx::query_as::<_, LockDbModel>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Lock::from))
    }

    async fn request_abort(&self, key: &LockKey) -> Result<()> {
        let (column, value) = key_column(key);
        let sql = format!("UPDATE job_lock SET abort_requested = 1 WHERE {column} = ?");
        let updated = retry_on_sqlite_busy("request_abort", || async {
            let result = sqlx::query(&sql)
                .bind(value)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(Error::LockNotFound(key.to_string()));
        }
        info!(%key, "Abort requested");
        Ok(())
    }

    async fn clear_all(&self) -> Result<u64> {
        let removed = retry_on_sqlite_busy("clear_locks", || async {
            let result = sqlx::query("DELETE FROM job_lock")
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        })
        .await?;
        info!(removed, "Cleared all job locks");
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<Lock>> {
        let rows = sqlx::query_as::<_, LockDbModel>("SELECT * FROM job_lock ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Lock::from).collect())
    }
}
