//! SQLite persistence for jobs, locks and recurring schedules.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::{info, warn};

pub type DbPool = Pool<Sqlite>;

const MAX_DEFAULT_CONNECTIONS: u32 = 10;
const WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

/// Connection settings for the job database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// How long a writer waits on a locked database before SQLite gives up.
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_pool_size(),
            busy_timeout_ms: 30_000,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }
}

/// Twice the CPU count, capped at 10. Job writes are short, so a small pool suffices.
pub fn default_pool_size() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2)
        .saturating_mul(2)
        .min(MAX_DEFAULT_CONNECTIONS)
}

async fn configure_connection(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("PRAGMA wal_autocheckpoint = {WAL_AUTOCHECKPOINT_PAGES}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Open the pool: WAL journal, normal sync, foreign keys on, busy timeout set.
pub async fn connect(config: &DatabaseConfig) -> crate::Result<DbPool> {
    let options = SqliteConnectOptions::from_str(&config.url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| Box::pin(async move { configure_connection(conn).await }))
        .connect_with(options)
        .await?;

    let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(&pool).await?;
    if mode != "wal" && mode != "memory" {
        warn!(%mode, "Journal mode is not WAL, switching");
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    }

    info!(
        max_connections = config.max_connections,
        "Job database opened"
    );
    Ok(pool)
}

/// Open `database_url` with default settings.
pub async fn init_pool(database_url: &str) -> crate::Result<DbPool> {
    connect(&DatabaseConfig::new(database_url)).await
}

pub async fn run_migrations(pool: &DbPool) -> crate::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Job database schema is up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_pool_and_migrate() {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path().join("init.db").to_string_lossy().replace('\\', "/")
        );
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(result.0, "wal");

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"job"));
        assert!(names.contains(&"job_lock"));
        assert!(names.contains(&"job_schedule"));
    }

    #[test]
    fn test_pool_size_settings() {
        let size = default_pool_size();
        assert!((1..=MAX_DEFAULT_CONNECTIONS).contains(&size));

        let config = DatabaseConfig::new("sqlite::memory:").with_max_connections(0);
        assert_eq!(config.max_connections, 1);
    }
}
