// Database connection and pool management
// SQLite via sqlx; the schema is created idempotently by migrate()

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::{debug, info};

#[derive(Clone)]
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = is_memory_url(database_url);

        if !in_memory {
            let db_path = database_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:");
            let db_path = db_path.split('?').next().unwrap_or(db_path);
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
                }
            }
        }

        let mut options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));

        let pool_options = if in_memory {
            // every pooled connection to :memory: would be a separate database
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
            SqlitePoolOptions::new().max_connections(10)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to {database_url}"))?;

        debug!("Connected to {} (in_memory={})", database_url, in_memory);
        Ok(Self { pool })
    }

    /// Connect and create the schema in one step
    pub async fn open(database_url: &str) -> Result<Self> {
        let db = Self::new(database_url).await?;
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Liveness check run before a sync starts
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Store is unreachable")?;
        Ok(())
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_entities_sql = r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                cadence_class TEXT NOT NULL,
                hierarchy_path TEXT,
                last_observed_date TEXT,
                last_sync_at TEXT,
                last_attempt_at TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                metadata TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
        "#;

        let create_data_points_sql = r#"
            CREATE TABLE IF NOT EXISTS data_points (
                entity_id TEXT NOT NULL,
                observation_date TEXT NOT NULL,
                value REAL,
                revision TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (entity_id, observation_date),
                FOREIGN KEY (entity_id) REFERENCES entities (id) ON DELETE CASCADE
            )
        "#;

        let create_attempts_sql = r#"
            CREATE TABLE IF NOT EXISTS sync_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT,
                entity_id TEXT NOT NULL,
                attempted_at TEXT NOT NULL,
                outcome TEXT NOT NULL,
                detail TEXT NOT NULL,
                payload_hash TEXT
            )
        "#;

        let create_runs_sql = r#"
            CREATE TABLE IF NOT EXISTS sync_runs (
                run_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                final_state TEXT NOT NULL,
                summary TEXT NOT NULL
            )
        "#;

        let create_indexes_sql = [
            "CREATE INDEX IF NOT EXISTS idx_entities_status ON entities (status)",
            "CREATE INDEX IF NOT EXISTS idx_entities_cadence ON entities (cadence_class)",
            "CREATE INDEX IF NOT EXISTS idx_attempts_entity ON sync_attempts (entity_id, attempted_at)",
            "CREATE INDEX IF NOT EXISTS idx_attempts_time ON sync_attempts (attempted_at)",
            "CREATE INDEX IF NOT EXISTS idx_runs_started ON sync_runs (started_at)",
        ];

        sqlx::query(create_entities_sql).execute(&self.pool).await?;
        sqlx::query(create_data_points_sql).execute(&self.pool).await?;
        sqlx::query(create_attempts_sql).execute(&self.pool).await?;
        sqlx::query(create_runs_sql).execute(&self.pool).await?;
        for sql in create_indexes_sql {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        info!("🗄️ Database schema ready");
        Ok(())
    }
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_database_connection() -> Result<()> {
        // temp dir for the database file
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("nested").join("sync.db");
        let database_url = format!("sqlite:{}", db_path.to_string_lossy());

        let db = DatabaseConnection::new(&database_url).await?;

        assert!(!db.pool().is_closed());
        assert!(db_path.exists());
        db.ping().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_database_migration_is_idempotent() -> Result<()> {
        let db = DatabaseConnection::new("sqlite::memory:").await?;
        db.migrate().await?;
        db.migrate().await?;

        for table in ["entities", "data_points", "sync_attempts", "sync_runs"] {
            let result = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name=?")
                .bind(table)
                .fetch_optional(db.pool())
                .await?;
            assert!(result.is_some(), "missing table {table}");
        }
        Ok(())
    }
}
