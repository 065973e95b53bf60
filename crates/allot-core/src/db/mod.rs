//! Database module - SQLx with SQLite

use crate::error::{Error, Result};
use crate::services::limits::SqliteDocumentStore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable overriding the database location
pub const DB_PATH_ENV: &str = "ALLOT_DB_PATH";

/// Database state
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Create a new database connection with default path
    pub async fn new() -> Result<Self> {
        let db_path = get_db_path()?;
        Self::open(db_path).await
    }

    /// Create a new database connection with a specific path
    pub async fn open(db_path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        log::info!("Connecting to database: {}", db_path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        log::debug!("Running database migrations...");

        self.document_store().ensure_schema().await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_usage_limits_updated_at ON usage_limits(updated_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Document store over this connection pool
    pub fn document_store(&self) -> SqliteDocumentStore {
        SqliteDocumentStore::new(self.pool.clone())
    }
}

/// Get the database file path
pub fn get_db_path() -> Result<PathBuf> {
    // Check for environment variable override
    if let Ok(path) = std::env::var(DB_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }

    // Default: use app data directory
    let dirs = directories::ProjectDirs::from("com", "allot", "Allot")
        .ok_or_else(|| Error::config("Could not determine project directories"))?;

    Ok(dirs.data_dir().join("allot.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::limits::DocumentStore;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_get_db_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        // Without env var, should return default path
        std::env::remove_var(DB_PATH_ENV);
        let path = get_db_path().unwrap();
        assert!(path.to_string_lossy().contains("allot.db"));
    }

    #[test]
    fn test_get_db_path_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let test_path = "/tmp/test_allot.db";
        std::env::set_var(DB_PATH_ENV, test_path);
        let path = get_db_path().unwrap();
        assert_eq!(path.to_string_lossy(), test_path);
        std::env::remove_var(DB_PATH_ENV);
    }

    #[tokio::test]
    async fn test_open_creates_schema() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("nested").join("allot.db")).await.unwrap();
        let store = db.document_store();
        assert!(store.list().await.unwrap().is_empty());
    }
}
