//! Transactional persistence
//!
//! Every mutation in the engine goes through [`run_transaction`]: read the
//! user's aggregate document, run a pure closure over it, then commit with a
//! compare-and-swap. A lost race surfaces as [`Error::Conflict`] from the
//! adapter and the whole closure is re-run against fresh state.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::config::Clock;
use super::document::LimitsDocument;
use crate::error::{Error, Result};

/// First retry waits up to this long; each further retry doubles it
const BACKOFF_BASE_MS: u64 = 10;
/// Upper bound on a single retry delay
const BACKOFF_MAX_MS: u64 = 250;

// ============================================================================
// Adapter Traits
// ============================================================================

/// Document store with optimistic transactions, one document per user
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Non-transactional read; never feed the result into a mutation
    async fn get(&self, user_id: &str) -> Result<Option<LimitsDocument>>;

    /// Snapshot the document for a read-modify-write cycle
    async fn begin(&self, user_id: &str) -> Result<Box<dyn DocumentTransaction>>;

    /// All user documents
    async fn list(&self) -> Result<Vec<LimitsDocument>>;

    /// Delete a user's document. Returns `true` if one existed.
    async fn delete(&self, user_id: &str) -> Result<bool>;
}

/// Transaction-scoped handle returned by [`DocumentStore::begin`]
#[async_trait]
pub trait DocumentTransaction: Send {
    /// Document as read when the transaction began
    fn document(&self) -> Option<&LimitsDocument>;

    /// Stage the replacement document
    fn set(&mut self, doc: LimitsDocument);

    /// Apply the staged write, failing with [`Error::Conflict`] if the
    /// document changed since `begin`. Committing with nothing staged is a
    /// no-op.
    async fn commit(self: Box<Self>) -> Result<()>;
}

// ============================================================================
// Transaction Runner
// ============================================================================

/// What a transaction closure decided
#[derive(Debug)]
pub enum Commit<T> {
    /// Persist the (mutated) document and return the value
    Write(T),
    /// Leave storage untouched and return the value
    Skip(T),
}

/// Run `f` as an atomic read-modify-write on the user's document.
///
/// `f` receives the current document (a fresh one if the user has none) and
/// may mutate it. An `Err` from `f` aborts without writing. Conflicts re-run
/// `f` against fresh state up to `max_attempts` times.
pub async fn run_transaction<T, F>(
    store: &dyn DocumentStore,
    clock: &dyn Clock,
    user_id: &str,
    max_attempts: u32,
    mut f: F,
) -> Result<T>
where
    F: FnMut(&mut LimitsDocument) -> Result<Commit<T>>,
{
    let attempts = max_attempts.max(1);

    for attempt in 1..=attempts {
        let mut tx = store.begin(user_id).await?;
        let now = clock.now();
        let mut doc = tx
            .document()
            .cloned()
            .unwrap_or_else(|| LimitsDocument::new(user_id, now));

        let value = match f(&mut doc)? {
            Commit::Skip(value) => return Ok(value),
            Commit::Write(value) => value,
        };

        doc.updated_at = now;
        tx.set(doc);
        match tx.commit().await {
            Ok(()) => return Ok(value),
            Err(Error::Conflict(_)) => {
                log::debug!(
                    "[limits:store] Write conflict for user {} (attempt {}/{})",
                    user_id,
                    attempt,
                    attempts
                );
                if attempt < attempts {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    log::warn!(
        "[limits:store] Transaction for user {} aborted after {} conflicting attempts",
        user_id,
        attempts
    );
    Err(Error::persistence(format!(
        "transaction on {} aborted after {} conflicting attempts",
        user_id, attempts
    )))
}

/// Jittered exponential delay before retry number `attempt` (1-based)
fn backoff_delay(attempt: u32) -> Duration {
    let ceiling = BACKOFF_BASE_MS
        .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
        .min(BACKOFF_MAX_MS);
    Duration::from_millis(rand::thread_rng().gen_range(ceiling / 2..=ceiling))
}

// ============================================================================
// SQLite Adapter
// ============================================================================

/// Database row for one aggregate document
#[derive(Debug, Clone, FromRow)]
struct StoredDocument {
    data: String,
    version: i64,
}

impl StoredDocument {
    fn decode(&self) -> Result<LimitsDocument> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

/// SQLite-backed document store
///
/// Documents live as JSON in `usage_limits`; every commit bumps `version`
/// and only succeeds if the version read at `begin` is still current.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    /// Wrap an existing pool; the schema must already exist
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database at `url` and ensure the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the `usage_limits` table if it is missing
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_limits (
                user_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch(&self, user_id: &str) -> Result<Option<StoredDocument>> {
        let row = sqlx::query_as::<_, StoredDocument>(
            "SELECT data, version FROM usage_limits WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn get(&self, user_id: &str) -> Result<Option<LimitsDocument>> {
        self.fetch(user_id).await?.map(|row| row.decode()).transpose()
    }

    async fn begin(&self, user_id: &str) -> Result<Box<dyn DocumentTransaction>> {
        let (document, version) = match self.fetch(user_id).await? {
            Some(row) => (Some(row.decode()?), Some(row.version)),
            None => (None, None),
        };

        Ok(Box::new(SqliteTransaction {
            pool: self.pool.clone(),
            user_id: user_id.to_string(),
            document,
            version,
            staged: None,
        }))
    }

    async fn list(&self) -> Result<Vec<LimitsDocument>> {
        let rows = sqlx::query_as::<_, StoredDocument>(
            "SELECT data, version FROM usage_limits ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await?;

        log::debug!("[limits:store] Listed {} documents", rows.len());
        rows.iter().map(StoredDocument::decode).collect()
    }

    async fn delete(&self, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM usage_limits WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

struct SqliteTransaction {
    pool: SqlitePool,
    user_id: String,
    document: Option<LimitsDocument>,
    /// Version read at `begin`; `None` if the row did not exist
    version: Option<i64>,
    staged: Option<LimitsDocument>,
}

#[async_trait]
impl DocumentTransaction for SqliteTransaction {
    fn document(&self) -> Option<&LimitsDocument> {
        self.document.as_ref()
    }

    fn set(&mut self, doc: LimitsDocument) {
        self.staged = Some(doc);
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let SqliteTransaction {
            pool,
            user_id,
            version,
            staged,
            ..
        } = *self;
        let Some(doc) = staged else {
            return Ok(());
        };
        let data = serde_json::to_string(&doc)?;
        let updated_at = Utc::now().to_rfc3339();

        let result = match version {
            Some(version) => {
                sqlx::query(
                    r#"
                    UPDATE usage_limits
                    SET data = ?, version = version + 1, updated_at = ?
                    WHERE user_id = ? AND version = ?
                    "#,
                )
                .bind(&data)
                .bind(&updated_at)
                .bind(&user_id)
                .bind(version)
                .execute(&pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO usage_limits (user_id, data, version, created_at, updated_at)
                    VALUES (?, ?, 1, ?, ?)
                    ON CONFLICT(user_id) DO NOTHING
                    "#,
                )
                .bind(&user_id)
                .bind(&data)
                .bind(doc.created_at.to_rfc3339())
                .bind(&updated_at)
                .execute(&pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(Error::Conflict(user_id));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
