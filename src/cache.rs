//! SQLite-backed metadata cache for acquired assets.
//!
//! The cache stores one row per content id describing where the asset
//! lives and what it is. Asset bytes live in storage, never here. Rows
//! have no expiry: provider URLs rot quickly, but a committed asset in our
//! own storage stays valid until something deletes it, so staleness is an
//! operator decision rather than a timer.

use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info, instrument};

use crate::error::AcquireError;

/// Busy timeout for concurrent SQLite access (5 seconds).
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// One cached asset record.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct CacheEntry {
    /// Canonical content id (the video id).
    pub content_id: String,
    /// Content title as the winning provider reported it.
    pub title: String,
    /// Duration in seconds; 0 when the provider did not report it.
    pub duration_seconds: i64,
    /// Where the asset is served from: a storage location after rehosting,
    /// or the provider URL when rehosting is disabled.
    pub stored_location: String,
    /// Stored size in bytes; 0 when only metadata was cached.
    pub byte_size: i64,
    /// Name of the provider that won the acquisition.
    pub provider_name: String,
    /// Unix timestamp of when the row was written.
    pub created_at: i64,
}

/// The current Unix timestamp in seconds.
#[must_use]
pub fn unix_timestamp_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Metadata cache over a SQLite pool.
#[derive(Debug, Clone)]
pub struct ContentCache {
    pool: SqlitePool,
}

impl ContentCache {
    /// Opens (creating if needed) a cache database at `path` and runs
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::CacheFailure`] when the database cannot be
    /// opened or migrated.
    pub async fn new(path: &Path) -> Result<Self, AcquireError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| AcquireError::cache(format!("opening database: {e}")))?;

        Self::migrate(pool).await
    }

    /// Opens an isolated in-memory cache, used by tests and ephemeral
    /// deployments.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::CacheFailure`] when setup fails.
    pub async fn new_in_memory() -> Result<Self, AcquireError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| AcquireError::cache(format!("in-memory options: {e}")))?;

        // One connection only: each in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| AcquireError::cache(format!("opening in-memory database: {e}")))?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self, AcquireError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| AcquireError::cache(format!("running migrations: {e}")))?;
        info!("content cache ready");
        Ok(Self { pool })
    }

    /// Looks up the cached record for `content_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::CacheFailure`] on query failure.
    #[instrument(skip(self))]
    pub async fn get(&self, content_id: &str) -> Result<Option<CacheEntry>, AcquireError> {
        let entry = sqlx::query_as::<_, CacheEntry>(
            r"
            SELECT content_id, title, duration_seconds, stored_location,
                   byte_size, provider_name, created_at
            FROM asset_cache
            WHERE content_id = ?
            ",
        )
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AcquireError::cache(format!("cache lookup: {e}")))?;

        debug!(hit = entry.is_some(), "cache consulted");
        Ok(entry)
    }

    /// Writes (or overwrites) the record for an acquired asset.
    ///
    /// Called only after the asset is durably committed, so a row's
    /// existence always implies a fetchable asset.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::CacheFailure`] on write failure.
    #[instrument(skip(self, entry), fields(content_id = %entry.content_id))]
    pub async fn put(&self, entry: &CacheEntry) -> Result<(), AcquireError> {
        sqlx::query(
            r"
            INSERT OR REPLACE INTO asset_cache
                (content_id, title, duration_seconds, stored_location,
                 byte_size, provider_name, source, cached, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            ",
        )
        .bind(&entry.content_id)
        .bind(&entry.title)
        .bind(entry.duration_seconds)
        .bind(&entry.stored_location)
        .bind(entry.byte_size)
        .bind(&entry.provider_name)
        .bind(&entry.provider_name)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AcquireError::cache(format!("cache write: {e}")))?;

        debug!("cache entry written");
        Ok(())
    }

    /// Removes the record for `content_id`, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::CacheFailure`] on delete failure.
    #[instrument(skip(self))]
    pub async fn evict(&self, content_id: &str) -> Result<bool, AcquireError> {
        let result = sqlx::query("DELETE FROM asset_cache WHERE content_id = ?")
            .bind(content_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AcquireError::cache(format!("cache eviction: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}
