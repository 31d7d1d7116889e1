//! On-disk blob cache with SQLite-backed metadata and LRU pruning.
//!
//! Blobs are stored as `{cache_dir}/{sha256}` with no extension; metadata
//! lives in `{cache_dir}/.cache-metadata.db`. Serving correctness depends
//! only on the files — every metadata failure is logged and absorbed, and a
//! missing or unreadable database is rebuilt from a directory scan.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

/// File name of the embedded metadata database inside the cache directory.
const METADATA_DB_FILE: &str = ".cache-metadata.db";

/// Pruning stops once usage drops to this fraction of the ceiling.
const PRUNE_TARGET_FRACTION: f64 = 0.9;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cache_metadata (
        sha256 TEXT PRIMARY KEY,
        last_accessed INTEGER,
        size INTEGER,
        uploaded INTEGER NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_cache_metadata_last_accessed
        ON cache_metadata (last_accessed)",
];

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// Owns the blob directory and the metadata database.
#[derive(Clone)]
pub struct CacheStore {
    cache_dir: PathBuf,
    max_bytes: Option<u64>,
    pool: SqlitePool,
}

/// An open handle to a cached blob file.
pub struct CachedBlob {
    pub file: tokio::fs::File,
    pub size: u64,
}

impl CacheStore {
    /// Create the cache directory, open the metadata database, and make the
    /// store ready to serve.
    ///
    /// A fresh database (or one whose schema cannot be read) is rebuilt from
    /// a scan of the blob directory.
    pub async fn open(cache_dir: &Path, max_bytes: Option<u64>) -> Result<Self> {
        tokio::fs::create_dir_all(cache_dir)
            .await
            .with_context(|| format!("failed to create cache dir: {}", cache_dir.display()))?;

        let db_path = cache_dir.join(METADATA_DB_FILE);
        let fresh = !db_path.exists();
        let mut recovered = false;

        let pool = match open_database(&db_path).await {
            Ok(pool) => pool,
            Err(e) => {
                // One recovery attempt: discard the unreadable database and
                // start over from the directory contents.
                warn!(error = %e, db = %db_path.display(), "metadata DB unreadable, recreating");
                remove_database_files(&db_path).await;
                recovered = true;
                open_database(&db_path).await.context("metadata DB recreation failed")?
            }
        };

        let store = Self {
            cache_dir: cache_dir.to_path_buf(),
            max_bytes,
            pool,
        };

        if fresh || recovered || !store.schema_readable().await {
            store.rebuild_from_directory().await?;
        }

        Ok(store)
    }

    /// Path of the blob file for a digest.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.cache_dir.join(digest)
    }

    /// Path of the in-progress download file for a digest. Dot-prefixed so
    /// rebuild scans never pick up partial content.
    pub fn part_path(&self, digest: &str) -> PathBuf {
        self.cache_dir.join(format!(".{digest}.part"))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Recreate the cache directory if something removed it at runtime.
    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.cache_dir)
            .await
            .with_context(|| format!("failed to create cache dir: {}", self.cache_dir.display()))
    }

    /// Whether the metadata table answers a trivial query.
    async fn schema_readable(&self) -> bool {
        sqlx::query("SELECT COUNT(*) FROM cache_metadata")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    // -- rebuild ------------------------------------------------------------

    /// Repopulate the metadata table from the blob directory.
    ///
    /// Dotfiles (including the database itself and partial downloads) are
    /// skipped. Each row gets `last_accessed` from the file mtime and
    /// `uploaded` from the same timestamp in seconds.
    pub async fn rebuild_from_directory(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.cache_dir)
            .await
            .with_context(|| format!("failed to scan cache dir: {}", self.cache_dir.display()))?;

        let mut tx = self.pool.begin().await.context("rebuild transaction")?;
        sqlx::query("DELETE FROM cache_metadata")
            .execute(&mut *tx)
            .await?;

        let mut count: u64 = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }

            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };

            let mtime_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or_else(now_ms);

            sqlx::query(
                "INSERT OR REPLACE INTO cache_metadata (sha256, last_accessed, size, uploaded)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(name)
            .bind(mtime_ms)
            .bind(meta.len() as i64)
            .bind(mtime_ms / 1000)
            .execute(&mut *tx)
            .await?;

            count += 1;
        }

        tx.commit().await.context("rebuild commit")?;
        info!(blobs = count, dir = %self.cache_dir.display(), "rebuilt cache metadata from directory");
        Ok(())
    }

    // -- lookup / touch -----------------------------------------------------

    /// Open the blob file for a digest if it is cached.
    ///
    /// Schedules a fire-and-forget [`touch`](Self::touch) so the entry's
    /// recency is refreshed without blocking the request.
    pub async fn lookup(&self, digest: &str) -> Option<CachedBlob> {
        let file = tokio::fs::File::open(self.blob_path(digest)).await.ok()?;
        let size = file.metadata().await.ok()?.len();

        let store = self.clone();
        let digest = digest.to_string();
        tokio::spawn(async move {
            store.touch(&digest, Some(size)).await;
        });

        Some(CachedBlob { file, size })
    }

    /// Refresh `last_accessed` for a digest, preserving `uploaded`.
    ///
    /// With no size supplied, the existing row's size is kept; when no row
    /// exists the file is stat'ed, and if the file is gone too this is a
    /// no-op. Failures are logged and swallowed.
    pub async fn touch(&self, digest: &str, size: Option<u64>) {
        if let Err(e) = self.try_touch(digest, size).await {
            debug!(digest = %digest, error = %e, "touch failed");
        }
    }

    async fn try_touch(&self, digest: &str, size: Option<u64>) -> Result<()> {
        let now = now_ms();

        if let Some(size) = size {
            sqlx::query(
                "INSERT INTO cache_metadata (sha256, last_accessed, size, uploaded)
                 VALUES (?1, ?2, ?3, NULL)
                 ON CONFLICT(sha256) DO UPDATE SET last_accessed = ?2, size = ?3",
            )
            .bind(digest)
            .bind(now)
            .bind(size as i64)
            .execute(&self.pool)
            .await?;
            return Ok(());
        }

        let updated = sqlx::query("UPDATE cache_metadata SET last_accessed = ?2 WHERE sha256 = ?1")
            .bind(digest)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            // No row yet: fall back to the file on disk, if any.
            let Ok(meta) = tokio::fs::metadata(self.blob_path(digest)).await else {
                return Ok(());
            };
            sqlx::query(
                "INSERT OR REPLACE INTO cache_metadata (sha256, last_accessed, size, uploaded)
                 VALUES (?1, ?2, ?3, NULL)",
            )
            .bind(digest)
            .bind(now)
            .bind(meta.len() as i64)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    // -- accounting ---------------------------------------------------------

    /// Total recorded cache size in bytes.
    pub async fn size_total(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COALESCE(SUM(size), 0) AS total FROM cache_metadata")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("total").max(0) as u64)
    }

    /// Blob count and total bytes, for the statistics page.
    pub async fn stats(&self) -> Result<(u64, u64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS blobs, COALESCE(SUM(size), 0) AS total FROM cache_metadata",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.get::<i64, _>("blobs").max(0) as u64,
            row.get::<i64, _>("total").max(0) as u64,
        ))
    }

    /// Confirm the metadata database answers queries (health check).
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Record metadata for a freshly written blob file and kick off pruning
    /// without awaiting it.
    pub async fn write_and_record(&self, digest: &str, size: u64, uploaded: i64) {
        let result = sqlx::query(
            "INSERT OR REPLACE INTO cache_metadata (sha256, last_accessed, size, uploaded)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(digest)
        .bind(now_ms())
        .bind(size as i64)
        .bind(uploaded)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(digest = %digest, error = %e, "failed to record cache metadata");
        }

        let store = self.clone();
        tokio::spawn(async move {
            store.prune_if_needed().await;
        });
    }

    /// Delete a blob file and its metadata row. Returns whether either
    /// existed.
    pub async fn delete(&self, digest: &str) -> bool {
        let file_removed = tokio::fs::remove_file(self.blob_path(digest)).await.is_ok();

        let row_removed = match sqlx::query("DELETE FROM cache_metadata WHERE sha256 = ?1")
            .bind(digest)
            .execute(&self.pool)
            .await
        {
            Ok(r) => r.rows_affected() > 0,
            Err(e) => {
                warn!(digest = %digest, error = %e, "failed to delete metadata row");
                false
            }
        };

        file_removed || row_removed
    }

    /// Upload timestamp (seconds) for a digest, if recorded.
    pub async fn get_uploaded(&self, digest: &str) -> Option<i64> {
        sqlx::query("SELECT uploaded FROM cache_metadata WHERE sha256 = ?1")
            .bind(digest)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .and_then(|row| row.get::<Option<i64>, _>("uploaded"))
    }

    // -- pruning ------------------------------------------------------------

    /// Run [`prune`](Self::prune) when a ceiling is configured and exceeded.
    /// Metadata failures skip the sweep silently.
    pub async fn prune_if_needed(&self) {
        let Some(max) = self.max_bytes else { return };

        let total = match self.size_total().await {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "skipping prune, size query failed");
                return;
            }
        };

        if total > max {
            if let Err(e) = self.prune(total, max).await {
                warn!(error = %e, "prune sweep failed");
            }
        }
    }

    /// Evict least-recently-accessed blobs until usage drops to the prune
    /// target (90% of the ceiling). Ties on `last_accessed` break in
    /// ascending digest order.
    async fn prune(&self, total: u64, max: u64) -> Result<()> {
        let target = (max as f64 * PRUNE_TARGET_FRACTION) as u64;
        let mut to_free = total.saturating_sub(target);

        let rows = sqlx::query(
            "SELECT sha256, size FROM cache_metadata
             ORDER BY last_accessed ASC, sha256 ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut evicted: u64 = 0;
        let mut freed: u64 = 0;

        for row in rows {
            if to_free == 0 {
                break;
            }

            let digest: String = row.get("sha256");
            let size = row.get::<i64, _>("size").max(0) as u64;

            // Remove the row even when the file delete fails so metadata
            // cannot diverge from the directory.
            if let Err(e) = tokio::fs::remove_file(self.blob_path(&digest)).await {
                warn!(digest = %digest, error = %e, "evicted blob file could not be removed");
            }
            sqlx::query("DELETE FROM cache_metadata WHERE sha256 = ?1")
                .bind(&digest)
                .execute(&self.pool)
                .await?;

            evicted += 1;
            freed += size;
            to_free = to_free.saturating_sub(size);
        }

        info!(evicted, freed_bytes = freed, target_bytes = target, "cache pruned");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn open_database(db_path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .context("failed to open metadata DB")?;

    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(&pool)
            .await
            .context("failed to apply metadata schema")?;
    }

    Ok(pool)
}

async fn remove_database_files(db_path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db_path.as_os_str().to_owned();
        path.push(suffix);
        let _ = tokio::fs::remove_file(PathBuf::from(path)).await;
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn now_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
