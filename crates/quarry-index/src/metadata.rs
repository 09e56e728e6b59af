//! `SQLite` file metadata for incremental indexing.

use std::collections::HashMap;
use std::str::FromStr;

use serde::Serialize;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

use crate::error::Result;
use crate::session::IndexingSession;

/// Last successful index of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub content_hash: String,
    pub chunk_count: usize,
    pub language: Option<String>,
    pub size_bytes: u64,
    /// Unix seconds.
    pub modified_at: i64,
    pub indexed_at: i64,
}

type FileRow = (String, String, i64, Option<String>, i64, i64, i64);

fn record_from_row(row: FileRow) -> Result<FileRecord> {
    Ok(FileRecord {
        path: row.0,
        content_hash: row.1,
        chunk_count: usize::try_from(row.2)?,
        language: row.3,
        size_bytes: u64::try_from(row.4)?,
        modified_at: row.5,
        indexed_at: row.6,
    })
}

/// Persisted summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub outcome: String,
    pub total_files: usize,
    pub processed_files: usize,
    pub error_count: usize,
    pub total_chunks: usize,
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (or create) the database at `path` and run migrations.
    /// `:memory:` opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn open(path: &str) -> Result<Self> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let mut opts = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
        if !in_memory {
            opts = opts
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // Each in-memory connection is its own database.
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        sqlx::migrate!().run(&pool).await?;
        Ok(Self { pool })
    }

    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub async fn in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Content hash per indexed path.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn file_hashes(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT path, content_hash FROM indexed_files")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as(
            "SELECT path, content_hash, chunk_count, language, size_bytes, modified_at, indexed_at \
             FROM indexed_files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.map(record_from_row).transpose()
    }

    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn record_file(&self, record: &FileRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO indexed_files \
             (path, content_hash, chunk_count, language, size_bytes, modified_at, indexed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(path) DO UPDATE SET \
             content_hash = excluded.content_hash, \
             chunk_count = excluded.chunk_count, \
             language = excluded.language, \
             size_bytes = excluded.size_bytes, \
             modified_at = excluded.modified_at, \
             indexed_at = excluded.indexed_at",
        )
        .bind(&record.path)
        .bind(&record.content_hash)
        .bind(i64::try_from(record.chunk_count)?)
        .bind(record.language.as_deref())
        .bind(i64::try_from(record.size_bytes)?)
        .bind(record.modified_at)
        .bind(record.indexed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns `true` if a record was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn remove_file(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM indexed_files WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn indexed_paths(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT path FROM indexed_files ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    /// Forget every indexed file. Session history is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM indexed_files")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn record_session(&self, session: &IndexingSession, outcome: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO index_sessions \
             (id, started_at, finished_at, outcome, total_files, processed_files, error_count, total_chunks) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.started_at.timestamp())
        .bind(session.finished_at.map(|t| t.timestamp()))
        .bind(outcome)
        .bind(i64::try_from(session.total_files)?)
        .bind(i64::try_from(session.processed_files)?)
        .bind(i64::try_from(session.errors.len())?)
        .bind(i64::try_from(session.stats.total_chunks)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM index_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO index_state (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn last_session(&self) -> Result<Option<SessionRecord>> {
        let row: Option<(String, i64, Option<i64>, String, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT id, started_at, finished_at, outcome, total_files, processed_files, \
             error_count, total_chunks FROM index_sessions \
             ORDER BY started_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(r) = row else {
            return Ok(None);
        };
        Ok(Some(SessionRecord {
            id: r.0,
            started_at: r.1,
            finished_at: r.2,
            outcome: r.3,
            total_files: usize::try_from(r.4)?,
            processed_files: usize::try_from(r.5)?,
            error_count: usize::try_from(r.6)?,
            total_chunks: usize::try_from(r.7)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexerConfig;
    use crate::session::ConfigSnapshot;

    fn record(path: &str, hash: &str) -> FileRecord {
        FileRecord {
            path: path.into(),
            content_hash: hash.into(),
            chunk_count: 3,
            language: Some("rust".into()),
            size_bytes: 120,
            modified_at: 1_700_000_000,
            indexed_at: 1_700_000_500,
        }
    }

    #[tokio::test]
    async fn record_and_read_back() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.record_file(&record("src/a.rs", "h1")).await.unwrap();
        let got = store.get_file("src/a.rs").await.unwrap().unwrap();
        assert_eq!(got, record("src/a.rs", "h1"));
        assert!(store.get_file("missing.rs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn state_is_upserted_by_key() {
        let store = MetadataStore::in_memory().await.unwrap();
        assert!(store.state("embedder").await.unwrap().is_none());
        store.set_state("embedder", "ollama:a:768").await.unwrap();
        store.set_state("embedder", "ollama:b:768").await.unwrap();
        assert_eq!(
            store.state("embedder").await.unwrap().as_deref(),
            Some("ollama:b:768")
        );
    }

    #[tokio::test]
    async fn record_overwrites_by_path() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.record_file(&record("a.rs", "h1")).await.unwrap();
        store.record_file(&record("a.rs", "h2")).await.unwrap();
        let hashes = store.file_hashes().await.unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes["a.rs"], "h2");
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.record_file(&record("a.rs", "h")).await.unwrap();
        store.record_file(&record("b.rs", "h")).await.unwrap();
        assert!(store.remove_file("a.rs").await.unwrap());
        assert!(!store.remove_file("a.rs").await.unwrap());
        assert_eq!(store.indexed_paths().await.unwrap(), vec!["b.rs"]);
        store.clear().await.unwrap();
        assert!(store.indexed_paths().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_history() {
        let store = MetadataStore::in_memory().await.unwrap();
        assert!(store.last_session().await.unwrap().is_none());

        let mut session = IndexingSession::new(ConfigSnapshot::capture(&IndexerConfig::default(), 100));
        session.total_files = 4;
        session.processed_files = 4;
        session.stats.total_chunks = 9;
        session.finished_at = Some(chrono::Utc::now());
        store.record_session(&session, "complete").await.unwrap();

        let last = store.last_session().await.unwrap().unwrap();
        assert_eq!(last.id, session.id.to_string());
        assert_eq!(last.outcome, "complete");
        assert_eq!(last.total_chunks, 9);
    }

    #[tokio::test]
    async fn wal_journal_mode_on_file_db() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let store = MetadataStore::open(file.path().to_str().unwrap()).await.unwrap();
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(mode, "wal");
    }
}
