//! Indexing session state, progress events and reports.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::chunk::CodeChunk;
use crate::config::IndexerConfig;

/// Orchestrator state machine: `idle → indexing → {paused ⇄ indexing} → idle | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    #[default]
    Idle,
    Indexing,
    Paused,
    Error,
}

impl IndexStatus {
    /// A full session owns the collection (running or paused).
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Indexing | Self::Paused)
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Indexing => "indexing",
            Self::Paused => "paused",
            Self::Error => "error",
        })
    }
}

/// Session phases in pipeline order. While workers run, the session phase
/// is the furthest step any file has entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexPhase {
    Discovering,
    Parsing,
    Chunking,
    Embedding,
    Storing,
    Complete,
}

impl fmt::Display for IndexPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discovering => "discovering",
            Self::Parsing => "parsing",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Storing => "storing",
            Self::Complete => "complete",
        })
    }
}

/// Where a per-file failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStage {
    Discover,
    Read,
    Parse,
    Embed,
    Store,
    Remove,
}

impl fmt::Display for FileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Discover => "discover",
            Self::Read => "read",
            Self::Parse => "parse",
            Self::Embed => "embed",
            Self::Store => "store",
            Self::Remove => "remove",
        })
    }
}

/// A file-scoped failure. Recorded in the session; never aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub path: String,
    pub stage: FileStage,
    pub message: String,
}

impl FileError {
    pub fn new(path: impl Into<String>, stage: FileStage, message: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            stage,
            message: message.to_string(),
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.path, self.stage, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub files_by_language: BTreeMap<String, usize>,
    pub chunks_by_kind: BTreeMap<String, usize>,
    pub total_chunks: usize,
    pub total_lines: usize,
    pub total_bytes: u64,
    pub total_embeddings: usize,
    pub files_unchanged: usize,
    pub files_removed: usize,
    pub files_skipped: usize,
}

impl SessionStats {
    pub fn record_file(&mut self, language: &str, chunks: &[CodeChunk], lines: usize, bytes: u64) {
        *self
            .files_by_language
            .entry(language.to_string())
            .or_default() += 1;
        for chunk in chunks {
            *self
                .chunks_by_kind
                .entry(chunk.kind.as_str().to_string())
                .or_default() += 1;
        }
        self.total_chunks += chunks.len();
        self.total_lines += lines;
        self.total_bytes += bytes;
    }
}

/// Configuration captured when a session starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub max_file_size: u64,
    pub chunk_target_size: usize,
    pub chunk_max_size: usize,
    pub window_overlap_lines: usize,
    pub batch_size: usize,
    pub workers: usize,
}

impl ConfigSnapshot {
    #[must_use]
    pub fn capture(config: &IndexerConfig, batch_size: usize) -> Self {
        Self {
            include: config.include.clone(),
            exclude: config.exclude.clone(),
            max_file_size: config.max_file_size,
            chunk_target_size: config.chunker.target_size,
            chunk_max_size: config.chunker.max_size,
            window_overlap_lines: config.window.overlap_lines,
            batch_size,
            workers: config.pool_size(),
        }
    }
}

/// The single active indexing run. Mutated only by the orchestrator loop.
#[derive(Debug, Clone, Serialize)]
pub struct IndexingSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config: ConfigSnapshot,
    pub status: IndexStatus,
    pub phase: IndexPhase,
    pub total_files: usize,
    pub processed_files: usize,
    pub current_file: Option<String>,
    pub errors: Vec<FileError>,
    pub stats: SessionStats,
}

impl IndexingSession {
    #[must_use]
    pub fn new(config: ConfigSnapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            config,
            status: IndexStatus::Indexing,
            phase: IndexPhase::Discovering,
            total_files: 0,
            processed_files: 0,
            current_file: None,
            errors: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    /// Percent of discovered files processed, 0 before discovery finishes.
    #[must_use]
    pub fn percent(&self) -> f32 {
        if self.total_files == 0 {
            return if self.phase == IndexPhase::Complete { 100.0 } else { 0.0 };
        }
        #[allow(clippy::cast_precision_loss)]
        let pct = self.processed_files as f32 / self.total_files as f32 * 100.0;
        pct.min(100.0)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status,
            phase: Some(self.phase),
            session_id: Some(self.id),
            total_files: self.total_files,
            processed_files: self.processed_files,
            current_file: self.current_file.clone(),
            error_count: self.errors.len(),
            percent: self.percent(),
        }
    }

    #[must_use]
    pub fn report(&self, success: bool) -> IndexReport {
        let finished = self.finished_at.unwrap_or_else(Utc::now);
        IndexReport {
            success,
            session_id: self.id,
            total_files: self.total_files,
            processed_files: self.processed_files,
            errors: self.errors.clone(),
            stats: self.stats.clone(),
            duration_ms: u64::try_from((finished - self.started_at).num_milliseconds()).unwrap_or(0),
        }
    }
}

/// Answer to `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub status: IndexStatus,
    pub phase: Option<IndexPhase>,
    pub session_id: Option<Uuid>,
    pub total_files: usize,
    pub processed_files: usize,
    pub current_file: Option<String>,
    pub error_count: usize,
    pub percent: f32,
}

impl StatusSnapshot {
    #[must_use]
    pub fn idle(status: IndexStatus) -> Self {
        Self {
            status,
            phase: None,
            session_id: None,
            total_files: 0,
            processed_files: 0,
            current_file: None,
            error_count: 0,
            percent: 0.0,
        }
    }
}

/// Summary returned by `start_indexing`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    /// `true` unless the session ended in the error state.
    pub success: bool,
    pub session_id: Uuid,
    pub total_files: usize,
    pub processed_files: usize,
    pub errors: Vec<FileError>,
    pub stats: SessionStats,
    pub duration_ms: u64,
}

/// Events published on the orchestrator's progress stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    PhaseChanged {
        session_id: Uuid,
        phase: IndexPhase,
        processed: usize,
        total: usize,
    },
    FileCompleted {
        session_id: Uuid,
        file: String,
        chunks: usize,
        unchanged: bool,
        processed: usize,
        total: usize,
    },
    FileFailed {
        session_id: Uuid,
        error: FileError,
    },
    StatusChanged {
        status: IndexStatus,
    },
    /// Single-file update outside a session (change monitor).
    FileUpdated {
        file: String,
        chunks: usize,
    },
    FileRemoved {
        file: String,
    },
}
