//! Per-file pipeline: read → decode → parse → chunk → embed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use quarry_llm::LlmProvider;
use tokio::sync::mpsc;

use crate::chunk::{CodeChunk, blake3_hex};
use crate::chunker::chunk_tree;
use crate::config::IndexerConfig;
use crate::discovery::FileTask;
use crate::encoding::{TextEncoding, decode_source};
use crate::languages::Lang;
use crate::parser::ParserRegistry;
use crate::session::{FileError, FileStage, IndexPhase};
use crate::window::window_chunks;

/// Result of processing one [`FileTask`].
#[derive(Debug, Clone, Default)]
pub struct WorkerOutput {
    pub rel_path: String,
    pub chunks: Vec<CodeChunk>,
    /// One per chunk when embedded, empty otherwise.
    pub vectors: Vec<Vec<f32>>,
    pub language: Option<Lang>,
    pub line_count: usize,
    pub byte_count: u64,
    pub content_hash: Option<String>,
    /// Unix seconds.
    pub modified_at: i64,
    pub errors: Vec<FileError>,
    /// Content hash matched the previous index; nothing was parsed.
    pub unchanged: bool,
    /// Chunked with text windows instead of the syntax tree.
    pub fallback: bool,
}

impl WorkerOutput {
    fn new(task: &FileTask) -> Self {
        Self {
            rel_path: task.rel_path.clone(),
            language: task.language,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }

    fn fail(mut self, stage: FileStage, message: impl std::fmt::Display) -> Self {
        tracing::warn!(file = %self.rel_path, %stage, "{message}");
        self.errors
            .push(FileError::new(self.rel_path.clone(), stage, message));
        self.chunks.clear();
        self.vectors.clear();
        self
    }
}

pub(crate) enum WorkerMessage {
    /// A file entered a pipeline step.
    Stage(IndexPhase),
    Done { worker: usize, output: WorkerOutput },
}

/// Forwards pipeline steps to the orchestrator. The default reports nowhere.
#[derive(Clone, Default)]
pub(crate) struct StageReporter(Option<mpsc::UnboundedSender<WorkerMessage>>);

impl StageReporter {
    fn enter(&self, phase: IndexPhase) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(WorkerMessage::Stage(phase));
        }
    }
}

/// Isolated execution unit. Owns its provider handle and parser registry;
/// shares no mutable state with other workers.
pub struct Worker<P> {
    id: usize,
    provider: Arc<P>,
    registry: ParserRegistry,
    config: Arc<IndexerConfig>,
    embed: bool,
}

impl<P: LlmProvider + 'static> Worker<P> {
    #[must_use]
    pub fn new(
        id: usize,
        provider: Arc<P>,
        registry: ParserRegistry,
        config: Arc<IndexerConfig>,
        embed: bool,
    ) -> Self {
        Self {
            id,
            provider,
            registry,
            config,
            embed,
        }
    }

    /// Run the pipeline for one file. Failures are captured in
    /// [`WorkerOutput::errors`], never returned.
    pub async fn process(&self, task: &FileTask) -> WorkerOutput {
        self.process_reporting(task, &StageReporter::default()).await
    }

    async fn process_reporting(&self, task: &FileTask, stages: &StageReporter) -> WorkerOutput {
        let mut out = WorkerOutput::new(task);

        let bytes = match tokio::fs::read(&task.abs_path).await {
            Ok(bytes) => bytes,
            Err(e) => return out.fail(FileStage::Read, e),
        };
        out.byte_count = bytes.len() as u64;
        if out.byte_count > self.config.max_file_size {
            let message = format!("{} bytes exceeds the size limit", out.byte_count);
            return out.fail(FileStage::Read, message);
        }
        out.modified_at = modified_unix_secs(task).await;

        let hash = blake3_hex(&bytes);
        out.unchanged = task.previous_hash.as_deref() == Some(hash.as_str());
        out.content_hash = Some(hash);
        if out.unchanged {
            tracing::debug!(worker = self.id, file = %task.rel_path, "unchanged");
            return out;
        }

        let source = match decode_source(&bytes) {
            Ok((text, encoding)) => {
                if encoding != TextEncoding::Utf8 {
                    tracing::debug!(file = %task.rel_path, %encoding, "decoded with fallback");
                }
                text
            }
            Err(e) => return out.fail(FileStage::Read, e),
        };
        drop(bytes);
        out.line_count = source.lines().count();

        stages.enter(IndexPhase::Parsing);
        let registry = self.registry.clone();
        let config = Arc::clone(&self.config);
        let chunk_stages = stages.clone();
        let abs_path = task.abs_path.clone();
        let rel_path = task.rel_path.clone();
        let language = task.language;
        let chunked = tokio::task::spawn_blocking(move || {
            chunk_source(
                &source,
                &abs_path,
                &rel_path,
                language,
                &registry,
                &config,
                &chunk_stages,
            )
        })
        .await;
        match chunked {
            Ok((chunks, fallback)) => {
                out.chunks = chunks;
                out.fallback = fallback;
            }
            Err(e) => return out.fail(FileStage::Parse, e),
        }

        if self.embed && !out.chunks.is_empty() {
            stages.enter(IndexPhase::Embedding);
            let texts: Vec<String> = out
                .chunks
                .iter()
                .map(|c| c.processed_content.clone())
                .collect();
            match self.provider.embed_batch(&texts).await {
                Ok(vectors) if vectors.len() == texts.len() => out.vectors = vectors,
                Ok(vectors) => {
                    let message = format!(
                        "embedding backend returned {} vectors for {} chunks",
                        vectors.len(),
                        texts.len()
                    );
                    return out.fail(FileStage::Embed, message);
                }
                Err(e) => return out.fail(FileStage::Embed, e),
            }
        }

        tracing::debug!(
            worker = self.id,
            file = %task.rel_path,
            chunks = out.chunks.len(),
            fallback = out.fallback,
            "file processed"
        );
        out
    }

    /// Take tasks one at a time until the task channel closes.
    pub(crate) async fn run(
        self,
        mut tasks: mpsc::Receiver<FileTask>,
        results: mpsc::UnboundedSender<WorkerMessage>,
    ) {
        let stages = StageReporter(Some(results.clone()));
        while let Some(task) = tasks.recv().await {
            let output = self.process_reporting(&task, &stages).await;
            if results
                .send(WorkerMessage::Done {
                    worker: self.id,
                    output,
                })
                .is_err()
            {
                break;
            }
        }
        tracing::trace!(worker = self.id, "worker exiting");
    }
}

/// Syntax-aware chunks when a parser is available and the file is small
/// enough, text windows otherwise. Returns `(chunks, used_fallback)`.
pub(crate) fn chunk_source(
    source: &str,
    abs_path: &std::path::Path,
    rel_path: &str,
    language: Option<Lang>,
    registry: &ParserRegistry,
    config: &IndexerConfig,
    stages: &StageReporter,
) -> (Vec<CodeChunk>, bool) {
    let windows = || {
        stages.enter(IndexPhase::Chunking);
        window_chunks(source, rel_path, language, &config.window)
    };

    if source.len() as u64 > config.parse_size_limit {
        tracing::debug!(file = %rel_path, bytes = source.len(), "above parse limit, using text windows");
        return (windows(), true);
    }
    let Some(parser) = registry.for_path(abs_path) else {
        return (windows(), true);
    };
    match parser.parse(source) {
        Ok(tree) => {
            stages.enter(IndexPhase::Chunking);
            (
                chunk_tree(source, &tree, rel_path, parser.language(), &config.chunker),
                false,
            )
        }
        Err(e) => {
            tracing::warn!(file = %rel_path, "parse failed, using text windows: {e}");
            (windows(), true)
        }
    }
}

async fn modified_unix_secs(task: &FileTask) -> i64 {
    tokio::fs::metadata(&task.abs_path)
        .await
        .and_then(|m| m.modified())
        .map_or(0, |t| DateTime::<Utc>::from(t).timestamp())
}
