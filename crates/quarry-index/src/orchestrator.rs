//! Indexing orchestrator: discovery, worker pool dispatch, storing and the
//! session state machine.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::future::BoxFuture;
use quarry_llm::LlmProvider;
use quarry_vector::{CollectionInfo, FieldValue, VectorFilter, VectorPoint, VectorStoreClient};
use tokio::sync::{OnceCell, broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::IndexerConfig;
use crate::discovery::{Discovery, FileTask, discover, is_binary_extension, relative_path};
use crate::error::{IndexError, Result};
use crate::languages::{PLAIN_TEXT, detect_language};
use crate::metadata::{FileRecord, MetadataStore};
use crate::parser::ParserRegistry;
use crate::points::{chunk_to_point, fields};
use crate::session::{
    ConfigSnapshot, FileError, FileStage, IndexPhase, IndexReport, IndexStatus, IndexingSession,
    ProgressEvent, StatusSnapshot,
};
use crate::watcher::ChangeTarget;
use crate::worker::{Worker, WorkerMessage, WorkerOutput};

const EVENT_CAPACITY: usize = 256;
/// `index_state` key holding `provider:model:dimension` of the last embedder.
const EMBEDDER_STATE_KEY: &str = "embedder";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunControl {
    Running,
    Paused,
    Cancelled,
}

/// Owns the single indexing session and the worker pool.
///
/// Share it behind an `Arc`: `start_indexing` runs for the whole session
/// while `pause`, `resume`, `cancel` and `get_status` are called from
/// elsewhere.
pub struct IndexOrchestrator<P> {
    root: PathBuf,
    provider: Arc<P>,
    store: Arc<VectorStoreClient>,
    metadata: MetadataStore,
    registry: ParserRegistry,
    config: Arc<IndexerConfig>,
    session: Mutex<Option<IndexingSession>>,
    control: watch::Sender<RunControl>,
    status: watch::Sender<IndexStatus>,
    events: broadcast::Sender<ProgressEvent>,
    vector_size: OnceCell<u64>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Held by a full session and by single-file updates.
    exclusive: tokio::sync::Mutex<()>,
}

impl<P: LlmProvider + 'static> IndexOrchestrator<P> {
    #[must_use]
    pub fn new(
        root: impl Into<PathBuf>,
        provider: Arc<P>,
        store: Arc<VectorStoreClient>,
        metadata: MetadataStore,
        config: IndexerConfig,
    ) -> Self {
        let (control, _) = watch::channel(RunControl::Running);
        let (status, _) = watch::channel(IndexStatus::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            root: root.into(),
            provider,
            store,
            metadata,
            registry: ParserRegistry::with_builtin(),
            config: Arc::new(config),
            session: Mutex::new(None),
            control,
            status,
            events,
            vector_size: OnceCell::new(),
            workers: Mutex::new(Vec::new()),
            exclusive: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the built-in parser registry.
    #[must_use]
    pub fn with_registry(mut self, registry: ParserRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Progress events for every phase transition and file completion.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<IndexStatus> {
        self.status.subscribe()
    }

    #[must_use]
    pub fn get_status(&self) -> StatusSnapshot {
        let status = *self.status.borrow();
        self.lock_session()
            .as_ref()
            .map_or_else(|| StatusSnapshot::idle(status), IndexingSession::snapshot)
    }

    /// Run a full indexing session to completion.
    ///
    /// Per-file failures are collected in the report. The session ends in
    /// the error state only when the collection cannot be prepared or the
    /// metadata store fails.
    ///
    /// # Errors
    ///
    /// [`IndexError::AlreadyRunning`] if a session is active,
    /// [`IndexError::Cancelled`] after [`Self::cancel`], or the fatal error.
    pub async fn start_indexing(&self) -> Result<IndexReport> {
        self.begin_session()?;
        let _exclusive = self.exclusive.lock().await;
        tracing::info!(root = %self.root.display(), "indexing started");

        let result = self.run_session().await;
        self.abort_workers();
        match result {
            Ok(()) => {
                self.set_phase(IndexPhase::Complete);
                self.finish(IndexStatus::Idle, "complete")
                    .await
                    .ok_or(IndexError::NotRunning)
            }
            Err(IndexError::Cancelled) => {
                tracing::info!("indexing cancelled");
                self.finish(IndexStatus::Idle, "cancelled").await;
                Err(IndexError::Cancelled)
            }
            Err(e) => {
                tracing::error!("indexing failed: {e}");
                self.finish(IndexStatus::Error, "error").await;
                Err(e)
            }
        }
    }

    /// Stop dispatching new files. In-flight files finish.
    ///
    /// # Errors
    ///
    /// [`IndexError::NotRunning`] without an active session.
    pub fn pause(&self) -> Result<()> {
        let status = *self.status.borrow();
        match status {
            IndexStatus::Indexing => {}
            IndexStatus::Paused => return Ok(()),
            IndexStatus::Idle | IndexStatus::Error => return Err(IndexError::NotRunning),
        }
        let paused = self.control.send_if_modified(|c| {
            if *c == RunControl::Running {
                *c = RunControl::Paused;
                true
            } else {
                false
            }
        });
        if paused {
            self.set_status(IndexStatus::Paused);
            tracing::info!("indexing paused");
        }
        Ok(())
    }

    /// # Errors
    ///
    /// [`IndexError::NotRunning`] without an active session.
    pub fn resume(&self) -> Result<()> {
        let status = *self.status.borrow();
        match status {
            IndexStatus::Paused => {}
            IndexStatus::Indexing => return Ok(()),
            IndexStatus::Idle | IndexStatus::Error => return Err(IndexError::NotRunning),
        }
        let resumed = self.control.send_if_modified(|c| {
            if *c == RunControl::Paused {
                *c = RunControl::Running;
                true
            } else {
                false
            }
        });
        if resumed {
            self.set_status(IndexStatus::Indexing);
            tracing::info!("indexing resumed");
        }
        Ok(())
    }

    /// Graceful stop. The session stays resumable, like [`Self::pause`].
    ///
    /// # Errors
    ///
    /// [`IndexError::NotRunning`] without an active session.
    pub fn stop(&self) -> Result<()> {
        self.pause()
    }

    /// Discard the queue and terminate workers. Returns immediately;
    /// `start_indexing` then resolves to [`IndexError::Cancelled`].
    ///
    /// # Errors
    ///
    /// [`IndexError::NotRunning`] without an active session.
    pub fn cancel(&self) -> Result<()> {
        if !self.status.borrow().is_active() {
            return Err(IndexError::NotRunning);
        }
        self.control.send_replace(RunControl::Cancelled);
        self.abort_workers();
        Ok(())
    }

    /// Re-index one file outside a full session. A missing file is removed
    /// from the index. Returns the file's chunk count.
    ///
    /// # Errors
    ///
    /// [`IndexError::SessionActive`] during a full session,
    /// [`IndexError::File`] when the file fails to process, or a store error.
    pub async fn update_file_in_index(&self, path: &Path) -> Result<usize> {
        self.ensure_no_session()?;
        let _exclusive = self.exclusive.lock().await;
        self.ensure_no_session()?;

        let abs_path = self.absolute(path);
        let rel_path = self.relative(path)?;
        let meta = match tokio::fs::metadata(&abs_path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => {
                return Err(IndexError::InvalidArgument(format!(
                    "{rel_path} is not a regular file"
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.remove_tree(&rel_path).await?;
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        if meta.len() > self.config.max_file_size || is_binary_extension(&abs_path) {
            tracing::debug!(file = %rel_path, "no longer indexable, removing");
            self.remove_path(&rel_path).await?;
            return Ok(0);
        }

        self.ensure_collection().await?;
        let previous = self.metadata.get_file(&rel_path).await?;
        let task = FileTask {
            language: detect_language(&abs_path),
            abs_path,
            rel_path: rel_path.clone(),
            size: meta.len(),
            previous_hash: previous.as_ref().map(|r| r.content_hash.clone()),
        };
        let worker = Worker::new(
            0,
            Arc::clone(&self.provider),
            self.registry.clone(),
            Arc::clone(&self.config),
            true,
        );
        let output = worker.process(&task).await;
        if let Some(err) = output.errors.first() {
            return Err(IndexError::File(err.clone()));
        }
        if output.unchanged {
            return Ok(previous.map_or(0, |r| r.chunk_count));
        }

        let chunks = self.store_output(&output).await?;
        tracing::info!(file = %rel_path, chunks, "file re-indexed");
        self.emit(ProgressEvent::FileUpdated {
            file: rel_path,
            chunks,
        });
        Ok(chunks)
    }

    /// Remove every point and the metadata record for one file.
    ///
    /// # Errors
    ///
    /// [`IndexError::SessionActive`] during a full session, or a store error.
    pub async fn remove_file_from_index(&self, path: &Path) -> Result<()> {
        self.ensure_no_session()?;
        let _exclusive = self.exclusive.lock().await;
        self.ensure_no_session()?;
        let rel_path = self.relative(path)?;
        self.remove_tree(&rel_path).await
    }

    /// Drop and recreate the collection and forget all file metadata.
    ///
    /// # Errors
    ///
    /// [`IndexError::SessionActive`] during a full session, or a store error.
    pub async fn clear_index(&self) -> Result<()> {
        self.ensure_no_session()?;
        let _exclusive = self.exclusive.lock().await;
        self.ensure_no_session()?;

        let collection = self.store.collection();
        if self.store.collection_info(collection).await?.is_some() {
            self.store.delete_collection(collection).await?;
        }
        self.metadata.clear().await?;
        self.ensure_collection().await?;
        tracing::info!(collection, "index cleared");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the vector store error.
    pub async fn collection_info(&self) -> Result<Option<CollectionInfo>> {
        Ok(self.store.collection_info(self.store.collection()).await?)
    }

    fn begin_session(&self) -> Result<()> {
        let mut guard = self.lock_session();
        if guard.is_some() || self.status.borrow().is_active() {
            return Err(IndexError::AlreadyRunning);
        }
        let snapshot = ConfigSnapshot::capture(&self.config, self.store.config().batch_size);
        *guard = Some(IndexingSession::new(snapshot));
        drop(guard);
        self.control.send_replace(RunControl::Running);
        self.set_status(IndexStatus::Indexing);
        Ok(())
    }

    async fn run_session(&self) -> Result<()> {
        let mut control = self.control.subscribe();
        self.emit_phase();

        self.ensure_collection().await?;
        let discovery = self.discover().await?;
        let discovered: HashSet<String> =
            discovery.tasks.iter().map(|t| t.rel_path.clone()).collect();
        self.update_session(|s| {
            s.total_files = discovery.tasks.len();
            s.stats.files_skipped = discovery.skipped_too_large + discovery.skipped_binary;
            s.errors.extend(discovery.errors.iter().cloned());
        });

        let mut outputs = self.dispatch(discovery.tasks, &mut control).await?;

        if !self.config.embed_in_workers {
            self.set_phase(IndexPhase::Embedding);
            self.embed_outputs(&mut outputs, &mut control).await?;
        }

        self.set_phase(IndexPhase::Storing);
        for output in outputs.iter().filter(|o| !o.failed() && !o.unchanged) {
            checkpoint(&mut control).await?;
            self.update_session(|s| s.current_file = Some(output.rel_path.clone()));
            match self.store_output(output).await {
                Ok(count) => {
                    self.update_session(|s| s.stats.total_embeddings += count);
                }
                Err(e) => {
                    self.record_error(FileError::new(output.rel_path.clone(), FileStage::Store, e));
                }
            }
        }

        for path in self.metadata.indexed_paths().await? {
            if discovered.contains(&path) {
                continue;
            }
            checkpoint(&mut control).await?;
            match self.remove_path(&path).await {
                Ok(()) => {
                    self.update_session(|s| s.stats.files_removed += 1);
                }
                Err(e) => self.record_error(FileError::new(path, FileStage::Remove, e)),
            }
        }
        Ok(())
    }

    async fn discover(&self) -> Result<Discovery> {
        let previous = self.metadata.file_hashes().await?;
        let root = self.root.clone();
        let config = Arc::clone(&self.config);
        tokio::task::spawn_blocking(move || discover(&root, &config, &previous)).await?
    }

    /// Feed the FIFO queue to idle workers until every file is processed.
    async fn dispatch(
        &self,
        tasks: Vec<FileTask>,
        control: &mut watch::Receiver<RunControl>,
    ) -> Result<Vec<WorkerOutput>> {
        self.set_phase(IndexPhase::Parsing);
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let pool = self.config.pool_size().min(tasks.len());
        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let mut senders = Vec::with_capacity(pool);
        {
            let mut handles = self.lock_workers();
            for id in 0..pool {
                let (task_tx, task_rx) = mpsc::channel(1);
                let worker = Worker::new(
                    id,
                    Arc::clone(&self.provider),
                    self.registry.clone(),
                    Arc::clone(&self.config),
                    self.config.embed_in_workers,
                );
                handles.push(tokio::spawn(worker.run(task_rx, result_tx.clone())));
                senders.push(task_tx);
            }
        }
        drop(result_tx);
        tracing::info!(workers = pool, files = tasks.len(), "dispatching files");

        let mut queue: VecDeque<FileTask> = tasks.into();
        let mut idle: VecDeque<usize> = (0..pool).collect();
        let mut in_flight = 0usize;
        let mut outputs = Vec::with_capacity(queue.len());

        loop {
            let state = *control.borrow_and_update();
            match state {
                RunControl::Cancelled => return Err(IndexError::Cancelled),
                RunControl::Paused => {}
                RunControl::Running => {
                    while !queue.is_empty() && !idle.is_empty() {
                        let (Some(worker), Some(task)) = (idle.pop_front(), queue.pop_front())
                        else {
                            break;
                        };
                        self.update_session(|s| s.current_file = Some(task.rel_path.clone()));
                        if senders[worker].send(task).await.is_err() {
                            return Err(pool_exited(control));
                        }
                        in_flight += 1;
                    }
                }
            }

            if queue.is_empty() && in_flight == 0 {
                break;
            }

            tokio::select! {
                msg = result_rx.recv() => {
                    match msg {
                        Some(WorkerMessage::Stage(phase)) => self.advance_phase(phase),
                        Some(WorkerMessage::Done { worker, output }) => {
                            in_flight -= 1;
                            idle.push_back(worker);
                            self.record_output(&output);
                            outputs.push(output);
                        }
                        None => return Err(pool_exited(control)),
                    }
                }
                changed = control.changed() => {
                    if changed.is_err() {
                        return Err(IndexError::Cancelled);
                    }
                }
            }
        }

        drop(senders);
        let handles = std::mem::take(&mut *self.lock_workers());
        for handle in handles {
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                tracing::warn!("worker task failed: {e}");
            }
        }
        Ok(outputs)
    }

    /// Separate embedding phase, used when workers do not embed.
    async fn embed_outputs(
        &self,
        outputs: &mut [WorkerOutput],
        control: &mut watch::Receiver<RunControl>,
    ) -> Result<()> {
        let batch_size = self.config.embedding_batch_size.max(1);
        for output in outputs
            .iter_mut()
            .filter(|o| !o.failed() && !o.unchanged && !o.chunks.is_empty())
        {
            checkpoint(control).await?;
            let texts: Vec<String> = output
                .chunks
                .iter()
                .map(|c| c.processed_content.clone())
                .collect();
            let mut vectors = Vec::with_capacity(texts.len());
            let mut failure = None;
            for batch in texts.chunks(batch_size) {
                match self.provider.embed_batch(batch).await {
                    Ok(v) if v.len() == batch.len() => vectors.extend(v),
                    Ok(v) => {
                        failure = Some(format!(
                            "embedding backend returned {} vectors for {} texts",
                            v.len(),
                            batch.len()
                        ));
                        break;
                    }
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }
            match failure {
                None => output.vectors = vectors,
                Some(message) => {
                    let err = FileError::new(output.rel_path.clone(), FileStage::Embed, message);
                    output.errors.push(err.clone());
                    output.chunks.clear();
                    self.record_error(err);
                }
            }
        }
        Ok(())
    }

    /// Upsert a processed file, prune its stale points and record metadata.
    ///
    /// Points are upserted before stale ones are deleted, so a search never
    /// sees the file with no points mid-update.
    async fn store_output(&self, output: &WorkerOutput) -> Result<usize> {
        if output.vectors.len() != output.chunks.len() {
            return Err(IndexError::Other(format!(
                "{}: {} chunks but {} vectors",
                output.rel_path,
                output.chunks.len(),
                output.vectors.len()
            )));
        }
        let collection = self.store.collection();
        let indexed_at = Utc::now().timestamp();
        let points: Vec<VectorPoint> = output
            .chunks
            .iter()
            .zip(&output.vectors)
            .enumerate()
            .map(|(i, (chunk, vector))| {
                chunk_to_point(chunk, i, vector.clone(), output.modified_at, indexed_at)
            })
            .collect();
        let count = points.len();

        if count == 0 {
            self.store
                .delete_by_file_path(collection, &output.rel_path)
                .await?;
        } else {
            self.store.upsert_points(collection, points).await?;
            #[allow(clippy::cast_precision_loss)]
            let stale = VectorFilter::must(
                fields::FILE_PATH,
                FieldValue::Text(output.rel_path.clone()),
            )
            .and(
                "chunk_index",
                FieldValue::Range {
                    gte: Some(count as f64),
                    lte: None,
                },
            );
            self.store.delete_by_filter(collection, stale).await?;
        }

        self.metadata
            .record_file(&FileRecord {
                path: output.rel_path.clone(),
                content_hash: output.content_hash.clone().unwrap_or_default(),
                chunk_count: count,
                language: Some(
                    output
                        .language
                        .map_or(PLAIN_TEXT, crate::languages::Lang::id)
                        .to_string(),
                ),
                size_bytes: output.byte_count,
                modified_at: output.modified_at,
                indexed_at,
            })
            .await?;
        Ok(count)
    }

    /// Remove `rel_path` and every indexed file below it. A deleted or
    /// renamed directory arrives here as a single path.
    async fn remove_tree(&self, rel_path: &str) -> Result<()> {
        self.remove_path(rel_path).await?;
        let prefix = format!("{rel_path}/");
        for nested in self.metadata.indexed_paths().await? {
            if nested.starts_with(&prefix) {
                self.remove_path(&nested).await?;
            }
        }
        Ok(())
    }

    async fn remove_path(&self, rel_path: &str) -> Result<()> {
        self.store
            .delete_by_file_path(self.store.collection(), rel_path)
            .await?;
        self.metadata.remove_file(rel_path).await?;
        tracing::info!(file = %rel_path, "file removed from index");
        self.emit(ProgressEvent::FileRemoved {
            file: rel_path.to_string(),
        });
        Ok(())
    }

    /// Probe the embedding dimension once, then make sure the collection exists.
    ///
    /// File metadata is only trusted while the collection backs it. When the
    /// collection had to be created every file is forgotten so the next pass
    /// re-embeds it. Vectors from another embedder are not comparable, so an
    /// embedder change also drops and recreates the collection.
    async fn ensure_collection(&self) -> Result<u64> {
        let size = *self
            .vector_size
            .get_or_try_init(|| async {
                let probe = self.provider.embed("dimension probe").await?;
                Ok::<_, IndexError>(u64::try_from(probe.len())?)
            })
            .await?;
        let collection = self.store.collection();
        let distance = self.store.config().distance;
        let fingerprint = format!(
            "{}:{}:{size}",
            self.provider.name(),
            self.provider.embedding_model().unwrap_or("-")
        );
        let previous = self.metadata.state(EMBEDDER_STATE_KEY).await?;
        let embedder_changed = previous.as_deref().is_some_and(|p| p != fingerprint);
        if embedder_changed && self.store.collection_info(collection).await?.is_some() {
            tracing::warn!(
                collection,
                previous = previous.as_deref().unwrap_or_default(),
                current = %fingerprint,
                "embedder changed, dropping collection"
            );
            self.store.delete_collection(collection).await?;
        }
        let created = self
            .store
            .ensure_collection(collection, size, distance)
            .await?;

        if created || embedder_changed {
            let stale = self.metadata.indexed_paths().await?.len();
            if stale > 0 {
                tracing::warn!(
                    collection,
                    files = stale,
                    created,
                    embedder_changed,
                    "index metadata out of sync with collection, re-indexing all files"
                );
            }
            self.metadata.clear().await?;
        }
        if previous.as_deref() != Some(fingerprint.as_str()) {
            self.metadata
                .set_state(EMBEDDER_STATE_KEY, &fingerprint)
                .await?;
        }
        Ok(size)
    }

    async fn finish(&self, status: IndexStatus, outcome: &str) -> Option<IndexReport> {
        let taken = self.lock_session().take();
        let Some(mut session) = taken else {
            self.set_status(status);
            return None;
        };
        session.finished_at = Some(Utc::now());
        session.status = status;
        session.current_file = None;
        if let Err(e) = self.metadata.record_session(&session, outcome).await {
            tracing::warn!("failed to record session {}: {e}", session.id);
        }
        self.set_status(status);

        let report = session.report(status != IndexStatus::Error);
        tracing::info!(
            session = %session.id,
            outcome,
            files = report.total_files,
            processed = report.processed_files,
            chunks = report.stats.total_chunks,
            errors = report.errors.len(),
            duration_ms = report.duration_ms,
            "indexing finished"
        );
        Some(report)
    }

    fn record_output(&self, output: &WorkerOutput) {
        let mut failed = Vec::new();
        let progress = self.update_session(|s| {
            s.processed_files += 1;
            if output.failed() {
                s.errors.extend(output.errors.iter().cloned());
                failed.extend(output.errors.iter().cloned());
            } else if output.unchanged {
                s.stats.files_unchanged += 1;
            } else {
                let language = output.language.map_or(PLAIN_TEXT, crate::languages::Lang::id);
                s.stats
                    .record_file(language, &output.chunks, output.line_count, output.byte_count);
            }
            (s.id, s.processed_files, s.total_files)
        });
        let Some((session_id, processed, total)) = progress else {
            return;
        };

        tracing::info!(
            file = %output.rel_path,
            progress = format_args!("{processed}/{total}"),
            chunks = output.chunks.len(),
            unchanged = output.unchanged,
            "file processed"
        );
        for error in failed {
            self.emit(ProgressEvent::FileFailed { session_id, error });
        }
        self.emit(ProgressEvent::FileCompleted {
            session_id,
            file: output.rel_path.clone(),
            chunks: output.chunks.len(),
            unchanged: output.unchanged,
            processed,
            total,
        });
    }

    fn record_error(&self, error: FileError) {
        tracing::warn!("{error}");
        let session_id = self.update_session(|s| {
            s.errors.push(error.clone());
            s.id
        });
        if let Some(session_id) = session_id {
            self.emit(ProgressEvent::FileFailed { session_id, error });
        }
    }

    fn set_phase(&self, phase: IndexPhase) {
        self.update_session(|s| s.phase = phase);
        self.emit_phase();
    }

    /// Move the phase forward only. Workers report steps out of order.
    fn advance_phase(&self, phase: IndexPhase) {
        if self.update_session(|s| s.phase < phase) == Some(true) {
            self.set_phase(phase);
        }
    }

    fn emit_phase(&self) {
        let event = self.update_session(|s| ProgressEvent::PhaseChanged {
            session_id: s.id,
            phase: s.phase,
            processed: s.processed_files,
            total: s.total_files,
        });
        if let Some(event) = event {
            tracing::debug!(?event, "phase changed");
            self.emit(event);
        }
    }

    fn set_status(&self, status: IndexStatus) {
        self.update_session(|s| s.status = status);
        self.status.send_replace(status);
        self.emit(ProgressEvent::StatusChanged { status });
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn update_session<R>(&self, f: impl FnOnce(&mut IndexingSession) -> R) -> Option<R> {
        self.lock_session().as_mut().map(f)
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<IndexingSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn abort_workers(&self) {
        for handle in self.lock_workers().drain(..) {
            handle.abort();
        }
    }

    fn ensure_no_session(&self) -> Result<()> {
        if self.status.borrow().is_active() {
            return Err(IndexError::SessionActive);
        }
        Ok(())
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn relative(&self, path: &Path) -> Result<String> {
        relative_path(&self.root, &self.absolute(path)).ok_or_else(|| {
            IndexError::InvalidArgument(format!(
                "{} is outside the workspace {}",
                path.display(),
                self.root.display()
            ))
        })
    }
}

/// Wait while paused. Fails once the session is cancelled.
async fn checkpoint(control: &mut watch::Receiver<RunControl>) -> Result<()> {
    loop {
        let state = *control.borrow_and_update();
        match state {
            RunControl::Running => return Ok(()),
            RunControl::Cancelled => return Err(IndexError::Cancelled),
            RunControl::Paused => {}
        }
        if control.changed().await.is_err() {
            return Err(IndexError::Cancelled);
        }
    }
}

fn pool_exited(control: &watch::Receiver<RunControl>) -> IndexError {
    if *control.borrow() == RunControl::Cancelled {
        IndexError::Cancelled
    } else {
        IndexError::Other("worker pool exited unexpectedly".into())
    }
}

impl<P: LlmProvider + 'static> ChangeTarget for IndexOrchestrator<P> {
    fn reindex<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.update_file_in_index(path).await.map(|_| ()) })
    }

    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.remove_file_from_index(path))
    }

    fn status(&self) -> watch::Receiver<IndexStatus> {
        self.status_receiver()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_llm::mock::MockProvider;
    use quarry_vector::{InMemoryVectorStore, VectorClientConfig};
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<VectorStoreClient>,
        provider: MockProvider,
    }

    impl Fixture {
        fn new(provider: MockProvider) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = VectorStoreClient::new(
                Arc::new(InMemoryVectorStore::new()),
                VectorClientConfig::default(),
            )
            .unwrap();
            Self {
                dir,
                store: Arc::new(store),
                provider,
            }
        }

        fn write(&self, rel: &str, content: &str) {
            let path = self.dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }

        async fn orchestrator(&self, config: IndexerConfig) -> Arc<IndexOrchestrator<MockProvider>> {
            let metadata = MetadataStore::in_memory().await.unwrap();
            Arc::new(IndexOrchestrator::new(
                self.dir.path(),
                Arc::new(self.provider.clone()),
                Arc::clone(&self.store),
                metadata,
                config,
            ))
        }

        async fn points(&self) -> u64 {
            self.store.count(self.store.collection(), None).await.unwrap()
        }
    }

    fn single_worker() -> IndexerConfig {
        IndexerConfig {
            workers: Some(1),
            ..IndexerConfig::default()
        }
    }

    fn write_sources(f: &Fixture, n: usize) {
        for i in 0..n {
            f.write(
                &format!("src/mod{i}.py"),
                &format!("def handler_{i}(event):\n    return event + {i}\n"),
            );
        }
    }

    #[tokio::test]
    async fn full_run_stores_one_point_per_chunk() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 3);
        f.write("README.md", "# Title\n\nSome words about the project.\n");
        let orch = f.orchestrator(IndexerConfig::default()).await;

        let report = orch.start_indexing().await.unwrap();
        assert!(report.success);
        assert_eq!(report.total_files, 4);
        assert_eq!(report.processed_files, 4);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(f.points().await, report.stats.total_chunks as u64);
        assert_eq!(report.stats.total_embeddings, report.stats.total_chunks);
        assert_eq!(report.stats.files_by_language["python"], 3);
        assert_eq!(orch.get_status().status, IndexStatus::Idle);
    }

    #[tokio::test]
    async fn second_run_is_idempotent_and_skips_unchanged() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 3);
        let orch = f.orchestrator(IndexerConfig::default()).await;

        let first = orch.start_indexing().await.unwrap();
        let points = f.points().await;
        let second = orch.start_indexing().await.unwrap();
        assert_eq!(second.stats.files_unchanged, 3);
        assert_eq!(f.points().await, points);
        assert_eq!(first.stats.total_chunks, points as usize);
    }

    #[tokio::test]
    async fn deleted_files_are_pruned_on_next_run() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 2);
        let orch = f.orchestrator(IndexerConfig::default()).await;
        orch.start_indexing().await.unwrap();

        std::fs::remove_file(f.dir.path().join("src/mod0.py")).unwrap();
        let report = orch.start_indexing().await.unwrap();
        assert_eq!(report.stats.files_removed, 1);
        let remaining = f
            .store
            .count(
                f.store.collection(),
                Some(VectorFilter::must(
                    fields::FILE_PATH,
                    FieldValue::Text("src/mod0.py".into()),
                )),
            )
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn second_start_while_running_is_rejected() {
        let f = Fixture::new(MockProvider::default().with_delay(100));
        write_sources(&f, 3);
        let orch = f.orchestrator(single_worker()).await;
        let mut status = orch.status_receiver();

        let running = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.start_indexing().await }
        });
        status.wait_for(|s| *s == IndexStatus::Indexing).await.unwrap();
        assert!(matches!(
            orch.start_indexing().await,
            Err(IndexError::AlreadyRunning)
        ));
        assert!(running.await.unwrap().unwrap().success);
    }

    #[tokio::test]
    async fn pause_then_resume_processes_every_file_once() {
        let f = Fixture::new(MockProvider::default().with_delay(50));
        write_sources(&f, 4);
        let orch = f.orchestrator(single_worker()).await;
        let mut events = orch.subscribe();
        let mut status = orch.status_receiver();

        let running = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.start_indexing().await }
        });
        status.wait_for(|s| *s == IndexStatus::Indexing).await.unwrap();
        orch.pause().unwrap();
        assert_eq!(orch.get_status().status, IndexStatus::Paused);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(orch.get_status().processed_files <= 1);
        orch.resume().unwrap();

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.processed_files, 4);

        let mut completed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ProgressEvent::FileCompleted { file, .. } = event {
                completed.push(file);
            }
        }
        completed.sort();
        completed.dedup();
        assert_eq!(completed.len(), 4);
    }

    #[tokio::test]
    async fn stop_is_resumable() {
        let f = Fixture::new(MockProvider::default().with_delay(50));
        write_sources(&f, 2);
        let orch = f.orchestrator(single_worker()).await;
        let mut status = orch.status_receiver();
        let running = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.start_indexing().await }
        });
        status.wait_for(|s| *s == IndexStatus::Indexing).await.unwrap();
        orch.stop().unwrap();
        assert_eq!(*orch.status_receiver().borrow(), IndexStatus::Paused);
        orch.resume().unwrap();
        assert_eq!(running.await.unwrap().unwrap().processed_files, 2);
    }

    #[tokio::test]
    async fn cancel_discards_session() {
        let f = Fixture::new(MockProvider::default().with_delay(100));
        write_sources(&f, 4);
        let orch = f.orchestrator(single_worker()).await;
        let mut status = orch.status_receiver();
        let running = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.start_indexing().await }
        });
        status.wait_for(|s| *s == IndexStatus::Indexing).await.unwrap();
        orch.cancel().unwrap();

        assert!(matches!(running.await.unwrap(), Err(IndexError::Cancelled)));
        assert_eq!(orch.get_status().status, IndexStatus::Idle);
        assert_eq!(f.points().await, 0);
    }

    #[tokio::test]
    async fn control_without_session_is_rejected() {
        let f = Fixture::new(MockProvider::default());
        let orch = f.orchestrator(IndexerConfig::default()).await;
        assert!(matches!(orch.pause(), Err(IndexError::NotRunning)));
        assert!(matches!(orch.resume(), Err(IndexError::NotRunning)));
        assert!(matches!(orch.cancel(), Err(IndexError::NotRunning)));
    }

    struct BatchFails;

    impl LlmProvider for BatchFails {
        fn name(&self) -> &'static str {
            "batch-fails"
        }

        async fn chat(&self, _messages: &[quarry_llm::provider::Message]) -> std::result::Result<String, quarry_llm::LlmError> {
            Ok(String::new())
        }

        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, quarry_llm::LlmError> {
            Ok(vec![0.5; 4])
        }

        async fn embed_batch(
            &self,
            _texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, quarry_llm::LlmError> {
            Err(quarry_llm::LlmError::Unavailable)
        }

        fn supports_embeddings(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn embedding_failures_are_per_file() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 2);
        let orch = IndexOrchestrator::new(
            f.dir.path(),
            Arc::new(BatchFails),
            Arc::clone(&f.store),
            MetadataStore::in_memory().await.unwrap(),
            IndexerConfig::default(),
        );
        let report = orch.start_indexing().await.unwrap();
        assert!(report.success);
        assert_eq!(report.processed_files, 2);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().all(|e| e.stage == FileStage::Embed));
        assert_eq!(f.points().await, 0);
    }

    #[tokio::test]
    async fn unreachable_embedder_is_fatal_for_the_session() {
        let f = Fixture::new(MockProvider::failing());
        write_sources(&f, 2);
        let orch = f.orchestrator(IndexerConfig::default()).await;
        assert!(matches!(
            orch.start_indexing().await,
            Err(IndexError::Llm(_))
        ));
        assert_eq!(orch.get_status().status, IndexStatus::Error);

        // The error state does not block a new session.
        assert!(matches!(
            orch.start_indexing().await,
            Err(IndexError::Llm(_))
        ));
    }

    #[tokio::test]
    async fn separate_embedding_phase() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 3);
        let config = IndexerConfig {
            embed_in_workers: false,
            embedding_batch_size: 1,
            ..IndexerConfig::default()
        };
        let orch = f.orchestrator(config).await;
        let report = orch.start_indexing().await.unwrap();
        assert_eq!(f.points().await, report.stats.total_chunks as u64);
        // probe + one call per chunk
        assert_eq!(f.provider.embed_calls(), 1 + report.stats.total_chunks);
    }

    #[tokio::test]
    async fn update_and_remove_single_file() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 1);
        let orch = f.orchestrator(IndexerConfig::default()).await;
        orch.start_indexing().await.unwrap();
        let before = f.points().await;

        f.write("src/extra.rs", "pub fn extra() -> u8 {\n    7\n}\n");
        let chunks = orch
            .update_file_in_index(Path::new("src/extra.rs"))
            .await
            .unwrap();
        assert!(chunks > 0);
        assert_eq!(f.points().await, before + chunks as u64);

        // Unchanged content reports the stored count without re-embedding.
        let calls = f.provider.embed_calls();
        let again = orch
            .update_file_in_index(&f.dir.path().join("src/extra.rs"))
            .await
            .unwrap();
        assert_eq!(again, chunks);
        assert_eq!(f.provider.embed_calls(), calls);

        orch.remove_file_from_index(Path::new("src/extra.rs"))
            .await
            .unwrap();
        assert_eq!(f.points().await, before);
    }

    #[tokio::test]
    async fn shrinking_file_prunes_stale_chunks() {
        let f = Fixture::new(MockProvider::default());
        let body: String = (0..40)
            .map(|i| format!("def function_number_{i}(value):\n    total = value * {i}\n    return total + {i}\n\n"))
            .collect();
        f.write("big.py", &body);
        let orch = f.orchestrator(IndexerConfig::default()).await;
        orch.start_indexing().await.unwrap();
        let before = f.points().await;
        assert!(before > 1);

        f.write("big.py", "def only():\n    return 1\n");
        let chunks = orch.update_file_in_index(Path::new("big.py")).await.unwrap();
        assert_eq!(f.points().await, chunks as u64);
    }

    #[tokio::test]
    async fn targeted_update_of_missing_file_removes_it() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 1);
        let orch = f.orchestrator(IndexerConfig::default()).await;
        orch.start_indexing().await.unwrap();
        std::fs::remove_file(f.dir.path().join("src/mod0.py")).unwrap();
        let chunks = orch
            .update_file_in_index(Path::new("src/mod0.py"))
            .await
            .unwrap();
        assert_eq!(chunks, 0);
        assert_eq!(f.points().await, 0);
    }

    #[tokio::test]
    async fn dropped_collection_is_rebuilt_on_next_run() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 2);
        let orch = f.orchestrator(IndexerConfig::default()).await;
        orch.start_indexing().await.unwrap();
        let indexed = f.points().await;
        assert!(indexed > 0);

        f.store.delete_collection(f.store.collection()).await.unwrap();
        let report = orch.start_indexing().await.unwrap();

        assert_eq!(report.stats.files_unchanged, 0);
        assert_eq!(f.points().await, indexed);
    }

    #[tokio::test]
    async fn embedder_change_reembeds_and_drops_old_points() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 2);
        let metadata = MetadataStore::in_memory().await.unwrap();
        let first = IndexOrchestrator::new(
            f.dir.path(),
            Arc::new(MockProvider::default().with_embedding_model("model-a")),
            Arc::clone(&f.store),
            metadata.clone(),
            IndexerConfig::default(),
        );
        first.start_indexing().await.unwrap();
        let per_file = f.points().await / 2;

        std::fs::remove_file(f.dir.path().join("src/mod1.py")).unwrap();
        let second_provider = MockProvider::default().with_embedding_model("model-b");
        let second = IndexOrchestrator::new(
            f.dir.path(),
            Arc::new(second_provider.clone()),
            Arc::clone(&f.store),
            metadata.clone(),
            IndexerConfig::default(),
        );
        let report = second.start_indexing().await.unwrap();

        assert_eq!(report.stats.files_unchanged, 0);
        assert_eq!(report.processed_files, 1);
        assert_eq!(f.points().await, per_file);
        assert_eq!(metadata.indexed_paths().await.unwrap(), vec!["src/mod0.py"]);
        assert_eq!(
            metadata.state(EMBEDDER_STATE_KEY).await.unwrap().as_deref(),
            Some("mock:model-b:8")
        );
    }

    #[tokio::test]
    async fn same_embedder_keeps_collection() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 1);
        let orch = f.orchestrator(IndexerConfig::default()).await;
        orch.start_indexing().await.unwrap();
        let report = orch.start_indexing().await.unwrap();
        assert_eq!(report.stats.files_unchanged, 1);
        assert!(f.points().await > 0);
    }

    #[tokio::test]
    async fn removing_directory_removes_files_below_it() {
        let f = Fixture::new(MockProvider::default());
        f.write("pkg/parser.py", "def parse(raw):\n    return raw.split()\n");
        f.write("pkg/render.py", "def render(widget):\n    return str(widget)\n");
        f.write("pkgs.py", "def unrelated():\n    return 0\n");
        let orch = f.orchestrator(IndexerConfig::default()).await;
        orch.start_indexing().await.unwrap();
        let count_for = |path: &'static str| {
            let store = Arc::clone(&f.store);
            async move {
                store
                    .count(
                        store.collection(),
                        Some(VectorFilter::must(fields::FILE_PATH, FieldValue::Text(path.into()))),
                    )
                    .await
                    .unwrap()
            }
        };
        let kept = count_for("pkgs.py").await;
        assert!(kept > 0);

        std::fs::rename(f.dir.path().join("pkg"), f.dir.path().join("moved")).unwrap();
        orch.remove_file_from_index(&f.dir.path().join("pkg"))
            .await
            .unwrap();

        assert_eq!(count_for("pkg/parser.py").await, 0);
        assert_eq!(count_for("pkg/render.py").await, 0);
        assert_eq!(count_for("pkgs.py").await, kept);
        assert_eq!(orch.metadata.indexed_paths().await.unwrap(), vec!["pkgs.py"]);
    }

    #[tokio::test]
    async fn update_of_vanished_directory_removes_its_files() {
        let f = Fixture::new(MockProvider::default());
        f.write("pkg/a.py", "def a():\n    return 1\n");
        let orch = f.orchestrator(IndexerConfig::default()).await;
        orch.start_indexing().await.unwrap();
        std::fs::remove_dir_all(f.dir.path().join("pkg")).unwrap();

        let chunks = orch.update_file_in_index(Path::new("pkg")).await.unwrap();
        assert_eq!(chunks, 0);
        assert_eq!(f.points().await, 0);
    }

    #[tokio::test]
    async fn targeted_ops_rejected_during_session() {
        let f = Fixture::new(MockProvider::default().with_delay(100));
        write_sources(&f, 2);
        let orch = f.orchestrator(single_worker()).await;
        let mut status = orch.status_receiver();
        let running = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.start_indexing().await }
        });
        status.wait_for(|s| *s == IndexStatus::Indexing).await.unwrap();
        assert!(matches!(
            orch.update_file_in_index(Path::new("src/mod0.py")).await,
            Err(IndexError::SessionActive)
        ));
        assert!(matches!(orch.clear_index().await, Err(IndexError::SessionActive)));
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn outside_path_is_invalid() {
        let f = Fixture::new(MockProvider::default());
        let orch = f.orchestrator(IndexerConfig::default()).await;
        assert!(matches!(
            orch.remove_file_from_index(Path::new("/definitely/elsewhere.rs"))
                .await,
            Err(IndexError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn clear_index_empties_collection() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 2);
        let orch = f.orchestrator(IndexerConfig::default()).await;
        orch.start_indexing().await.unwrap();
        assert!(f.points().await > 0);

        orch.clear_index().await.unwrap();
        assert_eq!(f.points().await, 0);
        let info = orch.collection_info().await.unwrap().unwrap();
        assert_eq!(info.vector_size, Some(8));

        // Metadata was cleared too, so the next run re-embeds everything.
        let report = orch.start_indexing().await.unwrap();
        assert_eq!(report.stats.files_unchanged, 0);
    }

    async fn reported_phases(config: IndexerConfig) -> Vec<IndexPhase> {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 3);
        let orch = f.orchestrator(config).await;
        let mut events = orch.subscribe();
        orch.start_indexing().await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ProgressEvent::PhaseChanged { phase, .. } = event {
                phases.push(phase);
            }
        }
        phases
    }

    #[tokio::test]
    async fn phases_are_reported_in_order() {
        let all = vec![
            IndexPhase::Discovering,
            IndexPhase::Parsing,
            IndexPhase::Chunking,
            IndexPhase::Embedding,
            IndexPhase::Storing,
            IndexPhase::Complete,
        ];
        assert_eq!(reported_phases(IndexerConfig::default()).await, all);

        let separate = IndexerConfig {
            embed_in_workers: false,
            ..IndexerConfig::default()
        };
        assert_eq!(reported_phases(separate).await, all);
    }

    #[tokio::test]
    async fn unchanged_run_skips_worker_phases() {
        let f = Fixture::new(MockProvider::default());
        write_sources(&f, 2);
        let orch = f.orchestrator(IndexerConfig::default()).await;
        orch.start_indexing().await.unwrap();

        let mut events = orch.subscribe();
        orch.start_indexing().await.unwrap();
        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ProgressEvent::PhaseChanged { phase, .. } = event {
                phases.push(phase);
            }
        }
        assert!(!phases.contains(&IndexPhase::Chunking));
        assert!(!phases.contains(&IndexPhase::Embedding));
        assert_eq!(phases.last(), Some(&IndexPhase::Complete));
    }
}
