//! File change monitor: debounces file system events and turns them into
//! targeted re-index or remove operations.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{IndexerConfig, WatchConfig};
use crate::discovery::PathFilter;
use crate::error::{IndexError, Result};
use crate::session::IndexStatus;

/// What the monitor drives. Implemented by the orchestrator.
pub trait ChangeTarget: Send + Sync {
    fn reindex<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>>;

    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>>;

    /// Events are held back while this reports an active session.
    fn status(&self) -> watch::Receiver<IndexStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Passed to handlers after an operation ran.
#[derive(Debug, Clone)]
pub struct ChangeOutcome {
    pub event: ChangeEvent,
    pub error: Option<String>,
}

pub type ChangeHandler = Box<dyn Fn(&ChangeOutcome) + Send + Sync>;

type Handlers = Arc<Mutex<Vec<ChangeHandler>>>;

struct Running {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

pub struct FileChangeMonitor {
    root: PathBuf,
    target: Arc<dyn ChangeTarget>,
    filter: Arc<PathFilter>,
    debounce: Duration,
    handlers: Handlers,
    running: Option<Running>,
}

impl FileChangeMonitor {
    /// # Errors
    ///
    /// Returns an error if an include or exclude glob is invalid.
    pub fn new(
        root: &Path,
        target: Arc<dyn ChangeTarget>,
        index_config: &IndexerConfig,
        watch_config: &WatchConfig,
    ) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            target,
            filter: Arc::new(PathFilter::new(root, index_config)?),
            debounce: Duration::from_millis(watch_config.debounce_ms),
            handlers: Arc::new(Mutex::new(Vec::new())),
            running: None,
        })
    }

    /// Register a callback invoked after every re-index or remove.
    pub fn on_change(&self, handler: impl Fn(&ChangeOutcome) + Send + Sync + 'static) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start watching the workspace recursively. No-op if already running.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be initialized.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let filter = Arc::clone(&self.filter);
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for change in classify(&event) {
                        if filter.accepts(&change.path) && tx.send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!("file watcher error: {e}"),
            })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;

        let task = tokio::spawn(run_events(
            rx,
            Arc::clone(&self.target),
            Arc::clone(&self.handlers),
            self.debounce,
        ));
        self.running = Some(Running {
            _watcher: watcher,
            task,
        });
        tracing::info!(root = %self.root.display(), "file change monitor started");
        Ok(())
    }

    /// Stop watching. Pending and deferred events are dropped.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
            tracing::info!("file change monitor stopped");
        }
    }
}

impl Drop for FileChangeMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map a raw notify event to changes. Renames become a delete of the old
/// path and a create of the new one.
fn classify(event: &notify::Event) -> Vec<ChangeEvent> {
    let change = |path: &PathBuf, kind| ChangeEvent {
        path: path.clone(),
        kind,
    };
    let upsert = |path: &PathBuf| {
        (!path.is_dir()).then(|| {
            let kind = if path.exists() {
                ChangeKind::Modified
            } else {
                ChangeKind::Deleted
            };
            change(path, kind)
        })
    };

    match event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter(|p| !p.is_dir())
            .map(|p| change(p, ChangeKind::Created))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| change(p, ChangeKind::Deleted))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| change(p, ChangeKind::Deleted))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .filter(|p| !p.is_dir())
            .map(|p| change(p, ChangeKind::Created))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::with_capacity(2);
            if let Some(from) = event.paths.first() {
                changes.push(change(from, ChangeKind::Deleted));
            }
            if let Some(to) = event.paths.get(1).filter(|p| !p.is_dir()) {
                changes.push(change(to, ChangeKind::Created));
            }
            changes
        }
        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) | EventKind::Other => {
            Vec::new()
        }
        EventKind::Modify(_) | EventKind::Any => event.paths.iter().filter_map(upsert).collect(),
    }
}

/// Debounce, defer and execute changes until the channel closes.
///
/// Create/modify events for a path collapse into one operation fired
/// `debounce` after the last event; deletes run at once and cancel any
/// pending operation for the path. While the target reports an active
/// session, operations queue up and replay when it ends.
pub(crate) async fn run_events(
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    target: Arc<dyn ChangeTarget>,
    handlers: Handlers,
    debounce: Duration,
) {
    let mut status = target.status();
    let mut status_open = true;
    let mut pending: HashMap<PathBuf, (ChangeKind, Instant)> = HashMap::new();
    let mut deferred: VecDeque<ChangeEvent> = VecDeque::new();
    let exec = Executor {
        target: target.as_ref(),
        handlers: &handlers,
    };

    loop {
        let next_deadline = pending.values().map(|(_, at)| *at).min();
        let timer = async {
            match next_deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event.kind {
                    ChangeKind::Deleted => {
                        pending.remove(&event.path);
                        exec.submit(event, &status, &mut deferred).await;
                    }
                    ChangeKind::Created | ChangeKind::Modified => {
                        pending.insert(event.path, (event.kind, Instant::now() + debounce));
                    }
                }
            }
            () = timer => {
                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, (_, at))| *at <= now)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in due {
                    if let Some((kind, _)) = pending.remove(&path) {
                        exec.submit(ChangeEvent { path, kind }, &status, &mut deferred).await;
                    }
                }
            }
            changed = status.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                    continue;
                }
                while !status.borrow_and_update().is_active() {
                    let Some(event) = deferred.pop_front() else { break };
                    if let Some(event) = exec.run(event).await {
                        deferred.push_front(event);
                        break;
                    }
                }
            }
        }
    }
}

struct Executor<'a> {
    target: &'a dyn ChangeTarget,
    handlers: &'a Handlers,
}

impl Executor<'_> {
    async fn submit(
        &self,
        event: ChangeEvent,
        status: &watch::Receiver<IndexStatus>,
        deferred: &mut VecDeque<ChangeEvent>,
    ) {
        let event = if status.borrow().is_active() {
            event
        } else {
            match self.run(event).await {
                Some(event) => event,
                None => return,
            }
        };
        tracing::debug!(path = %event.path.display(), "session active, deferring change");
        deferred.retain(|e| e.path != event.path);
        deferred.push_back(event);
    }

    /// Apply one change. A session can start between the status check and
    /// the call; the event is then handed back for deferral.
    async fn run(&self, event: ChangeEvent) -> Option<ChangeEvent> {
        let result = match event.kind {
            ChangeKind::Deleted => self.target.remove(&event.path).await,
            ChangeKind::Created | ChangeKind::Modified => self.target.reindex(&event.path).await,
        };
        let error = match result {
            Ok(()) => None,
            Err(IndexError::SessionActive) => return Some(event),
            Err(e) => {
                tracing::warn!(path = %event.path.display(), "change handling failed: {e}");
                Some(e.to_string())
            }
        };
        let outcome = ChangeOutcome { event, error };
        for handler in self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            handler(&outcome);
        }
        None
    }
}
