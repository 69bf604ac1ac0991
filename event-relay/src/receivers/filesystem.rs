//! Local folder receiver.
//!
//! The OS watcher callback translates each raw event into a filesystem envelope and
//! hands it to a [`DeliveryQueue`]; actions run on the queue's worker, never on the
//! watcher thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Lifecycle, Receiver, ReceiverKind, ReceiverState};
use crate::envelope::{ChangeType, Envelope, FileMetadata, relative_file_path};
use crate::pipeline::{ActionChain, DeliveryQueue, DeliverySender};
use crate::utils::fs::ensure_dir_all_sync_with_op;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSystemReceiverConfig {
    pub name: String,
    #[serde(default)]
    pub allowed_event_types: Vec<String>,
    #[serde(default, skip_serializing)]
    pub actions: Vec<Value>,
    pub path_to_watch: PathBuf,
    #[serde(default)]
    pub include_sub_directories: bool,
    /// Glob patterns matched against the file name. Empty matches everything.
    #[serde(default)]
    pub filters: Vec<String>,
}

fn build_filters(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::config(format!("invalid filter '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| Error::config(format!("invalid filters: {e}")))
}

/// How long the source half of a rename waits for its target before it is reported
/// as a deletion.
const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(200);

/// A raw event reduced to the change it describes.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Change {
    change_type: ChangeType,
    path: PathBuf,
    old_path: Option<PathBuf>,
}

impl Change {
    fn new(change_type: ChangeType, path: &Path) -> Self {
        Self {
            change_type,
            path: path.to_path_buf(),
            old_path: None,
        }
    }

    fn renamed(from: &Path, to: &Path) -> Self {
        Self {
            change_type: ChangeType::Renamed,
            path: to.to_path_buf(),
            old_path: Some(from.to_path_buf()),
        }
    }
}

/// Map a non-rename watcher event to a change. Directory and access events yield
/// nothing.
fn classify(event: &notify::Event) -> Option<Change> {
    let path = event.paths.first()?;
    match event.kind {
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => None,
        EventKind::Create(_) => Some(Change::new(ChangeType::Created, path)),
        EventKind::Remove(_) => Some(Change::new(ChangeType::Deleted, path)),
        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
            Some(Change::new(ChangeType::Changed, path))
        }
        _ => None,
    }
}

/// Source half of a rename that has not met its target yet.
#[derive(Debug)]
struct PendingMove {
    tracker: Option<usize>,
    path: PathBuf,
    seen_at: Instant,
}

/// Pairs the halves of renames.
///
/// The watcher reports a rename as a source event and a target event. A move out
/// of the watched tree only has the source, a move in only has the target. Some
/// backends follow a matched pair with a combined event carrying both paths.
#[derive(Debug, Default)]
struct RenamePairer {
    pending: Option<PendingMove>,
    last_paired: Option<usize>,
}

impl RenamePairer {
    fn take_stale(&mut self, now: Instant) -> Option<Change> {
        let stale = self
            .pending
            .as_ref()
            .is_some_and(|p| now.duration_since(p.seen_at) >= RENAME_PAIR_WINDOW);
        if stale {
            self.take_pending()
        } else {
            None
        }
    }

    fn take_pending(&mut self) -> Option<Change> {
        self.pending
            .take()
            .map(|p| Change::new(ChangeType::Deleted, &p.path))
    }

    fn observe(&mut self, event: &notify::Event, now: Instant) -> Vec<Change> {
        let mut changes: Vec<Change> = self.take_stale(now).into_iter().collect();
        let tracker = event.tracker();

        match (event.kind, event.paths.as_slice()) {
            (EventKind::Modify(ModifyKind::Name(RenameMode::From)), [path]) => {
                changes.extend(self.take_pending());
                self.pending = Some(PendingMove {
                    tracker,
                    path: path.clone(),
                    seen_at: now,
                });
            }
            (EventKind::Modify(ModifyKind::Name(RenameMode::To)), [path]) => {
                match self.pending.take() {
                    Some(from) if from.tracker == tracker => {
                        self.last_paired = tracker;
                        changes.push(Change::renamed(&from.path, path));
                    }
                    other => {
                        self.pending = other;
                        changes.push(Change::new(ChangeType::Created, path));
                    }
                }
            }
            (EventKind::Modify(ModifyKind::Name(RenameMode::Both)), [from, to]) => {
                if tracker.is_none() || tracker != self.last_paired {
                    changes.push(Change::renamed(from, to));
                }
            }
            (EventKind::Modify(ModifyKind::Name(_)), [path]) => {
                let change_type = if path.exists() {
                    ChangeType::Created
                } else {
                    ChangeType::Deleted
                };
                changes.push(Change::new(change_type, path));
            }
            (EventKind::Modify(ModifyKind::Name(_)), _) => {}
            _ => changes.extend(classify(event)),
        }
        changes
    }
}

fn lossy(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Turns watcher events into filesystem envelopes for one receiver.
struct Translator {
    config: FileSystemReceiverConfig,
    root: PathBuf,
    filters: Option<GlobSet>,
    renames: Mutex<RenamePairer>,
}

impl Translator {
    fn new(config: FileSystemReceiverConfig, filters: Option<GlobSet>) -> Self {
        let root = config.path_to_watch.clone();
        Self {
            config,
            root,
            filters,
            renames: Mutex::new(RenamePairer::default()),
        }
    }

    /// Resolve the root the watcher reports paths against.
    fn with_root(mut self, root: PathBuf) -> Self {
        self.root = root;
        self
    }

    fn matches(&self, path: &Path) -> bool {
        match &self.filters {
            None => true,
            Some(filters) => path.file_name().is_some_and(|name| filters.is_match(name)),
        }
    }

    fn translate(&self, event: &notify::Event) -> Vec<(ChangeType, FileMetadata)> {
        let changes = self.renames.lock().observe(event, Instant::now());
        changes
            .into_iter()
            .filter_map(|change| self.describe(change))
            .collect()
    }

    fn describe(&self, change: Change) -> Option<(ChangeType, FileMetadata)> {
        if change.change_type != ChangeType::Deleted && change.path.is_dir() {
            return None;
        }
        if !self.matches(&change.path) {
            return None;
        }
        let relative = relative_file_path(&self.root, &change.path)?;

        let metadata = FileMetadata {
            name: self.config.name.clone(),
            file_name: change
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            directory_name: change.path.parent().map(lossy).unwrap_or_default(),
            full_file_path: lossy(&change.path),
            relative_file_path: relative,
            content_length: std::fs::metadata(&change.path).ok().map(|m| m.len()),
            path_to_watch: lossy(&self.config.path_to_watch),
            include_sub_directories: self.config.include_sub_directories,
            filters: self.config.filters.clone(),
            allowed_event_types: self.config.allowed_event_types.clone(),
            correlation_id: Uuid::new_v4(),
            old_name: change
                .old_path
                .as_deref()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned()),
            old_full_path: change.old_path.as_deref().map(lossy),
        };
        Some((change.change_type, metadata))
    }

    /// Watcher callback body. Runs on the watcher thread and never blocks.
    fn dispatch(&self, result: notify::Result<notify::Event>, sender: &DeliverySender) {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                error!(
                    receiver = %self.config.name,
                    path = %self.config.path_to_watch.display(),
                    error = %e,
                    "File watcher error"
                );
                return;
            }
        };

        for (change_type, metadata) in self.translate(&event) {
            self.deliver(change_type, &metadata, sender);
        }
    }

    /// Report a rename source whose target never showed up as a deletion.
    fn flush_moves(&self, now: Instant, sender: &DeliverySender) {
        let stale = self.renames.lock().take_stale(now);
        if let Some((change_type, metadata)) = stale.and_then(|change| self.describe(change)) {
            self.deliver(change_type, &metadata, sender);
        }
    }

    fn deliver(&self, change_type: ChangeType, metadata: &FileMetadata, sender: &DeliverySender) {
        match Envelope::file_system(change_type, metadata) {
            Ok(envelope) => {
                debug!(
                    receiver = %self.config.name,
                    change = %change_type,
                    path = %metadata.full_file_path,
                    correlation_id = %metadata.correlation_id,
                    "File change observed"
                );
                if !sender.enqueue(envelope) {
                    warn!(
                        receiver = %self.config.name,
                        path = %metadata.full_file_path,
                        "Delivery queue is shutting down, change dropped"
                    );
                }
            }
            Err(e) => {
                error!(receiver = %self.config.name, error = %e, "Failed to build envelope");
            }
        }
    }
}

/// Periodically report unmatched rename sources. Flushes whatever is pending on stop.
async fn flush_pending_moves(translator: Arc<Translator>, sender: DeliverySender, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(RENAME_PAIR_WINDOW);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                translator.flush_moves(Instant::now() + RENAME_PAIR_WINDOW, &sender);
                break;
            }
            _ = ticker.tick() => translator.flush_moves(Instant::now(), &sender),
        }
    }
}

struct Running {
    /// Dropping the watcher unregisters it.
    watcher: RecommendedWatcher,
    queue: DeliveryQueue,
    flusher: JoinHandle<()>,
    flusher_stop: CancellationToken,
}

pub struct FileSystemReceiver {
    config: FileSystemReceiverConfig,
    filters: Option<GlobSet>,
    chain: Arc<ActionChain>,
    action_cancel: CancellationToken,
    lifecycle: Lifecycle,
    running: Mutex<Option<Running>>,
}

impl FileSystemReceiver {
    /// Validate the filters. The folder is only touched on `start`.
    pub fn new(
        config: FileSystemReceiverConfig,
        chain: Arc<ActionChain>,
        action_cancel: CancellationToken,
    ) -> Result<Self> {
        let filters = build_filters(&config.filters)?;
        Ok(Self {
            config,
            filters,
            chain,
            action_cancel,
            lifecycle: Lifecycle::new(),
            running: Mutex::new(None),
        })
    }

    fn watch(&self) -> Result<Running> {
        let path = &self.config.path_to_watch;
        ensure_dir_all_sync_with_op("creating watch directory", path)?;
        let root = path
            .canonicalize()
            .map_err(|e| Error::io_path("resolving watch directory", path, e))?;

        let queue = DeliveryQueue::start(self.chain.clone(), self.action_cancel.clone());
        let sender = queue.sender();
        let translator =
            Arc::new(Translator::new(self.config.clone(), self.filters.clone()).with_root(root.clone()));

        let callback_translator = translator.clone();
        let callback_sender = sender.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            callback_translator.dispatch(result, &callback_sender)
        })
            .map_err(|e| Error::transport(format!("creating watcher: {e}")))?;
        let mode = if self.config.include_sub_directories {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&root, mode)
            .map_err(|e| Error::transport(format!("watching {}: {e}", root.display())))?;

        let flusher_stop = CancellationToken::new();
        let flusher = tokio::spawn(flush_pending_moves(translator, sender, flusher_stop.clone()));

        Ok(Running {
            watcher,
            queue,
            flusher,
            flusher_stop,
        })
    }
}

#[async_trait]
impl Receiver for FileSystemReceiver {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ReceiverKind {
        ReceiverKind::FileSystem
    }

    fn state(&self) -> ReceiverState {
        self.lifecycle.state()
    }

    async fn start(&self) -> Result<()> {
        self.lifecycle.start()?;

        let running = match self.watch() {
            Ok(running) => running,
            Err(e) => {
                self.lifecycle.stop();
                return Err(e);
            }
        };
        *self.running.lock() = Some(running);

        info!(
            receiver = %self.config.name,
            path = %self.config.path_to_watch.display(),
            include_sub_directories = self.config.include_sub_directories,
            filters = ?self.config.filters,
            "File system receiver started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.lifecycle.stop() {
            return Ok(());
        }

        let running = self.running.lock().take();
        if let Some(Running {
            watcher,
            queue,
            flusher,
            flusher_stop,
        }) = running
        {
            drop(watcher);
            flusher_stop.cancel();
            if let Err(e) = flusher.await {
                error!(receiver = %self.config.name, error = %e, "Rename flusher panicked");
            }
            let abandoned = queue.shutdown().await;
            info!(receiver = %self.config.name, abandoned, "File system receiver stopped");
        }
        Ok(())
    }
}
