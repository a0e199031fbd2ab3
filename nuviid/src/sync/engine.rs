use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use nuvii_filter::{FilterError, PlaceholderStore};

use super::backoff::RetryDelays;
use super::events::{ActivityKind, EngineStatus, SyncEvent, SyncEvents};
use super::local_events::LocalEvent;
use super::paths::{PathError, PathMap};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Create,
    Rename,
    Delete,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Pending,
    InProgress,
}

/// One debounced client→server operation, keyed by its current path.
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub id: u64,
    pub kind: OpKind,
    pub current_path: PathBuf,
    pub original_path: Option<PathBuf>,
    pub current_relative: String,
    pub original_relative: Option<String>,
    pub is_directory: bool,
    pub created_at: Instant,
    pub state: OpState,
    pub attempt: u32,
    /// Set when a rename absorbed a pending content change; the executor
    /// copies the bytes again after the move.
    pub refresh_content: bool,
    /// Renames synthesized from a Delete+Create pair report as `Moved`
    /// regardless of the parent directory.
    pub from_move_detection: bool,
}

struct Entry {
    op: PendingOp,
    timer_cancel: Option<CancellationToken>,
    queued_rename: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct DeletedRecord {
    original_path: PathBuf,
    relative: String,
    deleted_at: Instant,
    is_directory: bool,
}

#[derive(Default)]
struct EngineState {
    pending: HashMap<String, Entry>,
    deleted_recent: HashMap<String, DeletedRecord>,
    suppressed: HashMap<String, Instant>,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineParams {
    pub debounce: Duration,
    pub move_window: Duration,
    pub suppression_ttl: Duration,
    pub max_retries: u32,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(3),
            move_window: Duration::from_secs(5),
            suppression_ttl: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

/// Debounces, merges, and executes client→server operations.
///
/// Event ingestion runs a single critical section per event over the three
/// maps; execution of matured operations happens on worker tasks so a slow
/// server write never blocks the ingress path. Suppression entries are
/// written before each execution attempt and consulted by the server-side
/// applier.
pub struct ClientSyncEngine {
    paths: PathMap,
    store: Arc<PlaceholderStore>,
    params: EngineParams,
    delays: RetryDelays,
    state: Mutex<EngineState>,
    events: SyncEvents,
    last_status: Mutex<Option<EngineStatus>>,
    last_failure: Mutex<Option<Instant>>,
    in_flight: AtomicUsize,
    disposed: AtomicBool,
    next_id: AtomicU64,
}

impl ClientSyncEngine {
    pub fn new(
        paths: PathMap,
        store: Arc<PlaceholderStore>,
        events: SyncEvents,
        params: EngineParams,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths,
            store,
            params,
            delays: RetryDelays::new(Duration::from_secs(1), Duration::from_secs(64), true),
            state: Mutex::new(EngineState::default()),
            events,
            last_status: Mutex::new(None),
            last_failure: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn events(&self) -> &SyncEvents {
        &self.events
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().expect("engine state poisoned").pending.len()
    }

    /// True while an echo of our own write to `relative` may still arrive.
    /// Expired entries are evicted on the way through.
    pub fn is_suppressed(&self, relative: &str) -> bool {
        let mut state = self.state.lock().expect("engine state poisoned");
        let now = Instant::now();
        state.suppressed.retain(|_, expires| *expires > now);
        state.suppressed.contains_key(&relative.to_lowercase())
    }

    pub fn status(&self) -> EngineStatus {
        let failed = self
            .last_failure
            .lock()
            .expect("engine state poisoned")
            .map(|at| at.elapsed() < Duration::from_secs(60))
            .unwrap_or(false);
        if failed {
            EngineStatus::Degraded
        } else if self.pending_len() > 0 || self.in_flight.load(Ordering::Relaxed) > 0 {
            EngineStatus::Syncing
        } else {
            EngineStatus::Idle
        }
    }

    pub async fn ingest(self: &Arc<Self>, event: LocalEvent) {
        if self.disposed.load(Ordering::Relaxed) {
            return;
        }
        match event {
            LocalEvent::Created {
                path,
                placeholder_only,
            } => self.on_created(path, placeholder_only).await,
            LocalEvent::Renamed { old, new } => self.on_renamed(old, new).await,
            LocalEvent::Deleted { path } => self.on_deleted(path).await,
            LocalEvent::Modified { path } => self.on_modified(path).await,
        }
        self.emit_status();
    }

    async fn on_created(self: &Arc<Self>, path: PathBuf, placeholder_only: bool) {
        let Ok(relative) = self.paths.client_relative(&path) else {
            return;
        };
        let is_directory = tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);

        let mut moved_from: Option<PathBuf> = None;
        {
            let mut state = self.state.lock().expect("engine state poisoned");
            evict_stale_deletes(&mut state, self.params.move_window);

            if let Some(source) = take_move_source(&mut state, &path) {
                // A matching recent delete: this create is the tail of a
                // move. Drop the delete legs and fold into one rename.
                remove_pending_delete(&mut state, &key(&source.original_path));
                remove_pending_delete(&mut state, &key(&path));
                let op = PendingOp {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    kind: OpKind::Rename,
                    current_path: path.clone(),
                    original_path: Some(source.original_path.clone()),
                    current_relative: relative,
                    original_relative: Some(source.relative.clone()),
                    is_directory: source.is_directory,
                    created_at: Instant::now(),
                    state: OpState::Pending,
                    attempt: 0,
                    refresh_content: false,
                    from_move_detection: true,
                };
                self.schedule(&mut state, key(&path), op);
                moved_from = Some(source.original_path);
            } else if placeholder_only {
                // Materialized by the server applier, not the user.
            } else {
                let op = PendingOp {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    kind: OpKind::Create,
                    current_path: path.clone(),
                    original_path: None,
                    current_relative: relative,
                    original_relative: None,
                    is_directory,
                    created_at: Instant::now(),
                    state: OpState::Pending,
                    attempt: 0,
                    refresh_content: false,
                    from_move_detection: false,
                };
                self.schedule(&mut state, key(&path), op);
            }
        }

        if let Some(original) = moved_from {
            // The shell already moved the bytes; bring the record along so
            // the sync-arrows glyph lands on the new path. Best-effort.
            let _ = self.store.filter().rename_record(&original, &path);
            if let Err(err) = self.store.mark_not_in_sync(&path) {
                eprintln!(
                    "[nuviid] mark-not-in-sync failed for {}: {err}",
                    path.display()
                );
            }
        }
    }

    async fn on_renamed(self: &Arc<Self>, old: PathBuf, new: PathBuf) {
        let Ok(new_relative) = self.paths.client_relative(&new) else {
            return;
        };
        let old_relative = self.paths.client_relative(&old).ok();
        let is_directory = tokio::fs::metadata(&new)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);

        let mut state = self.state.lock().expect("engine state poisoned");
        let old_key = key(&old);

        if let Some(entry) = state.pending.get_mut(&old_key)
            && entry.op.state == OpState::InProgress
        {
            // Let the running executor finish, then replay the rename.
            entry.queued_rename = Some(new);
            return;
        }

        let op = match state.pending.remove(&old_key) {
            Some(entry) => {
                cancel_entry(&entry);
                match entry.op.kind {
                    OpKind::Create => PendingOp {
                        // A rename inside the debounce window folds into the
                        // create: the server only ever sees the final name.
                        current_path: new.clone(),
                        current_relative: new_relative,
                        is_directory: entry.op.is_directory,
                        state: OpState::Pending,
                        ..entry.op
                    },
                    OpKind::Rename => PendingOp {
                        // Chained renames keep the very first origin.
                        current_path: new.clone(),
                        current_relative: new_relative,
                        state: OpState::Pending,
                        ..entry.op
                    },
                    OpKind::Modify => PendingOp {
                        id: entry.op.id,
                        kind: OpKind::Rename,
                        current_path: new.clone(),
                        original_path: Some(old.clone()),
                        current_relative: new_relative,
                        original_relative: old_relative,
                        is_directory,
                        created_at: entry.op.created_at,
                        state: OpState::Pending,
                        attempt: 0,
                        refresh_content: true,
                        from_move_detection: false,
                    },
                    OpKind::Delete => PendingOp {
                        id: self.next_id.fetch_add(1, Ordering::Relaxed),
                        kind: OpKind::Rename,
                        current_path: new.clone(),
                        original_path: Some(old.clone()),
                        current_relative: new_relative,
                        original_relative: old_relative,
                        is_directory,
                        created_at: Instant::now(),
                        state: OpState::Pending,
                        attempt: 0,
                        refresh_content: false,
                        from_move_detection: false,
                    },
                }
            }
            None => PendingOp {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                kind: OpKind::Rename,
                current_path: new.clone(),
                original_path: Some(old.clone()),
                current_relative: new_relative,
                original_relative: old_relative,
                is_directory,
                created_at: Instant::now(),
                state: OpState::Pending,
                attempt: 0,
                refresh_content: false,
                from_move_detection: false,
            },
        };
        self.schedule(&mut state, key(&new), op);
    }

    async fn on_deleted(self: &Arc<Self>, path: PathBuf) {
        let Ok(relative) = self.paths.client_relative(&path) else {
            return;
        };
        // The file is gone; its record may still know what it was.
        let was_directory = matches!(
            self.store.record(&path),
            Ok(Some(record)) if record.is_directory
        );

        let mut state = self.state.lock().expect("engine state poisoned");
        evict_stale_deletes(&mut state, self.params.move_window);

        let map_key = key(&path);
        if let Some(entry) = state.pending.get(&map_key)
            && entry.op.kind == OpKind::Create
            && entry.op.state == OpState::Pending
        {
            // Create then delete before either matured: net zero.
            let entry = state.pending.remove(&map_key).expect("entry just seen");
            cancel_entry(&entry);
            return;
        }

        let is_directory = state
            .pending
            .get(&map_key)
            .map(|entry| entry.op.is_directory)
            .unwrap_or(was_directory);

        state.deleted_recent.insert(
            name_key(&path),
            DeletedRecord {
                original_path: path.clone(),
                relative: relative.clone(),
                deleted_at: Instant::now(),
                is_directory,
            },
        );

        let op = PendingOp {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: OpKind::Delete,
            current_path: path.clone(),
            original_path: None,
            current_relative: relative,
            original_relative: None,
            is_directory,
            created_at: Instant::now(),
            state: OpState::Pending,
            attempt: 0,
            refresh_content: false,
            from_move_detection: false,
        };
        self.schedule(&mut state, map_key, op);
    }

    async fn on_modified(self: &Arc<Self>, path: PathBuf) {
        let Ok(relative) = self.paths.client_relative(&path) else {
            return;
        };
        let mut state = self.state.lock().expect("engine state poisoned");
        let map_key = key(&path);

        if let Some(entry) = state.pending.get_mut(&map_key) {
            // Keep the existing type; just push the deadline out.
            if entry.op.state == OpState::Pending {
                if let Some(token) = entry.timer_cancel.take() {
                    token.cancel();
                }
                let token = CancellationToken::new();
                entry.timer_cancel = Some(token.clone());
                self.spawn_timer(map_key, token);
            }
            return;
        }

        let op = PendingOp {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: OpKind::Modify,
            current_path: path.clone(),
            original_path: None,
            current_relative: relative,
            original_relative: None,
            is_directory: false,
            created_at: Instant::now(),
            state: OpState::Pending,
            attempt: 0,
            refresh_content: false,
            from_move_detection: false,
        };
        self.schedule(&mut state, map_key, op);
    }

    /// Inserts an op at `map_key`, displacing any pending one, and arms its
    /// debounce timer. Caller holds the state lock.
    fn schedule(self: &Arc<Self>, state: &mut EngineState, map_key: String, op: PendingOp) {
        if let Some(previous) = state.pending.remove(&map_key) {
            cancel_entry(&previous);
        }
        let token = CancellationToken::new();
        state.pending.insert(
            map_key.clone(),
            Entry {
                op,
                timer_cancel: Some(token.clone()),
                queued_rename: None,
            },
        );
        self.spawn_timer(map_key, token);
    }

    fn spawn_timer(self: &Arc<Self>, map_key: String, token: CancellationToken) {
        let engine = Arc::clone(self);
        let debounce = self.params.debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(debounce) => {
                    engine.mature(map_key).await;
                }
            }
        });
    }

    /// Timer expiry: move the op to `InProgress`, declare our intent in the
    /// suppression map, and run it on this worker task.
    async fn mature(self: &Arc<Self>, map_key: String) {
        if self.disposed.load(Ordering::Relaxed) {
            return;
        }
        let snapshot = {
            let mut state = self.state.lock().expect("engine state poisoned");
            let Some(entry) = state.pending.get_mut(&map_key) else {
                return;
            };
            if entry.op.state != OpState::Pending {
                return;
            }
            entry.op.state = OpState::InProgress;
            entry.timer_cancel = None;
            let op = entry.op.clone();
            suppress(&mut state, &op, self.params.suppression_ttl);
            op
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.run_to_completion(map_key, snapshot).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.emit_status();
    }

    async fn run_to_completion(self: &Arc<Self>, map_key: String, mut op: PendingOp) {
        loop {
            eprintln!(
                "[nuviid] op start: kind={:?} path={} attempt={}",
                op.kind, op.current_relative, op.attempt
            );
            match self.execute_op(&op).await {
                Ok(kind) => {
                    eprintln!(
                        "[nuviid] op done: kind={:?} path={}",
                        op.kind, op.current_relative
                    );
                    self.events.activity(kind, &op.current_relative);
                    let queued = {
                        let mut state = self.state.lock().expect("engine state poisoned");
                        match state.pending.get(&map_key) {
                            Some(entry) if entry.op.id == op.id => state
                                .pending
                                .remove(&map_key)
                                .and_then(|entry| entry.queued_rename),
                            _ => None,
                        }
                    };
                    if let Some(new_path) = queued {
                        self.on_renamed(op.current_path.clone(), new_path).await;
                    }
                    return;
                }
                Err(err) => {
                    let next_attempt = op.attempt + 1;
                    if next_attempt >= self.params.max_retries
                        || self.disposed.load(Ordering::Relaxed)
                    {
                        eprintln!(
                            "[nuviid] op failed permanently: kind={:?} path={} err={err}",
                            op.kind, op.current_relative
                        );
                        self.events.failed(&op.current_relative, err.to_string());
                        let mut state = self.state.lock().expect("engine state poisoned");
                        if let Some(entry) = state.pending.get(&map_key)
                            && entry.op.id == op.id
                        {
                            state.pending.remove(&map_key);
                        }
                        *self.last_failure.lock().expect("engine state poisoned") =
                            Some(Instant::now());
                        return;
                    }
                    op.attempt = next_attempt;
                    let delay = self.delays.delay(op.attempt);
                    eprintln!(
                        "[nuviid] op retry in {:?}: kind={:?} path={} err={err}",
                        delay, op.kind, op.current_relative
                    );
                    tokio::time::sleep(delay).await;
                    // The echo window restarts with the new attempt.
                    let mut state = self.state.lock().expect("engine state poisoned");
                    suppress(&mut state, &op, self.params.suppression_ttl);
                }
            }
        }
    }

    async fn execute_op(&self, op: &PendingOp) -> Result<ActivityKind, EngineError> {
        match op.kind {
            OpKind::Create | OpKind::Modify => {
                self.copy_to_server(op).await?;
                self.store.mark_in_sync(&op.current_path).await?;
                Ok(ActivityKind::Uploaded)
            }
            OpKind::Rename => {
                let original = op
                    .original_relative
                    .as_deref()
                    .unwrap_or(&op.current_relative);
                let old_server = self.paths.server_abs(original);
                let new_server = self.paths.server_abs(&op.current_relative);
                if tokio::fs::try_exists(&old_server).await? {
                    if let Some(parent) = new_server.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::rename(&old_server, &new_server).await?;
                    if op.refresh_content && !op.is_directory {
                        tokio::fs::copy(&op.current_path, &new_server).await?;
                    }
                } else {
                    // The source never made it to the server; create instead.
                    self.copy_to_server(op).await?;
                }
                if let Some(original_path) = &op.original_path {
                    // The shell moved the bytes; the record follows here.
                    let _ = self
                        .store
                        .filter()
                        .rename_record(original_path, &op.current_path);
                }
                match self
                    .store
                    .update_identity(&op.current_path, &op.current_relative)
                {
                    Ok(()) => {}
                    // A plain user file; the in-sync conversion below stamps
                    // the fresh identity anyway.
                    Err(FilterError::NotAPlaceholder(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                self.store.mark_in_sync(&op.current_path).await?;
                if op.from_move_detection || parent_changed(original, &op.current_relative) {
                    Ok(ActivityKind::Moved)
                } else {
                    Ok(ActivityKind::Renamed)
                }
            }
            OpKind::Delete => {
                let server_abs = self.paths.server_abs(&op.current_relative);
                match tokio::fs::metadata(&server_abs).await {
                    Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&server_abs).await?,
                    Ok(_) => tokio::fs::remove_file(&server_abs).await?,
                    // Already gone remotely; deleting is idempotent.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                self.store.delete(&op.current_path).await?;
                Ok(ActivityKind::Deleted)
            }
        }
    }

    async fn copy_to_server(&self, op: &PendingOp) -> Result<(), EngineError> {
        let server_abs = self.paths.server_abs(&op.current_relative);
        if op.is_directory {
            tokio::fs::create_dir_all(&server_abs).await?;
        } else {
            if let Some(parent) = server_abs.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&op.current_path, &server_abs).await?;
        }
        Ok(())
    }

    fn emit_status(&self) {
        let status = self.status();
        let mut last = self.last_status.lock().expect("engine state poisoned");
        if *last != Some(status) {
            *last = Some(status);
            self.events.emit(SyncEvent::Status(status));
        }
    }

    /// Cancels every pending timer, clears the maps, and waits for in-flight
    /// executors to finish.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        {
            let mut state = self.state.lock().expect("engine state poisoned");
            for entry in state.pending.values() {
                cancel_entry(entry);
            }
            state.pending.clear();
            state.deleted_recent.clear();
            state.suppressed.clear();
        }
        for _ in 0..500 {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        eprintln!("[nuviid] dispose timed out waiting for in-flight operations");
    }
}

fn key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

fn name_key(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn cancel_entry(entry: &Entry) {
    if let Some(token) = &entry.timer_cancel {
        token.cancel();
    }
}

fn evict_stale_deletes(state: &mut EngineState, window: Duration) {
    state
        .deleted_recent
        .retain(|_, record| record.deleted_at.elapsed() <= window);
}

fn suppress(state: &mut EngineState, op: &PendingOp, ttl: Duration) {
    let expires = Instant::now() + ttl;
    state
        .suppressed
        .insert(op.current_relative.to_lowercase(), expires);
    if let Some(original) = &op.original_relative {
        state.suppressed.insert(original.to_lowercase(), expires);
    }
}

fn remove_pending_delete(state: &mut EngineState, map_key: &str) {
    if let Some(entry) = state.pending.get(map_key)
        && entry.op.kind == OpKind::Delete
    {
        let entry = state.pending.remove(map_key).expect("entry just seen");
        cancel_entry(&entry);
    }
}

/// Finds the move source for a freshly created path, if any.
///
/// The plain case is a recent delete sharing the basename (a cross-directory
/// move arrives as Delete then Create). The replace gesture deletes the
/// destination too, so a record pointing at the created path itself means
/// "the destination was just replaced" and the true source is the most
/// recent other deletion.
fn take_move_source(state: &mut EngineState, created: &Path) -> Option<DeletedRecord> {
    let record = state.deleted_recent.remove(&name_key(created))?;
    if key(&record.original_path) != key(created) {
        return Some(record);
    }
    // The gesture deletes the destination first, then the source; an older
    // unrelated deletion must not be mistaken for the source.
    let source_key = state
        .deleted_recent
        .iter()
        .filter(|(_, other)| other.deleted_at >= record.deleted_at)
        .max_by_key(|(_, other)| other.deleted_at)
        .map(|(name, _)| name.clone())?;
    state.deleted_recent.remove(&source_key)
}

fn parent_changed(original_relative: &str, current_relative: &str) -> bool {
    let parent = |relative: &str| {
        relative
            .rsplit_once('/')
            .map(|(dir, _)| dir.to_lowercase())
            .unwrap_or_default()
    };
    parent(original_relative) != parent(current_relative)
}

#[cfg(test)]
#[path = "engine_tests/mod.rs"]
mod tests;
