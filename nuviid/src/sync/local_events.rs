use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use nuvii_filter::PlaceholderStore;

use super::tempfiles::TempFileOracle;

/// A semantic change under the client tree, after temp-file and
/// placeholder-only filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Created { path: PathBuf, placeholder_only: bool },
    Renamed { old: PathBuf, new: PathBuf },
    Deleted { path: PathBuf },
    Modified { path: PathBuf },
}

/// Maps raw notifications to [`LocalEvent`]s.
///
/// Temp files never enter the pipeline. A rename between the temp and
/// non-temp worlds degrades to the visible half: temp→real is a create,
/// real→temp is a delete. Placeholder-only creates are delivered flagged so
/// the engine can pair them against move detection first.
pub struct EventClassifier {
    store: Arc<PlaceholderStore>,
    oracle: TempFileOracle,
}

impl EventClassifier {
    pub fn new(store: Arc<PlaceholderStore>) -> Self {
        let oracle = TempFileOracle::new(Arc::clone(&store));
        Self { store, oracle }
    }

    pub fn map_event(&self, event: Event) -> Vec<LocalEvent> {
        match event.kind {
            EventKind::Create(_) => event
                .paths
                .into_iter()
                .filter_map(|path| self.map_created(path))
                .collect(),
            EventKind::Modify(ModifyKind::Name(mode)) => match mode {
                RenameMode::Both if event.paths.len() >= 2 => {
                    let mut paths = event.paths.into_iter();
                    let old = paths.next().expect("rename with two paths");
                    let new = paths.next().expect("rename with two paths");
                    self.map_renamed(old, new).into_iter().collect()
                }
                RenameMode::From => event
                    .paths
                    .into_iter()
                    .filter_map(|path| self.map_deleted(path))
                    .collect(),
                RenameMode::To => event
                    .paths
                    .into_iter()
                    .filter_map(|path| self.map_created(path))
                    .collect(),
                _ => Vec::new(),
            },
            EventKind::Modify(_) => event
                .paths
                .into_iter()
                .filter_map(|path| self.map_modified(path))
                .collect(),
            EventKind::Remove(_) => event
                .paths
                .into_iter()
                .filter_map(|path| self.map_deleted(path))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn map_created(&self, path: PathBuf) -> Option<LocalEvent> {
        if self.oracle.is_temp(&path) {
            return None;
        }
        let placeholder_only = self.store.is_placeholder_only(&path);
        Some(LocalEvent::Created {
            path,
            placeholder_only,
        })
    }

    fn map_renamed(&self, old: PathBuf, new: PathBuf) -> Option<LocalEvent> {
        // The old name is gone from disk; classify it by name alone.
        let old_temp = self.oracle.is_temp_by_name(&old);
        let new_temp = self.oracle.is_temp(&new);
        match (old_temp, new_temp) {
            (true, true) => None,
            (true, false) => self.map_created(new),
            (false, true) => Some(LocalEvent::Deleted { path: old }),
            (false, false) => Some(LocalEvent::Renamed { old, new }),
        }
    }

    fn map_deleted(&self, path: PathBuf) -> Option<LocalEvent> {
        if self.oracle.is_temp_by_name(&path) {
            return None;
        }
        Some(LocalEvent::Deleted { path })
    }

    fn map_modified(&self, path: PathBuf) -> Option<LocalEvent> {
        let meta = std::fs::symlink_metadata(&path).ok()?;
        if meta.is_dir() {
            return None;
        }
        if self.oracle.is_temp(&path) {
            return None;
        }
        // Server-side population touches placeholders too; those writes
        // must not echo back as user edits.
        if self.store.is_placeholder_only(&path) {
            return None;
        }
        Some(LocalEvent::Modified { path })
    }
}

/// Watches the client tree and feeds classified events to the receiver.
///
/// Any watcher error triggers an immediate stop-then-start cycle; the
/// channel stays up across restarts.
pub fn spawn_local_watcher(
    root: PathBuf,
    classifier: Arc<EventClassifier>,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<LocalEvent>) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        loop {
            let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
            let mut watcher = match notify::recommended_watcher(move |res| {
                let _ = raw_tx.send(res);
            }) {
                Ok(watcher) => watcher,
                Err(err) => {
                    eprintln!("[nuviid] local watcher init failed: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if let Err(err) = watcher.watch(&root, RecursiveMode::Recursive) {
                eprintln!("[nuviid] local watcher failed to watch {}: {err}", root.display());
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            while let Some(result) = raw_rx.recv().await {
                match result {
                    Ok(event) => {
                        for mapped in classifier.map_event(event) {
                            if out_tx.send(mapped).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        eprintln!("[nuviid] local watcher error: {err}; restarting");
                        break;
                    }
                }
            }
            // Dropping the watcher stops the old stream before the retry.
        }
    });
    (handle, out_rx)
}
