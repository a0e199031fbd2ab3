use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEventKind {
    Create,
    Delete,
    Rename,
}

/// A change on the server tree, in server-relative terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    pub kind: RemoteEventKind,
    pub relative: String,
    pub old_relative: Option<String>,
}

/// Source of server-side change events.
///
/// This is the one deliberately pluggable seam in the engine: swap the
/// reference observer for a push transport and nothing downstream changes.
/// Delivery is at-least-once; the applier tolerates replays.
pub trait RemoteChangeFeed: Send {
    fn start(&mut self) -> anyhow::Result<mpsc::UnboundedReceiver<RemoteEvent>>;
    fn stop(&mut self);
}

/// Reference feed: a second filesystem observer on the server tree,
/// translated 1:1. Watcher errors trigger a stop-then-start cycle; the
/// channel survives restarts.
pub struct WatcherRemoteFeed {
    root: PathBuf,
    supervisor: Option<JoinHandle<()>>,
}

impl WatcherRemoteFeed {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            supervisor: None,
        }
    }
}

impl RemoteChangeFeed for WatcherRemoteFeed {
    fn start(&mut self) -> anyhow::Result<mpsc::UnboundedReceiver<RemoteEvent>> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let root = self.root.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
                let mut watcher = match notify::recommended_watcher(move |result| {
                    let _ = raw_tx.send(result);
                }) {
                    Ok(watcher) => watcher,
                    Err(err) => {
                        eprintln!("[nuviid] remote feed init failed: {err}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                };
                if let Err(err) = watcher.watch(&root, RecursiveMode::Recursive) {
                    eprintln!(
                        "[nuviid] remote feed failed to watch {}: {err}",
                        root.display()
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }

                while let Some(result) = raw_rx.recv().await {
                    match result {
                        Ok(event) => {
                            for remote in map_remote_event(&root, event) {
                                if out_tx.send(remote).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            eprintln!("[nuviid] remote feed watcher error: {err}; restarting");
                            break;
                        }
                    }
                }
            }
        });
        self.supervisor = Some(handle);
        Ok(out_rx)
    }

    fn stop(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}

fn map_remote_event(root: &Path, event: Event) -> Vec<RemoteEvent> {
    match event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .filter_map(|path| relative_of(root, path))
            .map(|relative| RemoteEvent {
                kind: RemoteEventKind::Create,
                relative,
                old_relative: None,
            })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|path| relative_of(root, path))
            .map(|relative| RemoteEvent {
                kind: RemoteEventKind::Delete,
                relative,
                old_relative: None,
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::Both if event.paths.len() >= 2 => {
                match (
                    relative_of(root, &event.paths[0]),
                    relative_of(root, &event.paths[1]),
                ) {
                    (Some(old), Some(new)) => vec![RemoteEvent {
                        kind: RemoteEventKind::Rename,
                        relative: new,
                        old_relative: Some(old),
                    }],
                    _ => Vec::new(),
                }
            }
            // Half a rename degrades to the visible side; the applier's
            // idempotence absorbs the imbalance.
            RenameMode::From => event
                .paths
                .iter()
                .filter_map(|path| relative_of(root, path))
                .map(|relative| RemoteEvent {
                    kind: RemoteEventKind::Delete,
                    relative,
                    old_relative: None,
                })
                .collect(),
            RenameMode::To => event
                .paths
                .iter()
                .filter_map(|path| relative_of(root, path))
                .map(|relative| RemoteEvent {
                    kind: RemoteEventKind::Create,
                    relative,
                    old_relative: None,
                })
                .collect(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn relative_of(root: &Path, path: &Path) -> Option<String> {
    let tail = path.strip_prefix(root).ok()?;
    let relative = tail.to_string_lossy().replace('\\', "/");
    if relative.is_empty() {
        None
    } else {
        Some(relative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_create_and_remove_to_relative_events() {
        let root = Path::new("/srv/nuvii");
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("/srv/nuvii/Docs/A.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_remote_event(root, event),
            vec![RemoteEvent {
                kind: RemoteEventKind::Create,
                relative: "Docs/A.txt".into(),
                old_relative: None,
            }]
        );

        let event = Event {
            kind: EventKind::Remove(notify::event::RemoveKind::File),
            paths: vec![PathBuf::from("/srv/nuvii/Docs/A.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_remote_event(root, event)[0].kind,
            RemoteEventKind::Delete
        );
    }

    #[test]
    fn maps_two_sided_rename() {
        let root = Path::new("/srv/nuvii");
        let event = Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![
                PathBuf::from("/srv/nuvii/a.txt"),
                PathBuf::from("/srv/nuvii/b.txt"),
            ],
            attrs: Default::default(),
        };
        assert_eq!(
            map_remote_event(root, event),
            vec![RemoteEvent {
                kind: RemoteEventKind::Rename,
                relative: "b.txt".into(),
                old_relative: Some("a.txt".into()),
            }]
        );
    }

    #[test]
    fn one_sided_renames_degrade_to_create_or_delete() {
        let root = Path::new("/srv/nuvii");
        let event = Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            paths: vec![PathBuf::from("/srv/nuvii/a.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_remote_event(root, event)[0].kind,
            RemoteEventKind::Delete
        );

        let event = Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            paths: vec![PathBuf::from("/srv/nuvii/b.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_remote_event(root, event)[0].kind,
            RemoteEventKind::Create
        );
    }

    #[test]
    fn events_outside_the_root_are_dropped() {
        let root = Path::new("/srv/nuvii");
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("/elsewhere/A.txt")],
            attrs: Default::default(),
        };
        assert!(map_remote_event(root, event).is_empty());
    }
}
