use std::path::Path;

use tokio::sync::broadcast;

/// What a completed operation did, as shown in the activity feed.
///
/// `Moved` is a rename whose parent directory changed; `Renamed` stays in
/// place. `Synced` covers state-only transitions with no data movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Uploaded,
    Downloaded,
    Deleted,
    Renamed,
    Moved,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Idle,
    Syncing,
    Degraded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Activity { kind: ActivityKind, relative: String },
    Failed { relative: String, reason: String },
    Status(EngineStatus),
}

/// Broadcast fan-out for the activity display. Slow or absent subscribers
/// never block the engine.
#[derive(Clone)]
pub struct SyncEvents {
    tx: broadcast::Sender<SyncEvent>,
}

impl SyncEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }

    pub fn activity(&self, kind: ActivityKind, relative: &str) {
        self.emit(SyncEvent::Activity {
            kind,
            relative: relative.to_string(),
        });
    }

    pub fn failed(&self, relative: &str, reason: String) {
        self.emit(SyncEvent::Failed {
            relative: relative.to_string(),
            reason,
        });
    }
}

impl Default for SyncEvents {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Shell change notifications, an external collaborator. The daemon's
/// default just logs; a platform build plugs the real shell in.
pub trait ShellNotifier: Send + Sync {
    fn notify_changed(&self, path: &Path);
}

pub struct LogShellNotifier;

impl ShellNotifier for LogShellNotifier {
    fn notify_changed(&self, path: &Path) {
        eprintln!("[nuviid] shell change notification: {}", path.display());
    }
}
