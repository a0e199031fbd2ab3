use std::sync::Arc;

use tokio::sync::mpsc;

use nuvii_filter::{FilterError, PlaceholderStore};

use super::engine::ClientSyncEngine;
use super::events::{ActivityKind, ShellNotifier, SyncEvents};
use super::paths::PathMap;
use super::remote_feed::{RemoteEvent, RemoteEventKind};

/// Mirrors server-side changes into the client tree as placeholder
/// operations, honoring the engine's suppression declarations.
pub struct ServerApplier {
    paths: PathMap,
    store: Arc<PlaceholderStore>,
    engine: Arc<ClientSyncEngine>,
    events: SyncEvents,
    notifier: Arc<dyn ShellNotifier>,
}

impl ServerApplier {
    pub fn new(
        paths: PathMap,
        store: Arc<PlaceholderStore>,
        engine: Arc<ClientSyncEngine>,
        events: SyncEvents,
        notifier: Arc<dyn ShellNotifier>,
    ) -> Self {
        Self {
            paths,
            store,
            engine,
            events,
            notifier,
        }
    }

    /// Drains the feed until it closes. Individual failures are logged and
    /// skipped; the feed redelivers on the next change.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<RemoteEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(err) = self.apply(event.clone()).await {
                eprintln!(
                    "[nuviid] applier error for {:?} {}: {err}",
                    event.kind, event.relative
                );
            }
        }
    }

    pub async fn apply(&self, event: RemoteEvent) -> Result<(), FilterError> {
        // Server-relative and client-relative paths coincide.
        if self.engine.is_suppressed(&event.relative)
            || event
                .old_relative
                .as_deref()
                .map(|old| self.engine.is_suppressed(old))
                .unwrap_or(false)
        {
            // Almost certainly the echo of our own write.
            return Ok(());
        }

        match event.kind {
            RemoteEventKind::Create => {
                let server_abs = self.paths.server_abs(&event.relative);
                let client_abs = self.paths.client_abs(&event.relative);
                match self.store.create_single(&server_abs, &client_abs).await {
                    Ok(()) => {}
                    // The server entry vanished between event and apply.
                    Err(FilterError::MissingSource(_)) => return Ok(()),
                    Err(err) => return Err(err),
                }
                if let Some(parent) = client_abs.parent() {
                    self.notifier.notify_changed(parent);
                }
                self.events
                    .activity(ActivityKind::Downloaded, &event.relative);
            }
            RemoteEventKind::Delete => {
                let client_abs = self.paths.client_abs(&event.relative);
                self.store.delete(&client_abs).await?;
                self.events.activity(ActivityKind::Deleted, &event.relative);
            }
            RemoteEventKind::Rename => {
                let Some(old_relative) = event.old_relative.as_deref() else {
                    return Ok(());
                };
                let old_abs = self.paths.client_abs(old_relative);
                let new_abs = self.paths.client_abs(&event.relative);
                match self.store.rename(&old_abs, &new_abs).await {
                    Ok(()) => {}
                    // Replayed or already-applied rename.
                    Err(FilterError::MissingSource(_)) => return Ok(()),
                    Err(err) => return Err(err),
                }
                self.store.update_identity(&new_abs, &event.relative)?;
                self.events.activity(ActivityKind::Renamed, &event.relative);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::engine::EngineParams;
    use crate::sync::events::LogShellNotifier;
    use nuvii_filter::SyncFilter;
    use std::path::Path;
    use tempfile::tempdir;

    fn applier(dir: &Path) -> ServerApplier {
        applier_with(dir, EngineParams::default())
    }

    fn applier_with(dir: &Path, params: EngineParams) -> ServerApplier {
        let server = dir.join("server");
        let client = dir.join("client");
        std::fs::create_dir_all(&server).unwrap();
        std::fs::create_dir_all(&client).unwrap();
        let filter = SyncFilter::attach(&dir.join("state"), client.clone()).unwrap();
        let store = Arc::new(PlaceholderStore::new(
            filter,
            server.clone(),
            client.clone(),
        ));
        let paths = PathMap::new(server, client);
        let events = SyncEvents::default();
        let engine = ClientSyncEngine::new(paths.clone(), Arc::clone(&store), events.clone(), params);
        ServerApplier::new(paths, store, engine, events, Arc::new(LogShellNotifier))
    }

    fn create(relative: &str) -> RemoteEvent {
        RemoteEvent {
            kind: RemoteEventKind::Create,
            relative: relative.into(),
            old_relative: None,
        }
    }

    #[tokio::test]
    async fn remote_create_materializes_a_placeholder() {
        let dir = tempdir().unwrap();
        let applier = applier(dir.path());
        std::fs::write(applier.paths.server_abs("x.txt"), b"remote").unwrap();

        applier.apply(create("x.txt")).await.unwrap();

        let client = applier.paths.client_abs("x.txt");
        assert!(client.exists());
        let record = applier.store.record(&client).unwrap().unwrap();
        assert_eq!(record.size, 6);
        assert!(record.state.is_in_sync);
    }

    #[tokio::test]
    async fn remote_events_are_idempotent() {
        let dir = tempdir().unwrap();
        let applier = applier(dir.path());
        std::fs::write(applier.paths.server_abs("x.txt"), b"remote").unwrap();

        applier.apply(create("x.txt")).await.unwrap();
        applier.apply(create("x.txt")).await.unwrap();

        // Delete twice: the second is a no-op on an absent entry.
        let delete = RemoteEvent {
            kind: RemoteEventKind::Delete,
            relative: "x.txt".into(),
            old_relative: None,
        };
        applier.apply(delete.clone()).await.unwrap();
        applier.apply(delete).await.unwrap();
        assert!(!applier.paths.client_abs("x.txt").exists());
    }

    #[tokio::test]
    async fn remote_rename_moves_placeholder_and_identity() {
        let dir = tempdir().unwrap();
        let applier = applier(dir.path());
        std::fs::write(applier.paths.server_abs("a.txt"), b"1").unwrap();
        applier.apply(create("a.txt")).await.unwrap();

        applier
            .apply(RemoteEvent {
                kind: RemoteEventKind::Rename,
                relative: "b/renamed.txt".into(),
                old_relative: Some("a.txt".into()),
            })
            .await
            .unwrap();

        let new_abs = applier.paths.client_abs("b/renamed.txt");
        assert!(new_abs.exists());
        assert!(!applier.paths.client_abs("a.txt").exists());
        let record = applier.store.record(&new_abs).unwrap().unwrap();
        assert_eq!(record.identity.to_relative().unwrap(), "b/renamed.txt");

        // Replaying the rename finds no source and stays quiet.
        applier
            .apply(RemoteEvent {
                kind: RemoteEventKind::Rename,
                relative: "b/renamed.txt".into(),
                old_relative: Some("a.txt".into()),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn suppressed_events_are_dropped() {
        let dir = tempdir().unwrap();
        let applier = applier_with(
            dir.path(),
            EngineParams {
                debounce: std::time::Duration::from_millis(20),
                ..EngineParams::default()
            },
        );

        // A real upload: the engine declares intent on y.txt before writing
        // the server side.
        let client = applier.paths.client_abs("y.txt");
        std::fs::write(&client, b"local edit").unwrap();
        applier
            .engine
            .ingest(crate::sync::local_events::LocalEvent::Modified {
                path: client.clone(),
            })
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(applier.engine.is_suppressed("y.txt"));

        // The reflected server event for the same path is dropped.
        applier
            .apply(RemoteEvent {
                kind: RemoteEventKind::Delete,
                relative: "y.txt".into(),
                old_relative: None,
            })
            .await
            .unwrap();
        assert!(client.exists());
        assert_eq!(std::fs::read(applier.paths.server_abs("y.txt")).unwrap(), b"local edit");
    }
}
