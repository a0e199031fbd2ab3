use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use nuvii_filter::{FilterError, PinChange, PinEvent, PlaceholderStore};

use super::events::{ActivityKind, ShellNotifier, SyncEvents};

/// Reacts to "always keep on this device" and "free up space" gestures,
/// observed as pin-attribute changes on client entries.
pub struct PinWatcher {
    store: Arc<PlaceholderStore>,
    events: SyncEvents,
    notifier: Arc<dyn ShellNotifier>,
    /// Settle time between marking in sync and opening for dehydration.
    propagation_delay: Duration,
}

impl PinWatcher {
    pub fn new(
        store: Arc<PlaceholderStore>,
        events: SyncEvents,
        notifier: Arc<dyn ShellNotifier>,
    ) -> Self {
        Self {
            store,
            events,
            notifier,
            propagation_delay: Duration::from_millis(200),
        }
    }

    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<PinEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let client_abs = self.store.client_root().join(&event.relative);
                let result = match event.change {
                    PinChange::Pinned => self.handle_pin(&client_abs).await,
                    PinChange::Unpinned => self.handle_unpin(&client_abs).await,
                };
                if let Err(err) = result {
                    eprintln!(
                        "[nuviid] pin handling failed for {}: {err}",
                        event.relative
                    );
                } else {
                    self.events.activity(ActivityKind::Synced, &event.relative);
                }
            }
        })
    }

    async fn handle_pin(&self, client_abs: &std::path::Path) -> Result<(), FilterError> {
        self.store.hydrate(client_abs, 0, -1).await?;
        self.store.mark_in_sync(client_abs).await
    }

    /// The dehydration protocol. The shell only permits releasing content
    /// from an in-sync, unpinned placeholder, so the states are walked
    /// explicitly instead of failing opaquely.
    async fn handle_unpin(&self, client_abs: &std::path::Path) -> Result<(), FilterError> {
        let state = self.store.state(client_abs)?;

        // 1. Already offline: nothing to release.
        if let Some(state) = &state
            && state.is_offline
        {
            return Ok(());
        }

        // 2. Not a placeholder yet (a fresh user file): convert and release
        //    in one call.
        let Some(state) = state else {
            let identity = self.store.identity_for(client_abs)?;
            return self.store.convert_and_dehydrate(client_abs, identity).await;
        };

        // 3. A placeholder that is not in sync needs the flag first, plus a
        //    beat for the state to propagate.
        if !state.is_in_sync {
            self.store.mark_in_sync(client_abs).await?;
            tokio::time::sleep(self.propagation_delay).await;
        }

        // 4. Release; a failure leaves the entry usable, so restore the
        //    in-sync glyph as a best effort.
        if let Err(err) = self.store.dehydrate(client_abs, 0, -1).await {
            let _ = self.store.mark_in_sync(client_abs).await;
            return Err(err);
        }

        // 5. Refresh the glyph and let the parent's aggregate state update.
        self.store.mark_in_sync(client_abs).await?;
        if let Some(parent) = client_abs.parent() {
            self.notifier.notify_changed(parent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::events::LogShellNotifier;
    use crate::sync::hydration::HydrationHandler;
    use nuvii_filter::{CallbackTable, SyncFilter};
    use std::path::Path;
    use tempfile::tempdir;

    async fn setup(dir: &Path) -> (Arc<SyncFilter>, Arc<PlaceholderStore>) {
        let server = dir.join("server");
        let client = dir.join("client");
        std::fs::create_dir_all(&server).unwrap();
        std::fs::create_dir_all(&client).unwrap();
        let filter = SyncFilter::attach(&dir.join("state"), client.clone()).unwrap();
        filter
            .connect(CallbackTable::standard(Arc::new(HydrationHandler::new(
                server.clone(),
            ))))
            .unwrap();
        let store = Arc::new(PlaceholderStore::new(
            Arc::clone(&filter),
            server,
            client,
        ));
        (filter, store)
    }

    fn watcher(store: &Arc<PlaceholderStore>) -> PinWatcher {
        PinWatcher::new(
            Arc::clone(store),
            SyncEvents::default(),
            Arc::new(LogShellNotifier),
        )
        .with_propagation_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn pin_hydrates_and_marks_in_sync() {
        let dir = tempdir().unwrap();
        let (filter, store) = setup(dir.path()).await;
        std::fs::write(store.server_root().join("keep.txt"), b"content").unwrap();
        let client_abs = store.client_root().join("keep.txt");
        store
            .create_single(&store.server_root().join("keep.txt"), &client_abs)
            .await
            .unwrap();

        let rx = filter.subscribe_pins();
        let handle = watcher(&store).spawn(rx);
        filter.set_pin_state(&client_abs, PinChange::Pinned).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(std::fs::read(&client_abs).unwrap(), b"content");
        let state = store.state(&client_abs).unwrap().unwrap();
        assert!(!state.is_offline);
        assert!(state.is_in_sync);
        assert!(state.is_pinned);
        handle.abort();
    }

    #[tokio::test]
    async fn unpin_of_fresh_file_converts_and_dehydrates() {
        let dir = tempdir().unwrap();
        let (filter, store) = setup(dir.path()).await;
        let client_abs = store.client_root().join("fresh.txt");
        std::fs::write(&client_abs, b"fresh data").unwrap();

        let rx = filter.subscribe_pins();
        let handle = watcher(&store).spawn(rx);
        filter
            .set_pin_state(&client_abs, PinChange::Unpinned)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(std::fs::metadata(&client_abs).unwrap().len(), 0);
        let record = store.record(&client_abs).unwrap().unwrap();
        assert!(record.state.is_offline);
        assert!(record.state.is_in_sync);
        assert_eq!(record.size, 10);
        handle.abort();
    }

    #[tokio::test]
    async fn unpin_round_trip_ends_offline_and_in_sync() {
        let dir = tempdir().unwrap();
        let (filter, store) = setup(dir.path()).await;
        std::fs::write(store.server_root().join("doc.txt"), b"payload").unwrap();
        let client_abs = store.client_root().join("doc.txt");
        store
            .create_single(&store.server_root().join("doc.txt"), &client_abs)
            .await
            .unwrap();

        let rx = filter.subscribe_pins();
        let handle = watcher(&store).spawn(rx);

        filter.set_pin_state(&client_abs, PinChange::Pinned).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(std::fs::read(&client_abs).unwrap(), b"payload");

        filter
            .set_pin_state(&client_abs, PinChange::Unpinned)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let state = store.state(&client_abs).unwrap().unwrap();
        assert!(state.is_offline);
        assert!(state.is_in_sync);
        assert!(!state.is_pinned);
        assert_eq!(std::fs::metadata(&client_abs).unwrap().len(), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn unpin_of_offline_entry_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (filter, store) = setup(dir.path()).await;
        std::fs::write(store.server_root().join("cold.txt"), b"x").unwrap();
        let client_abs = store.client_root().join("cold.txt");
        store
            .create_single(&store.server_root().join("cold.txt"), &client_abs)
            .await
            .unwrap();
        let before = store.record(&client_abs).unwrap().unwrap();
        assert!(before.state.is_offline);

        let rx = filter.subscribe_pins();
        let handle = watcher(&store).spawn(rx);
        filter
            .set_pin_state(&client_abs, PinChange::Unpinned)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let after = store.record(&client_abs).unwrap().unwrap();
        assert!(after.state.is_offline);
        assert_eq!(after.size, before.size);
        handle.abort();
    }
}
