use std::collections::HashMap;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::FilterError;
use crate::identity::FileIdentity;
use crate::metadata::{relative_of, MetadataStore, PlaceholderRecord};

pub type ConnectionKey = u64;
pub type TransferKey = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    ObjectNotFound,
    Unsuccessful,
}

/// One on-demand data request handed to the provider's `FetchData` callback.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub connection_key: ConnectionKey,
    pub transfer_key: TransferKey,
    pub identity: FileIdentity,
    pub required_offset: u64,
    pub required_length: u64,
    pub request_key: u64,
    pub correlation_vector: String,
}

/// Provider callbacks pinned for the lifetime of a filter connection.
///
/// `fetch_data` may be invoked concurrently for distinct files and must
/// always drive the transfer to exactly one terminal status so the waiting
/// reader unblocks. `cancel_fetch_data` is a hint; the cancellation token on
/// the transfer carries the actual signal.
pub trait FetchCallbacks: Send + Sync {
    fn fetch_data(
        &self,
        filter: Arc<SyncFilter>,
        request: FetchRequest,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>>;

    fn cancel_fetch_data(&self, transfer_key: TransferKey);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackEntry {
    FetchData,
    CancelFetchData,
    Sentinel,
}

/// Sentinel-terminated callback registration table.
pub struct CallbackTable {
    pub(crate) handler: Arc<dyn FetchCallbacks>,
    pub(crate) entries: Vec<CallbackEntry>,
}

impl CallbackTable {
    pub fn standard(handler: Arc<dyn FetchCallbacks>) -> Self {
        Self {
            handler,
            entries: vec![
                CallbackEntry::FetchData,
                CallbackEntry::CancelFetchData,
                CallbackEntry::Sentinel,
            ],
        }
    }

    pub fn with_entries(handler: Arc<dyn FetchCallbacks>, entries: Vec<CallbackEntry>) -> Self {
        Self { handler, entries }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinChange {
    Pinned,
    Unpinned,
}

/// Attribute-change notification for "keep on device" / "free up space".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinEvent {
    pub relative: String,
    pub change: PinChange,
}

struct Connected {
    key: ConnectionKey,
    handler: Arc<dyn FetchCallbacks>,
}

struct TransferState {
    target: PathBuf,
    required_length: u64,
    transferred: u64,
    progress_completed: u64,
    cancel: CancellationToken,
    terminal: Option<(TransferStatus, u64)>,
}

/// The cloud-filter subsystem for one sync root.
///
/// Owns the per-file placeholder records and the single callback connection.
/// All placeholder mutation goes through [`crate::PlaceholderStore`]; this
/// type carries the pieces the store and the hydration path share.
pub struct SyncFilter {
    client_root: PathBuf,
    store: MetadataStore,
    connected: Mutex<Option<Connected>>,
    transfers: Mutex<HashMap<TransferKey, TransferState>>,
    pin_tx: Mutex<Option<mpsc::UnboundedSender<PinEvent>>>,
    next_key: AtomicU64,
}

impl SyncFilter {
    pub fn attach(state_dir: &Path, client_root: PathBuf) -> Result<Arc<Self>, FilterError> {
        let store = MetadataStore::open(state_dir.join("meta"))?;
        Ok(Arc::new(Self {
            client_root,
            store,
            connected: Mutex::new(None),
            transfers: Mutex::new(HashMap::new()),
            pin_tx: Mutex::new(None),
            next_key: AtomicU64::new(1),
        }))
    }

    pub fn client_root(&self) -> &Path {
        &self.client_root
    }

    pub fn connect(&self, table: CallbackTable) -> Result<ConnectionKey, FilterError> {
        if table.entries.last() != Some(&CallbackEntry::Sentinel) {
            return Err(FilterError::UnterminatedCallbackTable);
        }
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.connected.lock().expect("connection mutex poisoned");
        *slot = Some(Connected {
            key,
            handler: Arc::clone(&table.handler),
        });
        Ok(key)
    }

    pub fn disconnect(&self, key: ConnectionKey) -> Result<(), FilterError> {
        let mut slot = self.connected.lock().expect("connection mutex poisoned");
        match slot.as_ref() {
            Some(connected) if connected.key == key => {
                *slot = None;
                Ok(())
            }
            _ => Err(FilterError::NotConnected),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
            .lock()
            .expect("connection mutex poisoned")
            .is_some()
    }

    // ---- placeholder records -------------------------------------------------

    pub fn relative_of(&self, client_abs: &Path) -> Result<String, FilterError> {
        relative_of(&self.client_root, client_abs)
    }

    pub fn record(&self, client_abs: &Path) -> Result<Option<PlaceholderRecord>, FilterError> {
        let relative = self.relative_of(client_abs)?;
        self.store.read(&relative)
    }

    pub fn write_record(
        &self,
        client_abs: &Path,
        record: &PlaceholderRecord,
    ) -> Result<(), FilterError> {
        let relative = self.relative_of(client_abs)?;
        self.store.write(&relative, record)
    }

    pub fn remove_record(&self, client_abs: &Path) -> Result<(), FilterError> {
        let relative = self.relative_of(client_abs)?;
        self.store.remove(&relative)
    }

    pub fn rename_record(&self, old_abs: &Path, new_abs: &Path) -> Result<(), FilterError> {
        let old_relative = self.relative_of(old_abs)?;
        let new_relative = self.relative_of(new_abs)?;
        self.store.rename(&old_relative, &new_relative)
    }

    // ---- hydration transfers -------------------------------------------------

    /// Runs one fetch round-trip through the connected callbacks and returns
    /// the number of bytes the terminal transfer covered.
    pub async fn request_hydration(
        self: &Arc<Self>,
        client_abs: &Path,
        required_offset: u64,
        required_length: u64,
    ) -> Result<u64, FilterError> {
        let record = self
            .record(client_abs)?
            .ok_or_else(|| FilterError::NotAPlaceholder(client_abs.to_path_buf()))?;
        let handler = {
            let slot = self.connected.lock().expect("connection mutex poisoned");
            let connected = slot.as_ref().ok_or(FilterError::NotConnected)?;
            (connected.key, Arc::clone(&connected.handler))
        };
        let (connection_key, handler) = handler;

        let transfer_key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let request_key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let request = FetchRequest {
            connection_key,
            transfer_key,
            identity: record.identity.clone(),
            required_offset,
            required_length,
            request_key,
            correlation_vector: format!("nuvii/{transfer_key}"),
        };
        {
            let mut transfers = self.transfers.lock().expect("transfer mutex poisoned");
            transfers.insert(
                transfer_key,
                TransferState {
                    target: client_abs.to_path_buf(),
                    required_length,
                    transferred: 0,
                    progress_completed: 0,
                    cancel: CancellationToken::new(),
                    terminal: None,
                },
            );
        }

        handler.fetch_data(Arc::clone(self), request).await;

        let state = self
            .transfers
            .lock()
            .expect("transfer mutex poisoned")
            .remove(&transfer_key)
            .ok_or(FilterError::UnknownTransfer)?;
        match state.terminal {
            Some((TransferStatus::Success, covered)) => Ok(covered),
            Some((status, _)) => Err(FilterError::TransferFailed(status)),
            None => Err(FilterError::TransferFailed(TransferStatus::Unsuccessful)),
        }
    }

    pub fn cancel_hydration(&self, transfer_key: TransferKey) {
        if let Some(state) = self
            .transfers
            .lock()
            .expect("transfer mutex poisoned")
            .get(&transfer_key)
        {
            state.cancel.cancel();
        }
        let handler = {
            let slot = self.connected.lock().expect("connection mutex poisoned");
            slot.as_ref().map(|connected| Arc::clone(&connected.handler))
        };
        if let Some(handler) = handler {
            handler.cancel_fetch_data(transfer_key);
        }
    }

    /// Writes one chunk of fetched data into the placeholder at `offset`.
    pub async fn transfer_data(
        &self,
        transfer_key: TransferKey,
        offset: u64,
        data: &[u8],
    ) -> Result<(), FilterError> {
        let target = {
            let transfers = self.transfers.lock().expect("transfer mutex poisoned");
            let state = transfers
                .get(&transfer_key)
                .ok_or(FilterError::UnknownTransfer)?;
            if state.terminal.is_some() {
                return Err(FilterError::TransferAlreadyComplete);
            }
            state.target.clone()
        };

        let mut file = tokio::fs::OpenOptions::new().write(true).open(&target).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;

        let mut transfers = self.transfers.lock().expect("transfer mutex poisoned");
        if let Some(state) = transfers.get_mut(&transfer_key) {
            state.transferred = state.transferred.saturating_add(data.len() as u64);
        }
        Ok(())
    }

    pub fn report_progress(&self, transfer_key: TransferKey, _total: u64, completed: u64) {
        let mut transfers = self.transfers.lock().expect("transfer mutex poisoned");
        if let Some(state) = transfers.get_mut(&transfer_key) {
            state.progress_completed = completed;
        }
    }

    /// Bytes written and last reported progress for an in-flight transfer.
    pub fn transfer_progress(&self, transfer_key: TransferKey) -> Option<(u64, u64)> {
        self.transfers
            .lock()
            .expect("transfer mutex poisoned")
            .get(&transfer_key)
            .map(|state| (state.transferred, state.progress_completed))
    }

    pub fn is_cancelled(&self, transfer_key: TransferKey) -> bool {
        self.transfers
            .lock()
            .expect("transfer mutex poisoned")
            .get(&transfer_key)
            .map(|state| state.cancel.is_cancelled())
            .unwrap_or(false)
    }

    /// Records the single terminal transfer for a request key.
    ///
    /// `length` covers the transferred range on success and must equal the
    /// original required length on failure so the waiting reader unblocks.
    pub fn complete_transfer(
        &self,
        transfer_key: TransferKey,
        status: TransferStatus,
        length: u64,
    ) -> Result<(), FilterError> {
        let mut transfers = self.transfers.lock().expect("transfer mutex poisoned");
        let state = transfers
            .get_mut(&transfer_key)
            .ok_or(FilterError::UnknownTransfer)?;
        if state.terminal.is_some() {
            return Err(FilterError::TransferAlreadyComplete);
        }
        if status != TransferStatus::Success && length != state.required_length {
            // Tolerated, but the contract wants the original length back.
            state.terminal = Some((status, state.required_length));
            return Ok(());
        }
        state.terminal = Some((status, length));
        Ok(())
    }

    // ---- pin attribute stream ------------------------------------------------

    pub fn subscribe_pins(&self) -> mpsc::UnboundedReceiver<PinEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.pin_tx.lock().expect("pin mutex poisoned") = Some(tx);
        rx
    }

    /// Applies a pin/unpin gesture to an entry and notifies the subscriber.
    ///
    /// The entry may not have a placeholder record yet (a fresh user file);
    /// the event is still delivered so the watcher can run the conversion
    /// path.
    pub fn set_pin_state(
        &self,
        client_abs: &Path,
        change: PinChange,
    ) -> Result<(), FilterError> {
        let relative = self.relative_of(client_abs)?;
        if let Some(mut record) = self.store.read(&relative)? {
            match change {
                PinChange::Pinned => {
                    record.state.is_pinned = true;
                    record.state.is_unpinned = false;
                }
                PinChange::Unpinned => {
                    record.state.is_pinned = false;
                    record.state.is_unpinned = true;
                }
            }
            self.store.write(&relative, &record)?;
        }
        let tx = self.pin_tx.lock().expect("pin mutex poisoned");
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(PinEvent { relative, change });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct NoopCallbacks;

    impl FetchCallbacks for NoopCallbacks {
        fn fetch_data(
            &self,
            _filter: Arc<SyncFilter>,
            _request: FetchRequest,
        ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
            Box::pin(async {})
        }

        fn cancel_fetch_data(&self, _transfer_key: TransferKey) {}
    }

    #[test]
    fn connect_requires_sentinel_terminated_table() {
        let dir = tempdir().unwrap();
        let filter = SyncFilter::attach(dir.path(), dir.path().join("client")).unwrap();

        let table =
            CallbackTable::with_entries(Arc::new(NoopCallbacks), vec![CallbackEntry::FetchData]);
        assert!(matches!(
            filter.connect(table),
            Err(FilterError::UnterminatedCallbackTable)
        ));

        let key = filter
            .connect(CallbackTable::standard(Arc::new(NoopCallbacks)))
            .unwrap();
        assert!(filter.is_connected());
        filter.disconnect(key).unwrap();
        assert!(!filter.is_connected());
    }

    #[test]
    fn disconnect_rejects_stale_key() {
        let dir = tempdir().unwrap();
        let filter = SyncFilter::attach(dir.path(), dir.path().join("client")).unwrap();
        let key = filter
            .connect(CallbackTable::standard(Arc::new(NoopCallbacks)))
            .unwrap();
        assert!(matches!(
            filter.disconnect(key + 1),
            Err(FilterError::NotConnected)
        ));
        filter.disconnect(key).unwrap();
    }

    #[tokio::test]
    async fn handler_that_never_responds_fails_the_request() {
        let dir = tempdir().unwrap();
        let client = dir.path().join("client");
        std::fs::create_dir_all(&client).unwrap();
        let filter = SyncFilter::attach(dir.path(), client.clone()).unwrap();
        filter
            .connect(CallbackTable::standard(Arc::new(NoopCallbacks)))
            .unwrap();

        let target = client.join("a.txt");
        std::fs::write(&target, b"").unwrap();
        let record = PlaceholderRecord::new(FileIdentity::from_relative("a.txt"), false);
        filter.write_record(&target, &record).unwrap();

        let err = filter.request_hydration(&target, 0, 8).await.unwrap_err();
        assert!(matches!(
            err,
            FilterError::TransferFailed(TransferStatus::Unsuccessful)
        ));
    }

    #[tokio::test]
    async fn pin_events_reach_the_subscriber() {
        let dir = tempdir().unwrap();
        let client = dir.path().join("client");
        std::fs::create_dir_all(&client).unwrap();
        let filter = SyncFilter::attach(dir.path(), client.clone()).unwrap();
        let mut rx = filter.subscribe_pins();

        let target = client.join("a.txt");
        std::fs::write(&target, b"x").unwrap();
        filter
            .write_record(
                &target,
                &PlaceholderRecord::new(FileIdentity::from_relative("a.txt"), false),
            )
            .unwrap();

        filter.set_pin_state(&target, PinChange::Pinned).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.relative, "a.txt");
        assert_eq!(event.change, PinChange::Pinned);
        assert!(filter.record(&target).unwrap().unwrap().state.is_pinned);
    }
}
