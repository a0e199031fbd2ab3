use std::future::Future;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use nuvii_filter::{FetchCallbacks, FetchRequest, SyncFilter, TransferKey, TransferStatus};

/// Streaming chunk size for on-demand data transfers.
const CHUNK_SIZE: usize = 64 * 1024;

/// Services `FetchData` callbacks by streaming bytes out of the server tree.
///
/// Each invocation is independent: it opens its own handle, streams the
/// requested range in fixed-size chunks with a progress report per chunk,
/// and always lands exactly one terminal transfer: success covering the
/// bytes actually read, or a failure covering the full required length so
/// the blocked reader is released.
pub struct HydrationHandler {
    server_root: PathBuf,
}

impl HydrationHandler {
    pub fn new(server_root: PathBuf) -> Self {
        Self { server_root }
    }

    async fn stream(&self, filter: &Arc<SyncFilter>, request: &FetchRequest) -> TransferOutcome {
        if request.identity.is_empty() {
            return TransferOutcome::Fail(TransferStatus::ObjectNotFound);
        }
        let relative = match request.identity.to_relative() {
            Ok(relative) => relative,
            Err(_) => return TransferOutcome::Fail(TransferStatus::ObjectNotFound),
        };
        let source = self.server_root.join(&relative);

        let mut file = match tokio::fs::File::open(&source).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return TransferOutcome::Fail(TransferStatus::ObjectNotFound);
            }
            Err(_) => return TransferOutcome::Fail(TransferStatus::Unsuccessful),
        };
        if file.seek(SeekFrom::Start(request.required_offset)).await.is_err() {
            return TransferOutcome::Fail(TransferStatus::Unsuccessful);
        }

        let mut sent: u64 = 0;
        let mut buf = vec![0u8; CHUNK_SIZE];
        while sent < request.required_length {
            if filter.is_cancelled(request.transfer_key) {
                return TransferOutcome::Fail(TransferStatus::Unsuccessful);
            }
            let want = (request.required_length - sent).min(CHUNK_SIZE as u64) as usize;
            let read = match file.read(&mut buf[..want]).await {
                Ok(read) => read,
                Err(_) => return TransferOutcome::Fail(TransferStatus::Unsuccessful),
            };
            if read == 0 {
                // Early end of file: done with what exists.
                break;
            }
            if filter
                .transfer_data(
                    request.transfer_key,
                    request.required_offset + sent,
                    &buf[..read],
                )
                .await
                .is_err()
            {
                return TransferOutcome::Fail(TransferStatus::Unsuccessful);
            }
            sent += read as u64;
            filter.report_progress(request.transfer_key, request.required_length, sent);
        }
        TransferOutcome::Success(sent)
    }
}

enum TransferOutcome {
    Success(u64),
    Fail(TransferStatus),
}

impl FetchCallbacks for HydrationHandler {
    fn fetch_data(
        &self,
        filter: Arc<SyncFilter>,
        request: FetchRequest,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let server_root = self.server_root.clone();
        Box::pin(async move {
            let handler = HydrationHandler::new(server_root);
            let outcome = handler.stream(&filter, &request).await;
            let result = match outcome {
                TransferOutcome::Success(sent) => {
                    filter.complete_transfer(request.transfer_key, TransferStatus::Success, sent)
                }
                TransferOutcome::Fail(status) => {
                    filter.complete_transfer(request.transfer_key, status, request.required_length)
                }
            };
            if let Err(err) = result {
                eprintln!(
                    "[nuviid] fetch {} failed to finalize: {err}",
                    request.correlation_vector
                );
            }
        })
    }

    fn cancel_fetch_data(&self, transfer_key: TransferKey) {
        eprintln!("[nuviid] fetch cancelled: transfer_key={transfer_key}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nuvii_filter::{CallbackTable, FilterError, PlaceholderStore};
    use std::path::Path;
    use tempfile::tempdir;

    async fn setup(dir: &Path) -> (Arc<SyncFilter>, PlaceholderStore) {
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
        let store = PlaceholderStore::new(Arc::clone(&filter), server, client);
        (filter, store)
    }

    #[tokio::test]
    async fn hydration_yields_byte_equal_content() {
        let dir = tempdir().unwrap();
        let (_filter, store) = setup(dir.path()).await;
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(store.server_root().join("big.bin"), &payload).unwrap();

        let client_file = store.client_root().join("big.bin");
        store
            .create_single(&store.server_root().join("big.bin"), &client_file)
            .await
            .unwrap();
        assert_eq!(std::fs::metadata(&client_file).unwrap().len(), 0);

        let covered = store.hydrate(&client_file, 0, -1).await.unwrap();
        assert_eq!(covered, payload.len() as u64);
        assert_eq!(std::fs::read(&client_file).unwrap(), payload);

        let state = store.state(&client_file).unwrap().unwrap();
        assert!(!state.is_offline);
        assert!(!state.is_partially_hydrated);
    }

    #[tokio::test]
    async fn zero_byte_file_round_trips_with_one_terminal_transfer() {
        let dir = tempdir().unwrap();
        let (_filter, store) = setup(dir.path()).await;
        std::fs::write(store.server_root().join("empty.txt"), b"").unwrap();

        let client_file = store.client_root().join("empty.txt");
        store
            .create_single(&store.server_root().join("empty.txt"), &client_file)
            .await
            .unwrap();

        let covered = store.hydrate(&client_file, 0, -1).await.unwrap();
        assert_eq!(covered, 0);
        assert_eq!(std::fs::metadata(&client_file).unwrap().len(), 0);
        assert!(!store.state(&client_file).unwrap().unwrap().is_offline);
    }

    #[tokio::test]
    async fn partial_range_marks_partial_hydration() {
        let dir = tempdir().unwrap();
        let (_filter, store) = setup(dir.path()).await;
        std::fs::write(store.server_root().join("a.bin"), vec![7u8; 1000]).unwrap();

        let client_file = store.client_root().join("a.bin");
        store
            .create_single(&store.server_root().join("a.bin"), &client_file)
            .await
            .unwrap();

        let covered = store.hydrate(&client_file, 100, 50).await.unwrap();
        assert_eq!(covered, 50);
        let state = store.state(&client_file).unwrap().unwrap();
        assert!(!state.is_offline);
        assert!(state.is_partially_hydrated);
    }

    #[tokio::test]
    async fn early_eof_succeeds_with_bytes_read() {
        let dir = tempdir().unwrap();
        let (_filter, store) = setup(dir.path()).await;
        std::fs::write(store.server_root().join("short.txt"), b"abc").unwrap();

        let client_file = store.client_root().join("short.txt");
        store
            .create_single(&store.server_root().join("short.txt"), &client_file)
            .await
            .unwrap();
        // The server file shrank after the placeholder was created.
        let covered = store.hydrate(&client_file, 0, 10).await.unwrap();
        assert_eq!(covered, 3);
        assert_eq!(std::fs::read(&client_file).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn missing_server_file_fails_with_not_found() {
        let dir = tempdir().unwrap();
        let (_filter, store) = setup(dir.path()).await;
        std::fs::write(store.server_root().join("gone.txt"), b"x").unwrap();

        let client_file = store.client_root().join("gone.txt");
        store
            .create_single(&store.server_root().join("gone.txt"), &client_file)
            .await
            .unwrap();
        std::fs::remove_file(store.server_root().join("gone.txt")).unwrap();

        let err = store.hydrate(&client_file, 0, -1).await.unwrap_err();
        assert!(matches!(
            err,
            FilterError::TransferFailed(TransferStatus::ObjectNotFound)
        ));
    }

    #[tokio::test]
    async fn dehydrate_then_rehydrate_is_lossless() {
        let dir = tempdir().unwrap();
        let (_filter, store) = setup(dir.path()).await;
        std::fs::write(store.server_root().join("doc.txt"), b"round trip").unwrap();

        let client_file = store.client_root().join("doc.txt");
        store
            .create_single(&store.server_root().join("doc.txt"), &client_file)
            .await
            .unwrap();

        store.hydrate(&client_file, 0, -1).await.unwrap();
        assert_eq!(std::fs::read(&client_file).unwrap(), b"round trip");

        store.dehydrate(&client_file, 0, -1).await.unwrap();
        assert_eq!(std::fs::metadata(&client_file).unwrap().len(), 0);
        assert!(store.state(&client_file).unwrap().unwrap().is_offline);

        store.hydrate(&client_file, 0, -1).await.unwrap();
        assert_eq!(std::fs::read(&client_file).unwrap(), b"round trip");
    }

    #[tokio::test]
    async fn stale_identity_misses_after_server_rename() {
        let dir = tempdir().unwrap();
        let (_filter, store) = setup(dir.path()).await;
        std::fs::write(store.server_root().join("old.txt"), b"payload").unwrap();

        let client_file = store.client_root().join("old.txt");
        store
            .create_single(&store.server_root().join("old.txt"), &client_file)
            .await
            .unwrap();

        // Server-side rename without an identity rewrite: hydration must
        // miss until update_identity points at the new name.
        std::fs::rename(
            store.server_root().join("old.txt"),
            store.server_root().join("new.txt"),
        )
        .unwrap();
        assert!(store.hydrate(&client_file, 0, -1).await.is_err());

        store.update_identity(&client_file, "new.txt").unwrap();
        store.hydrate(&client_file, 0, -1).await.unwrap();
        assert_eq!(std::fs::read(&client_file).unwrap(), b"payload");
    }
}
