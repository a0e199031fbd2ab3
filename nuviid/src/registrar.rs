use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use nuvii_filter::{
    CallbackTable, ConnectionKey, PlaceholderStore, RegistrationStore, SyncFilter,
    SyncRootIdentity, SyncRootRegistration,
};

/// Hosts the shell-integration class objects (custom state, thumbnails,
/// context menu). External collaborator; the default only logs.
pub trait ShellServiceHost: Send + Sync {
    fn start(&self) -> anyhow::Result<()>;
    fn stop(&self);
    fn restart_shell(&self) -> anyhow::Result<()>;
}

/// Search-indexer scope registration for the client tree.
pub trait SearchIndexer: Send + Sync {
    fn add_scope(&self, path: &Path) -> anyhow::Result<()>;
    fn remove_scope(&self, path: &Path);
}

pub struct LogShellServiceHost;

impl ShellServiceHost for LogShellServiceHost {
    fn start(&self) -> anyhow::Result<()> {
        eprintln!("[nuviid] shell service host started");
        Ok(())
    }

    fn stop(&self) {
        eprintln!("[nuviid] shell service host stopped");
    }

    fn restart_shell(&self) -> anyhow::Result<()> {
        eprintln!("[nuviid] shell restart requested");
        Ok(())
    }
}

pub struct LogSearchIndexer;

impl SearchIndexer for LogSearchIndexer {
    fn add_scope(&self, path: &Path) -> anyhow::Result<()> {
        eprintln!("[nuviid] search indexer scope added: {}", path.display());
        Ok(())
    }

    fn remove_scope(&self, path: &Path) {
        eprintln!("[nuviid] search indexer scope removed: {}", path.display());
    }
}

/// Owns the sync-root registration and the filter connection for the
/// process lifetime.
///
/// Start-up is strictly ordered (shell host, indexer scope, registration,
/// callback connection, initial population) and each step must succeed
/// before the next. Shutdown reverses everything except the registration
/// itself, which persists until an operator unregisters.
pub struct Registrar {
    identity: SyncRootIdentity,
    display_name: String,
    icon_resource: String,
    filter: Arc<SyncFilter>,
    store: Arc<PlaceholderStore>,
    registrations: RegistrationStore,
    shell: Arc<dyn ShellServiceHost>,
    indexer: Arc<dyn SearchIndexer>,
}

impl Registrar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: SyncRootIdentity,
        display_name: String,
        icon_resource: String,
        filter: Arc<SyncFilter>,
        store: Arc<PlaceholderStore>,
        registrations: RegistrationStore,
        shell: Arc<dyn ShellServiceHost>,
        indexer: Arc<dyn SearchIndexer>,
    ) -> Self {
        Self {
            identity,
            display_name,
            icon_resource,
            filter,
            store,
            registrations,
            shell,
            indexer,
        }
    }

    pub fn registration_id(&self) -> String {
        self.identity.registration_id()
    }

    /// Runs the ordered start-up sequence and returns the connection key
    /// the callbacks are pinned under.
    pub async fn start(&self, callbacks: CallbackTable) -> anyhow::Result<ConnectionKey> {
        self.shell
            .start()
            .context("shell service host failed to start")?;
        self.indexer
            .add_scope(self.store.client_root())
            .context("search indexer scope registration failed")?;

        let id = self.registration_id();
        match self
            .registrations
            .load(&id)
            .context("failed to read sync-root registration")?
        {
            Some(existing) => {
                eprintln!(
                    "[nuviid] reattached to sync root {id} (registered {})",
                    existing.registered_at
                );
            }
            None => {
                let registration = SyncRootRegistration::new(
                    self.identity.clone(),
                    self.display_name.clone(),
                    self.icon_resource.clone(),
                    self.store.client_root().to_path_buf(),
                    self.store.server_root().to_path_buf(),
                );
                self.registrations
                    .save(&registration)
                    .context("failed to persist sync-root registration")?;
                eprintln!("[nuviid] registered sync root {id}");
            }
        }

        let key = self
            .filter
            .connect(callbacks)
            .context("failed to connect filter callbacks")?;

        let populated = self
            .store
            .create_tree(self.store.server_root(), "", self.store.client_root())
            .await
            .context("initial placeholder population failed")?;
        eprintln!("[nuviid] initial population complete: {populated} entries");

        Ok(key)
    }

    /// Reverse teardown. The registration record stays.
    pub fn shutdown(&self, key: ConnectionKey) {
        if let Err(err) = self.filter.disconnect(key) {
            eprintln!("[nuviid] filter disconnect failed: {err}");
        }
        self.indexer.remove_scope(self.store.client_root());
        self.shell.stop();
    }

    /// Explicit unregistration, not part of normal shutdown.
    pub fn unregister(&self) -> anyhow::Result<()> {
        self.registrations
            .remove(&self.registration_id())
            .context("failed to remove sync-root registration")
    }

    /// Operator action: drop every provider-prefixed registration and
    /// restart the shell so stale glyph state clears.
    pub fn force_cleanup(
        registrations: &RegistrationStore,
        shell: &dyn ShellServiceHost,
        provider_id: &str,
    ) -> anyhow::Result<usize> {
        let removed = registrations
            .remove_by_provider(provider_id)
            .context("failed to remove provider registrations")?;
        shell.restart_shell()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::hydration::HydrationHandler;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn identity() -> SyncRootIdentity {
        SyncRootIdentity {
            provider_id: "NuviiSync".into(),
            user_sid: "S-1-5-21-0-0-0-1001".into(),
            account_name: "NuviiAccount".into(),
        }
    }

    fn registrar(dir: &Path) -> (Registrar, PathBuf, PathBuf) {
        let server = dir.join("server");
        let client = dir.join("client");
        std::fs::create_dir_all(&server).unwrap();
        std::fs::create_dir_all(&client).unwrap();
        let state = dir.join("state");
        let filter = SyncFilter::attach(&state, client.clone()).unwrap();
        let store = Arc::new(PlaceholderStore::new(
            Arc::clone(&filter),
            server.clone(),
            client.clone(),
        ));
        let registrations = RegistrationStore::open(&state).unwrap();
        let registrar = Registrar::new(
            identity(),
            "Nuvii".into(),
            "nuviid.exe,0".into(),
            filter,
            store,
            registrations,
            Arc::new(LogShellServiceHost),
            Arc::new(LogSearchIndexer),
        );
        (registrar, server, client)
    }

    fn callbacks(server: &Path) -> CallbackTable {
        CallbackTable::standard(Arc::new(HydrationHandler::new(server.to_path_buf())))
    }

    #[tokio::test]
    async fn start_registers_connects_and_populates() {
        let dir = tempdir().unwrap();
        let (registrar, server, client) = registrar(dir.path());
        std::fs::create_dir_all(server.join("Docs")).unwrap();
        std::fs::write(server.join("Docs/A.txt"), b"hello").unwrap();

        let key = registrar.start(callbacks(&server)).await.unwrap();
        assert!(registrar.filter.is_connected());
        assert!(client.join("Docs/A.txt").exists());
        assert!(
            registrar
                .registrations
                .load(&registrar.registration_id())
                .unwrap()
                .is_some()
        );

        registrar.shutdown(key);
        assert!(!registrar.filter.is_connected());
        // The registration record survives normal shutdown.
        assert!(
            registrar
                .registrations
                .load(&registrar.registration_id())
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn second_start_reattaches_to_existing_registration() {
        let dir = tempdir().unwrap();
        let (registrar, server, _client) = registrar(dir.path());

        let key = registrar.start(callbacks(&server)).await.unwrap();
        let first = registrar
            .registrations
            .load(&registrar.registration_id())
            .unwrap()
            .unwrap();
        registrar.shutdown(key);

        let key = registrar.start(callbacks(&server)).await.unwrap();
        let second = registrar
            .registrations
            .load(&registrar.registration_id())
            .unwrap()
            .unwrap();
        assert_eq!(first.registered_at, second.registered_at);
        registrar.shutdown(key);
    }

    #[tokio::test]
    async fn unregister_is_explicit() {
        let dir = tempdir().unwrap();
        let (registrar, server, _client) = registrar(dir.path());
        let key = registrar.start(callbacks(&server)).await.unwrap();
        registrar.shutdown(key);

        registrar.unregister().unwrap();
        assert!(
            registrar
                .registrations
                .load(&registrar.registration_id())
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn force_cleanup_removes_provider_registrations() {
        let dir = tempdir().unwrap();
        let (registrar, server, _client) = registrar(dir.path());
        let key = registrar.start(callbacks(&server)).await.unwrap();
        registrar.shutdown(key);

        let removed = Registrar::force_cleanup(
            &registrar.registrations,
            &LogShellServiceHost,
            "NuviiSync",
        )
        .unwrap();
        assert_eq!(removed, 1);
    }
}
