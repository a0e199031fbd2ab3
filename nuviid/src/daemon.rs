use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use nuvii_filter::{
    CallbackTable, PlaceholderStore, RegistrationStore, SyncFilter, SyncRootIdentity,
};

use crate::registrar::{LogSearchIndexer, LogShellServiceHost, Registrar};
use crate::sync::applier::ServerApplier;
use crate::sync::engine::{ClientSyncEngine, EngineParams};
use crate::sync::events::{LogShellNotifier, SyncEvents};
use crate::sync::hydration::HydrationHandler;
use crate::sync::local_events::{spawn_local_watcher, EventClassifier};
use crate::sync::paths::PathMap;
use crate::sync::pin_watcher::PinWatcher;
use crate::sync::remote_feed::{RemoteChangeFeed, WatcherRemoteFeed};

pub const PROVIDER_ID: &str = "NuviiSync";

const DEFAULT_DISPLAY_NAME: &str = "Nuvii";
const DEFAULT_ACCOUNT_NAME: &str = "NuviiAccount";
const DEFAULT_USER_SID: &str = "S-1-5-21-0-0-0-1001";
const DEFAULT_DEBOUNCE_MS: u64 = 3_000;
const DEFAULT_MOVE_WINDOW_MS: u64 = 5_000;
const DEFAULT_SUPPRESSION_TTL_MS: u64 = 5_000;
const DEFAULT_MAX_RETRIES: u64 = 3;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub server_root: PathBuf,
    pub client_root: PathBuf,
    pub state_dir: PathBuf,
    pub account_name: String,
    pub user_sid: String,
    pub display_name: String,
    pub params: EngineParams,
}

impl DaemonConfig {
    /// Reads the daemon configuration from the environment. The two roots
    /// are required; everything else has defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let server_root = std::env::var("NUVII_SERVER_DIR")
            .map(|value| expand_with_home(&value, &home))
            .context("NUVII_SERVER_DIR is not set")?;
        let client_root = std::env::var("NUVII_CLIENT_DIR")
            .map(|value| expand_with_home(&value, &home))
            .context("NUVII_CLIENT_DIR is not set")?;
        let state_dir = match std::env::var("NUVII_STATE_DIR") {
            Ok(value) => expand_with_home(&value, &home),
            Err(_) => RegistrationStore::default_state_dir()
                .context("no data directory for filter state")?,
        };
        let account_name =
            std::env::var("NUVII_ACCOUNT").unwrap_or_else(|_| DEFAULT_ACCOUNT_NAME.to_string());
        let user_sid =
            std::env::var("NUVII_USER_SID").unwrap_or_else(|_| DEFAULT_USER_SID.to_string());
        let display_name =
            std::env::var("NUVII_DISPLAY_NAME").unwrap_or_else(|_| DEFAULT_DISPLAY_NAME.to_string());

        let params = EngineParams {
            debounce: Duration::from_millis(read_u64_env("NUVII_DEBOUNCE_MS", DEFAULT_DEBOUNCE_MS)),
            move_window: Duration::from_millis(read_u64_env(
                "NUVII_MOVE_WINDOW_MS",
                DEFAULT_MOVE_WINDOW_MS,
            )),
            suppression_ttl: Duration::from_millis(read_u64_env(
                "NUVII_SUPPRESSION_TTL_MS",
                DEFAULT_SUPPRESSION_TTL_MS,
            )),
            max_retries: read_u64_env("NUVII_MAX_RETRIES", DEFAULT_MAX_RETRIES) as u32,
        };

        let config = Self {
            server_root,
            client_root,
            state_dir,
            account_name,
            user_sid,
            display_name,
            params,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.server_root.is_absolute() || !self.client_root.is_absolute() {
            anyhow::bail!("server and client roots must be absolute paths");
        }
        if PathMap::contains(&self.server_root, &self.client_root)
            || PathMap::contains(&self.client_root, &self.server_root)
        {
            anyhow::bail!("server and client roots must not contain each other");
        }
        Ok(())
    }

    pub fn identity(&self) -> SyncRootIdentity {
        SyncRootIdentity {
            provider_id: PROVIDER_ID.to_string(),
            user_sid: self.user_sid.clone(),
            account_name: self.account_name.clone(),
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    filter: Arc<SyncFilter>,
    store: Arc<PlaceholderStore>,
    paths: PathMap,
    events: SyncEvents,
    engine: Arc<ClientSyncEngine>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.server_root)
            .await
            .with_context(|| format!("failed to create server root {:?}", config.server_root))?;
        tokio::fs::create_dir_all(&config.client_root)
            .await
            .with_context(|| format!("failed to create client root {:?}", config.client_root))?;

        let filter = SyncFilter::attach(&config.state_dir, config.client_root.clone())
            .context("failed to attach cloud filter state")?;
        let store = Arc::new(PlaceholderStore::new(
            Arc::clone(&filter),
            config.server_root.clone(),
            config.client_root.clone(),
        ));
        let paths = PathMap::new(config.server_root.clone(), config.client_root.clone());
        let events = SyncEvents::default();
        let engine = ClientSyncEngine::new(
            paths.clone(),
            Arc::clone(&store),
            events.clone(),
            config.params,
        );

        Ok(Self {
            config,
            filter,
            store,
            paths,
            events,
            engine,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        eprintln!(
            "[nuviid] starting: server={}, client={}",
            self.config.server_root.display(),
            self.config.client_root.display()
        );

        let registrations = RegistrationStore::open(&self.config.state_dir)
            .context("failed to open registration store")?;
        let registrar = Registrar::new(
            self.config.identity(),
            self.config.display_name.clone(),
            "nuviid.exe,0".to_string(),
            Arc::clone(&self.filter),
            Arc::clone(&self.store),
            registrations,
            Arc::new(LogShellServiceHost),
            Arc::new(LogSearchIndexer),
        );
        let handler = HydrationHandler::new(self.config.server_root.clone());
        let connection_key = registrar
            .start(CallbackTable::standard(Arc::new(handler)))
            .await?;

        // Pin watcher first so gestures during startup are not lost.
        let pin_rx = self.filter.subscribe_pins();
        let pin_handle = PinWatcher::new(
            Arc::clone(&self.store),
            self.events.clone(),
            Arc::new(LogShellNotifier),
        )
        .spawn(pin_rx);

        let classifier = Arc::new(EventClassifier::new(Arc::clone(&self.store)));
        let (watcher_handle, mut local_rx) =
            spawn_local_watcher(self.config.client_root.clone(), classifier);
        let engine = Arc::clone(&self.engine);
        let ingest_handle = tokio::spawn(async move {
            while let Some(event) = local_rx.recv().await {
                engine.ingest(event).await;
            }
        });

        let mut feed = WatcherRemoteFeed::new(self.config.server_root.clone());
        let remote_rx = feed.start().context("remote change feed failed to start")?;
        let applier = ServerApplier::new(
            self.paths.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.engine),
            self.events.clone(),
            Arc::new(LogShellNotifier),
        );
        let applier_handle = tokio::spawn(applier.run(remote_rx));

        eprintln!("[nuviid] running; press ctrl-c to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        eprintln!("[nuviid] shutting down");

        // Reverse of the start order; the registration itself stays.
        feed.stop();
        applier_handle.abort();
        ingest_handle.abort();
        watcher_handle.abort();
        pin_handle.abort();
        self.engine.dispose().await;
        registrar.shutdown(connection_key);

        Ok(())
    }
}

pub fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_tilde_against_home() {
        let home = PathBuf::from("/home/tester");
        assert_eq!(
            expand_with_home("~/Nuvii", &home),
            PathBuf::from("/home/tester/Nuvii")
        );
        assert_eq!(expand_with_home("~", &home), home);
        assert_eq!(expand_with_home("/abs", &home), PathBuf::from("/abs"));
    }

    #[test]
    fn numeric_env_falls_back_to_default() {
        assert_eq!(read_u64_env("NUVII_NO_SUCH_ENV", 42), 42);
    }

    #[test]
    fn nested_roots_are_rejected() {
        let config = DaemonConfig {
            server_root: PathBuf::from("/data/nuvii"),
            client_root: PathBuf::from("/data/nuvii/client"),
            state_dir: PathBuf::from("/tmp/state"),
            account_name: DEFAULT_ACCOUNT_NAME.into(),
            user_sid: DEFAULT_USER_SID.into(),
            display_name: DEFAULT_DISPLAY_NAME.into(),
            params: EngineParams::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_roots_are_rejected() {
        let config = DaemonConfig {
            server_root: PathBuf::from("srv"),
            client_root: PathBuf::from("/client"),
            state_dir: PathBuf::from("/tmp/state"),
            account_name: DEFAULT_ACCOUNT_NAME.into(),
            user_sid: DEFAULT_USER_SID.into(),
            display_name: DEFAULT_DISPLAY_NAME.into(),
            params: EngineParams::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn identity_carries_the_provider_prefix() {
        let config = DaemonConfig {
            server_root: PathBuf::from("/srv"),
            client_root: PathBuf::from("/client"),
            state_dir: PathBuf::from("/tmp/state"),
            account_name: "NuviiAccount".into(),
            user_sid: "S-1-5-21-7-8-9-500".into(),
            display_name: DEFAULT_DISPLAY_NAME.into(),
            params: EngineParams::default(),
        };
        assert_eq!(
            config.identity().registration_id(),
            "NuviiSync!S-1-5-21-7-8-9-500!NuviiAccount"
        );
    }
}
