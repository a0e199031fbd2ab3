use super::*;
use crate::sync::local_events::LocalEvent;
use nuvii_filter::SyncFilter;
use std::time::Duration as StdDuration;
use tempfile::tempdir;
use tokio::sync::broadcast;

struct Rig {
    engine: Arc<ClientSyncEngine>,
    store: Arc<PlaceholderStore>,
    paths: PathMap,
    events: SyncEvents,
}

fn fast_params() -> EngineParams {
    EngineParams {
        debounce: StdDuration::from_millis(40),
        move_window: StdDuration::from_secs(2),
        suppression_ttl: StdDuration::from_secs(2),
        max_retries: 3,
    }
}

fn make_rig(dir: &Path, params: EngineParams) -> Rig {
    let server = dir.join("server");
    let client = dir.join("client");
    std::fs::create_dir_all(&server).unwrap();
    std::fs::create_dir_all(&client).unwrap();
    let filter = SyncFilter::attach(&dir.join("state"), client.clone()).unwrap();
    let store = Arc::new(PlaceholderStore::new(filter, server.clone(), client.clone()));
    let paths = PathMap::new(server, client);
    let events = SyncEvents::default();
    let engine = ClientSyncEngine::new(paths.clone(), Arc::clone(&store), events.clone(), params);
    Rig {
        engine,
        store,
        paths,
        events,
    }
}

async fn settle() {
    tokio::time::sleep(StdDuration::from_millis(300)).await;
}

fn drain_activities(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<(ActivityKind, String)> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::Activity { kind, relative } = event {
            out.push((kind, relative));
        }
    }
    out
}

fn drain_failures(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SyncEvent::Failed { relative, .. } = event {
            out.push(relative);
        }
    }
    out
}

include!("part1.rs");
include!("part2.rs");
include!("part3.rs");
