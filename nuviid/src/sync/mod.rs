pub mod applier;
pub mod backoff;
pub mod engine;
pub mod events;
pub mod hydration;
pub mod local_events;
pub mod paths;
pub mod pin_watcher;
pub mod remote_feed;
pub mod tempfiles;
