use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::FilterError;

/// The three-part identity a sync root registers under:
/// `{provider}!{user-sid}!{account}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRootIdentity {
    pub provider_id: String,
    pub user_sid: String,
    pub account_name: String,
}

impl SyncRootIdentity {
    pub fn registration_id(&self) -> String {
        format!(
            "{}!{}!{}",
            self.provider_id, self.user_sid, self.account_name
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HydrationPolicy {
    Full,
    Progressive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PopulationPolicy {
    AlwaysFull,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InSyncPolicy {
    None,
    CreationTimes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HardlinkPolicy {
    None,
    Allowed,
}

/// The persisted shape of one sync-root registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRootRegistration {
    pub id: String,
    pub identity: SyncRootIdentity,
    pub display_name: String,
    pub icon_resource: String,
    pub client_path: PathBuf,
    pub server_path: PathBuf,
    pub hydration_policy: HydrationPolicy,
    pub auto_dehydration_allowed: bool,
    pub population_policy: PopulationPolicy,
    pub in_sync_policy: InSyncPolicy,
    pub hardlink_policy: HardlinkPolicy,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
}

impl SyncRootRegistration {
    pub fn new(
        identity: SyncRootIdentity,
        display_name: String,
        icon_resource: String,
        client_path: PathBuf,
        server_path: PathBuf,
    ) -> Self {
        Self {
            id: identity.registration_id(),
            identity,
            display_name,
            icon_resource,
            client_path,
            server_path,
            hydration_policy: HydrationPolicy::Full,
            auto_dehydration_allowed: true,
            population_policy: PopulationPolicy::AlwaysFull,
            in_sync_policy: InSyncPolicy::CreationTimes,
            hardlink_policy: HardlinkPolicy::None,
            registered_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Registration records under the filter state directory. Registrations are
/// process-wide and survive restarts; removal is an explicit operator
/// action, never part of normal shutdown.
#[derive(Debug, Clone)]
pub struct RegistrationStore {
    dir: PathBuf,
}

impl RegistrationStore {
    pub fn open(state_dir: &Path) -> Result<Self, FilterError> {
        let dir = state_dir.join("registrations");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn default_state_dir() -> Result<PathBuf, FilterError> {
        dirs::data_dir()
            .map(|dir| dir.join("nuvii"))
            .ok_or(FilterError::MissingDataDir)
    }

    pub fn load(&self, id: &str) -> Result<Option<SyncRootRegistration>, FilterError> {
        match fs::read(self.path_for(id)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, registration: &SyncRootRegistration) -> Result<(), FilterError> {
        fs::write(
            self.path_for(&registration.id),
            serde_json::to_vec_pretty(registration)?,
        )?;
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<(), FilterError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn list(&self) -> Result<Vec<SyncRootRegistration>, FilterError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(entry.path())?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        out.sort_by(|a: &SyncRootRegistration, b: &SyncRootRegistration| a.id.cmp(&b.id));
        Ok(out)
    }

    /// Removes every registration whose id starts with `provider_id!`.
    /// Returns the number removed. This is the operator force-cleanup.
    pub fn remove_by_provider(&self, provider_id: &str) -> Result<usize, FilterError> {
        let prefix = format!("{provider_id}!");
        let mut removed = 0usize;
        for registration in self.list()? {
            if registration.id.starts_with(&prefix) {
                self.remove(&registration.id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn path_for(&self, id: &str) -> PathBuf {
        // Registration ids carry '!' and a SID; fold anything path-hostile.
        let safe: String = id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}
