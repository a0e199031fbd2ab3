use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::FilterError;
use crate::identity::FileIdentity;

/// Mirrored attribute bits, matching the shell's attribute word.
pub mod attributes {
    pub const READONLY: u32 = 0x0001;
    pub const HIDDEN: u32 = 0x0002;
    pub const SYSTEM: u32 = 0x0004;
    pub const DIRECTORY: u32 = 0x0010;
    pub const ARCHIVE: u32 = 0x0020;
    pub const TEMPORARY: u32 = 0x0100;
}

/// The shell-visible state vector of one placeholder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceholderState {
    pub is_placeholder: bool,
    pub is_in_sync: bool,
    pub is_partially_hydrated: bool,
    pub is_offline: bool,
    pub is_pinned: bool,
    pub is_unpinned: bool,
}

/// Filter-owned metadata for one entry under the sync root.
///
/// The record is the durable half of a placeholder: identity, state vector,
/// and the basic attributes mirrored from the server entry. Everything else
/// about a placeholder lives in the file itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderRecord {
    pub identity: FileIdentity,
    pub state: PlaceholderState,
    pub size: u64,
    pub attributes: u32,
    pub is_directory: bool,
    /// Directories created by the provider carry eager children; on-demand
    /// population stays disabled for them.
    pub on_demand_population: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub modified: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub accessed: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub changed: Option<OffsetDateTime>,
}

impl PlaceholderRecord {
    pub fn new(identity: FileIdentity, is_directory: bool) -> Self {
        Self {
            identity,
            state: PlaceholderState {
                is_placeholder: true,
                ..PlaceholderState::default()
            },
            size: 0,
            attributes: if is_directory {
                attributes::DIRECTORY
            } else {
                attributes::ARCHIVE
            },
            is_directory,
            on_demand_population: false,
            created: None,
            modified: None,
            accessed: None,
            changed: None,
        }
    }

    pub fn mirror_times(&mut self, meta: &fs::Metadata) {
        self.size = if meta.is_dir() { 0 } else { meta.len() };
        self.created = meta.created().ok().map(OffsetDateTime::from);
        self.modified = meta.modified().ok().map(OffsetDateTime::from);
        self.accessed = meta.accessed().ok().map(OffsetDateTime::from);
        // The change time is not exposed portably; mirror the write time.
        self.changed = self.modified;
    }

    pub fn has_attribute(&self, bit: u32) -> bool {
        self.attributes & bit != 0
    }
}

/// Per-root record store under the filter state directory.
///
/// Records are keyed by the entry's client-relative path, folded to lower
/// case so lookups match the case-insensitive semantics of the shell. A
/// directory's children live in a subdirectory next to its own record, so
/// renames and deletes can move or drop a whole subtree in one pass.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    pub fn open(root: PathBuf) -> Result<Self, FilterError> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn read(&self, relative: &str) -> Result<Option<PlaceholderRecord>, FilterError> {
        let path = self.record_path(relative);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn write(&self, relative: &str, record: &PlaceholderRecord) -> Result<(), FilterError> {
        let path = self.record_path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_vec_pretty(record)?)?;
        Ok(())
    }

    pub fn remove(&self, relative: &str) -> Result<(), FilterError> {
        let path = self.record_path(relative);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let children = self.children_dir(relative);
        match fs::remove_dir_all(&children) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Moves a record (and any child records) to a new relative key.
    pub fn rename(&self, old_relative: &str, new_relative: &str) -> Result<(), FilterError> {
        let old_path = self.record_path(old_relative);
        let new_path = self.record_path(new_relative);
        if old_path == new_path {
            return Ok(());
        }
        if let Some(parent) = new_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&old_path, &new_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let old_children = self.children_dir(old_relative);
        if old_children.is_dir() {
            let new_children = self.children_dir(new_relative);
            match fs::remove_dir_all(&new_children) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            fs::rename(&old_children, &new_children)?;
        }
        Ok(())
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.record_path(relative).is_file()
    }

    fn record_path(&self, relative: &str) -> PathBuf {
        let mut path = self.root.clone();
        let key = store_key(relative);
        if key.is_empty() {
            return path.join("_root.json");
        }
        for part in key.split('/') {
            path.push(part);
        }
        let suffix = match path.extension() {
            Some(ext) => format!("{}.json", ext.to_string_lossy()),
            None => "json".to_string(),
        };
        path.set_extension(suffix);
        path
    }

    fn children_dir(&self, relative: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in store_key(relative).split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }
}

fn store_key(relative: &str) -> String {
    relative
        .replace('\\', "/")
        .trim_matches('/')
        .to_lowercase()
}

pub(crate) fn relative_of(root: &Path, abs: &Path) -> Result<String, FilterError> {
    let tail = abs
        .strip_prefix(root)
        .map_err(|_| FilterError::OutOfRoot(abs.to_path_buf()))?;
    Ok(tail.to_string_lossy().replace('\\', "/"))
}
