use std::path::Path;
use std::sync::Arc;

use nuvii_filter::{attributes, PlaceholderStore};

/// Decides whether a path takes part in sync at all.
///
/// Editors churn out owner-locks, swap files, and atomic-save temporaries;
/// none of them belong on the server. Classification errors default to
/// "not temp" so a real file is never silently dropped.
pub struct TempFileOracle {
    store: Option<Arc<PlaceholderStore>>,
}

impl TempFileOracle {
    pub fn new(store: Arc<PlaceholderStore>) -> Self {
        Self { store: Some(store) }
    }

    /// An oracle without attribute access, for contexts where no filter is
    /// attached.
    pub fn name_only() -> Self {
        Self { store: None }
    }

    pub fn is_temp(&self, path: &Path) -> bool {
        if self.has_temporary_attribute(path) {
            return true;
        }
        let Some(name) = file_name(path) else {
            return false;
        };
        is_temp_name(&name) || is_temp_heuristic(&name, self.is_hidden(path, &name))
    }

    /// Name-pattern classification only, for deletion events where the file
    /// no longer exists and attributes cannot be read.
    pub fn is_temp_by_name(&self, path: &Path) -> bool {
        let Some(name) = file_name(path) else {
            return false;
        };
        is_temp_name(&name) || is_temp_heuristic(&name, name.starts_with('.'))
    }

    fn has_temporary_attribute(&self, path: &Path) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        if !path.exists() {
            return false;
        }
        matches!(
            store.record(path),
            Ok(Some(record)) if record.has_attribute(attributes::TEMPORARY)
        )
    }

    fn is_hidden(&self, path: &Path, name: &str) -> bool {
        if name.starts_with('.') {
            return true;
        }
        if let Some(store) = &self.store
            && let Ok(Some(record)) = store.record(path)
        {
            return record.has_attribute(attributes::HIDDEN);
        }
        false
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

const TEMP_EXTENSIONS: &[&str] = &[
    "tmp", "temp", "bak", "backup", "old", "swp", "swo", "swn", "lock", "lck", "asd",
];

const NOISE_NAMES: &[&str] = &["desktop.ini", "thumbs.db", ".ds_store"];

/// The known-pattern layer: office locks, editor backups, system noise.
pub fn is_temp_name(name: &str) -> bool {
    let lower = name.to_lowercase();

    // Office owner-lock and office atomic-save temps.
    if lower.starts_with("~$") {
        return true;
    }
    if lower.starts_with('~') && lower.ends_with(".tmp") {
        return true;
    }
    // LibreOffice lock files: .~lock.<name>#
    if lower.starts_with(".~lock.") && lower.ends_with('#') {
        return true;
    }

    // Blender numbered backups and the in-progress save marker.
    if let Some(idx) = lower.rfind(".blend") {
        let tail = &lower[idx + ".blend".len()..];
        if tail == "@" {
            return true;
        }
        if !tail.is_empty()
            && tail.chars().all(|c| c.is_ascii_digit())
            && matches!(tail.parse::<u32>(), Ok(n) if (1..=32).contains(&n))
        {
            return true;
        }
    }

    if let Some((_, ext)) = lower.rsplit_once('.')
        && TEMP_EXTENSIONS.contains(&ext)
    {
        return true;
    }

    if lower.ends_with('~') {
        return true;
    }

    NOISE_NAMES.contains(&lower.as_str()) || name == "Icon\r"
}

/// The heuristic layer, consulted after the pattern table.
fn is_temp_heuristic(name: &str, hidden: bool) -> bool {
    // Atomic-save temporaries: exactly eight hex characters, no extension.
    if name.len() == 8 && !name.contains('.') && name.chars().all(|c| c.is_ascii_hexdigit()) {
        return true;
    }
    if hidden && name.starts_with('~') {
        return true;
    }
    if name.starts_with('.') {
        let lower = name.to_lowercase();
        if name.starts_with(".#")
            || lower.contains("~lock")
            || lower.contains(".tmp")
            || lower.contains(".temp")
            || lower.contains(".swp")
        {
            return true;
        }
    }
    false
}
