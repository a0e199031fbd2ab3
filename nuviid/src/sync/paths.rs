use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path {path:?} is not under {root:?}")]
    OutOfScope { path: PathBuf, root: PathBuf },
}

/// Translates between server-relative, client-relative, and absolute paths.
///
/// Prefix matching is case-insensitive and honors component boundaries, so
/// `/data/reports-old` is not under `/data/reports`.
#[derive(Debug, Clone)]
pub struct PathMap {
    server_root: PathBuf,
    client_root: PathBuf,
}

impl PathMap {
    pub fn new(server_root: PathBuf, client_root: PathBuf) -> Self {
        Self {
            server_root,
            client_root,
        }
    }

    pub fn server_root(&self) -> &Path {
        &self.server_root
    }

    pub fn client_root(&self) -> &Path {
        &self.client_root
    }

    /// The tail of `abs` under `root` as a forward-slash relative path
    /// without a leading separator.
    pub fn to_relative(abs: &Path, root: &Path) -> Result<String, PathError> {
        let tail = strip_prefix_ci(root, abs).ok_or_else(|| PathError::OutOfScope {
            path: abs.to_path_buf(),
            root: root.to_path_buf(),
        })?;
        Ok(tail
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"))
    }

    pub fn client_relative(&self, abs: &Path) -> Result<String, PathError> {
        Self::to_relative(abs, &self.client_root)
    }

    pub fn server_relative(&self, abs: &Path) -> Result<String, PathError> {
        Self::to_relative(abs, &self.server_root)
    }

    pub fn client_abs(&self, relative: &str) -> PathBuf {
        join_relative(&self.client_root, relative)
    }

    pub fn server_abs(&self, relative: &str) -> PathBuf {
        join_relative(&self.server_root, relative)
    }

    /// Swaps a client-absolute path for the matching server-absolute one.
    pub fn client_to_server(&self, abs: &Path) -> Result<PathBuf, PathError> {
        Ok(self.server_abs(&self.client_relative(abs)?))
    }

    pub fn server_to_client(&self, abs: &Path) -> Result<PathBuf, PathError> {
        Ok(self.client_abs(&self.server_relative(abs)?))
    }

    pub fn contains(root: &Path, abs: &Path) -> bool {
        strip_prefix_ci(root, abs).is_some()
    }
}

fn strip_prefix_ci(root: &Path, abs: &Path) -> Option<PathBuf> {
    let mut remainder = abs.components();
    for root_part in root.components() {
        let abs_part = remainder.next()?;
        if !component_eq_ci(root_part, abs_part) {
            return None;
        }
    }
    Some(remainder.collect())
}

fn component_eq_ci(a: Component<'_>, b: Component<'_>) -> bool {
    a.as_os_str()
        .to_string_lossy()
        .eq_ignore_ascii_case(&b.as_os_str().to_string_lossy())
}

fn join_relative(root: &Path, relative: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            // Relatives come from our own mapping; anything else is noise.
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> PathMap {
        PathMap::new(PathBuf::from("/srv/nuvii"), PathBuf::from("/home/u/Nuvii"))
    }

    #[test]
    fn relative_strips_root_and_leading_separator() {
        let relative = PathMap::to_relative(
            Path::new("/home/u/Nuvii/Docs/A.txt"),
            Path::new("/home/u/Nuvii"),
        )
        .unwrap();
        assert_eq!(relative, "Docs/A.txt");
    }

    #[test]
    fn prefix_match_is_case_insensitive() {
        let relative = PathMap::to_relative(
            Path::new("/home/u/nuvii/Docs/A.txt"),
            Path::new("/home/u/Nuvii"),
        )
        .unwrap();
        assert_eq!(relative, "Docs/A.txt");
    }

    #[test]
    fn prefix_match_honors_component_boundaries() {
        assert!(!PathMap::contains(
            Path::new("/data/reports"),
            Path::new("/data/reports-old/a.txt")
        ));
        assert!(PathMap::contains(
            Path::new("/data/reports"),
            Path::new("/data/reports/a.txt")
        ));
    }

    #[test]
    fn out_of_scope_path_is_an_error() {
        let err = map().client_relative(Path::new("/elsewhere/x.txt")).unwrap_err();
        assert!(matches!(err, PathError::OutOfScope { .. }));
    }

    #[test]
    fn swaps_roots_in_both_directions() {
        let map = map();
        assert_eq!(
            map.client_to_server(Path::new("/home/u/Nuvii/a/b.txt")).unwrap(),
            PathBuf::from("/srv/nuvii/a/b.txt")
        );
        assert_eq!(
            map.server_to_client(Path::new("/srv/nuvii/a/b.txt")).unwrap(),
            PathBuf::from("/home/u/Nuvii/a/b.txt")
        );
    }

    #[test]
    fn join_ignores_traversal_components() {
        let map = map();
        assert_eq!(
            map.server_abs("../../etc/passwd"),
            PathBuf::from("/srv/nuvii/etc/passwd")
        );
        assert_eq!(map.client_abs("/Docs/A.txt"), PathBuf::from("/home/u/Nuvii/Docs/A.txt"));
    }

    #[test]
    fn root_itself_maps_to_empty_relative() {
        let map = map();
        assert_eq!(map.client_relative(Path::new("/home/u/Nuvii")).unwrap(), "");
    }
}
