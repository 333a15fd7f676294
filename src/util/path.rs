use std::path::{Path, PathBuf};

/// Relative path of the sync root itself.
pub const ROOT_REL: &str = "/";

/// Maps between absolute filesystem paths and the forward-slash relative
/// strings used as keys in the state stores. `/` denotes the sync root.
#[derive(Debug, Clone)]
pub struct PathModel {
    root: PathBuf,
}

impl PathModel {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a relative key (`/` yields the sync root).
    pub fn absolute(&self, relative: &str) -> PathBuf {
        if relative == ROOT_REL {
            return self.root.clone();
        }
        self.root.join(relative.trim_start_matches('/'))
    }

    /// Relative key for an absolute path under the sync root.
    /// Returns `/` when the target is the root itself, `None` when the
    /// path lies outside the root.
    pub fn relative(&self, absolute: &Path) -> Option<String> {
        let rel = absolute.strip_prefix(&self.root).ok()?;
        if rel.as_os_str().is_empty() {
            return Some(ROOT_REL.to_string());
        }
        // Forward slashes as platform-independent sync keys
        Some(rel.to_string_lossy().replace('\\', "/"))
    }

    /// Relative key of the directory containing `absolute`.
    pub fn parent_rel(&self, absolute: &Path) -> Option<String> {
        self.relative(absolute.parent()?)
    }

    /// Hidden-entry policy: a path is hidden when its final component
    /// begins with a dot. Events for hidden entries are dropped at the
    /// reconciler edge.
    pub fn is_hidden(absolute: &Path) -> bool {
        absolute
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(false)
    }
}

/// Join a relative directory key and an entry name into a relative path key.
pub fn join_rel(dir: &str, name: &str) -> String {
    if dir == ROOT_REL {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Split a relative path key into (parent dir key, entry name).
pub fn split_rel(relative: &str) -> (&str, &str) {
    match relative.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => (ROOT_REL, relative),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> PathModel {
        PathModel::new("/home/user/2safe")
    }

    #[test]
    fn test_relative_under_root() {
        let m = model();
        assert_eq!(
            m.relative(Path::new("/home/user/2safe/docs/report.pdf")),
            Some("docs/report.pdf".to_string())
        );
    }

    #[test]
    fn test_relative_of_root_is_slash() {
        let m = model();
        assert_eq!(
            m.relative(Path::new("/home/user/2safe")),
            Some(ROOT_REL.to_string())
        );
    }

    #[test]
    fn test_relative_outside_root() {
        let m = model();
        assert_eq!(m.relative(Path::new("/etc/passwd")), None);
    }

    #[test]
    fn test_absolute_round_trip() {
        let m = model();
        let abs = m.absolute("a/b.txt");
        assert_eq!(abs, Path::new("/home/user/2safe/a/b.txt"));
        assert_eq!(m.relative(&abs), Some("a/b.txt".to_string()));
        assert_eq!(m.absolute(ROOT_REL), Path::new("/home/user/2safe"));
    }

    #[test]
    fn test_parent_rel() {
        let m = model();
        assert_eq!(
            m.parent_rel(Path::new("/home/user/2safe/a/b.txt")),
            Some("a".to_string())
        );
        assert_eq!(
            m.parent_rel(Path::new("/home/user/2safe/top.txt")),
            Some(ROOT_REL.to_string())
        );
    }

    #[test]
    fn test_hidden() {
        assert!(PathModel::is_hidden(Path::new("/home/user/2safe/.git")));
        assert!(PathModel::is_hidden(Path::new("/home/user/2safe/a/.swp")));
        assert!(!PathModel::is_hidden(Path::new("/home/user/2safe/a/b.txt")));
    }

    #[test]
    fn test_join_split_rel() {
        assert_eq!(join_rel(ROOT_REL, "a.txt"), "a.txt");
        assert_eq!(join_rel("docs", "a.txt"), "docs/a.txt");
        assert_eq!(split_rel("docs/a.txt"), ("docs", "a.txt"));
        assert_eq!(split_rel("a.txt"), (ROOT_REL, "a.txt"));
    }
}
