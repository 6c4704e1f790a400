use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path does not name an item below the root")]
    Empty,
    #[error("path contains unsupported component: {0}")]
    UnsupportedComponent(String),
    #[error("invalid item name: {0:?}")]
    InvalidName(String),
    #[error("path is outside the sync root: {0}")]
    OutsideRoot(PathBuf),
}

/// Maps a tree path ("/docs/a.txt") or an object key ("docs/a.txt") under `root`.
/// The empty path and "/" map to the root itself.
pub fn local_path_for(root: &Path, path: &str) -> Result<PathBuf, PathError> {
    let mut out = root.to_path_buf();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent(path.to_string()));
            }
        }
    }
    Ok(out)
}

/// Object key for a tree path: forward slashes, no leading slash.
pub fn key_from_tree_path(tree_path: &str) -> Result<String, PathError> {
    let mut segments = Vec::new();
    for segment in tree_path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::UnsupportedComponent(tree_path.to_string())),
            part => segments.push(part),
        }
    }
    if segments.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(segments.join("/"))
}

pub fn tree_path_for(key: &str) -> String {
    format!("/{}", key.trim_start_matches('/'))
}

/// Canonical tree path: one leading slash, no trailing or doubled separators.
/// Anything naming the root ("", "/", ".") becomes "/".
pub fn normalize_tree_path(path: &str) -> Result<String, PathError> {
    match key_from_tree_path(path) {
        Ok(key) => Ok(tree_path_for(&key)),
        Err(PathError::Empty) => Ok("/".to_string()),
        Err(err) => Err(err),
    }
}

/// Tree path of a local path below `root`, normalized to forward slashes.
pub fn tree_path_of(root: &Path, local: &Path) -> Result<String, PathError> {
    let relative = local
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(local.to_path_buf()))?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
            Component::CurDir => continue,
            _ => return Err(PathError::OutsideRoot(local.to_path_buf())),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

pub fn join_tree_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{parent}/{name}")
}

/// True when any segment is a dotfile; such paths are never scanned or synced.
pub fn is_hidden(path: &str) -> bool {
    path.split(['/', '\\'])
        .any(|segment| segment.starts_with('.') && segment != "." && segment != "..")
}

/// A single path segment usable as a file or folder name.
pub fn validate_name(name: &str) -> Result<(), PathError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(PathError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// True when `path` equals `ancestor` or lies below it.
pub fn is_same_or_descendant(path: &str, ancestor: &str) -> bool {
    let ancestor = ancestor.trim_end_matches('/');
    if ancestor.is_empty() {
        return true;
    }
    path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_tree_path_and_key_under_root() {
        let root = PathBuf::from("/sync");
        assert_eq!(
            local_path_for(&root, "/docs/a.txt").unwrap(),
            PathBuf::from("/sync/docs/a.txt")
        );
        assert_eq!(
            local_path_for(&root, "docs/a.txt").unwrap(),
            PathBuf::from("/sync/docs/a.txt")
        );
        assert_eq!(local_path_for(&root, "/").unwrap(), root);
    }

    #[test]
    fn rejects_parent_dir() {
        let root = PathBuf::from("/sync");
        assert!(matches!(
            local_path_for(&root, "../secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
        assert!(key_from_tree_path("/docs/../../etc").is_err());
    }

    #[test]
    fn key_and_tree_path_differ_only_by_leading_slash() {
        assert_eq!(key_from_tree_path("/docs/readme.txt").unwrap(), "docs/readme.txt");
        assert_eq!(key_from_tree_path("docs\\readme.txt").unwrap(), "docs/readme.txt");
        assert_eq!(tree_path_for("docs/readme.txt"), "/docs/readme.txt");
        assert!(matches!(key_from_tree_path("/"), Err(PathError::Empty)));
    }

    #[test]
    fn normalizes_caller_spellings() {
        assert_eq!(normalize_tree_path("docs").unwrap(), "/docs");
        assert_eq!(normalize_tree_path("/docs/").unwrap(), "/docs");
        assert_eq!(normalize_tree_path("//docs//a.txt").unwrap(), "/docs/a.txt");
        assert_eq!(normalize_tree_path("./docs\\a.txt").unwrap(), "/docs/a.txt");
        assert_eq!(normalize_tree_path("").unwrap(), "/");
        assert_eq!(normalize_tree_path("/").unwrap(), "/");
        assert!(normalize_tree_path("/docs/../x").is_err());
    }

    #[test]
    fn tree_path_of_strips_root() {
        let root = Path::new("/sync");
        assert_eq!(
            tree_path_of(root, Path::new("/sync/docs/a.txt")).unwrap(),
            "/docs/a.txt"
        );
        assert_eq!(tree_path_of(root, root).unwrap(), "/");
        assert!(tree_path_of(root, Path::new("/elsewhere/a.txt")).is_err());
    }

    #[test]
    fn hidden_segments_anywhere_count() {
        assert!(is_hidden("/.git/config"));
        assert!(is_hidden("docs/.a.txt.partial"));
        assert!(!is_hidden("/docs/readme.txt"));
    }

    #[test]
    fn names_are_single_segments() {
        assert!(validate_name("readme.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn descendant_check_respects_segment_boundaries() {
        assert!(is_same_or_descendant("/docs/a", "/docs"));
        assert!(is_same_or_descendant("/docs", "/docs"));
        assert!(!is_same_or_descendant("/docs2/a", "/docs"));
        assert!(is_same_or_descendant("/anything", "/"));
    }
}
