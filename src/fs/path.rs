//! Logical path helpers
//!
//! Logical paths are relative to the root of the merged view. The empty path
//! names the root itself. Leading `/`, `.` components and repeated separators
//! are accepted and dropped; `..` may not climb above the root.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

const MAX_PATH_LENGTH: usize = 4096;
const MAX_FILENAME_LENGTH: usize = 255;

/// Normalize a caller-supplied path into a logical relative path
pub fn normalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let raw = path.as_os_str();

    if raw.len() > MAX_PATH_LENGTH {
        return Err(Error::InvalidPath(format!(
            "path too long: {} bytes (max {})",
            raw.len(),
            MAX_PATH_LENGTH
        )));
    }

    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Prefix(_) => {
                return Err(Error::InvalidPath(format!(
                    "unsupported path prefix: {}",
                    path.display()
                )));
            }
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(Error::InvalidPath(format!(
                        "path escapes the root: {}",
                        path.display()
                    )));
                }
            }
            Component::Normal(name) => {
                if name.len() > MAX_FILENAME_LENGTH {
                    return Err(Error::InvalidPath(format!(
                        "filename too long: {} bytes (max {})",
                        name.len(),
                        MAX_FILENAME_LENGTH
                    )));
                }
                parts.push(name);
            }
        }
    }

    Ok(parts.iter().collect())
}

/// Split a logical path into (parent, file name). The root has no parent.
pub fn split(path: &Path) -> Option<(&Path, &std::ffi::OsStr)> {
    let name = path.file_name()?;
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    Some((parent, name))
}

/// True if `path` is the root of the merged view
pub fn is_root(path: &Path) -> bool {
    path.as_os_str().is_empty()
}

/// Strict ancestors of a logical path, root first (`a/b/c` -> `""`, `a`, `a/b`)
pub fn ancestors(path: &Path) -> Vec<&Path> {
    let mut out: Vec<&Path> = path.ancestors().skip(1).collect();
    out.reverse();
    out
}

/// Render a logical path for messages and matching (`/`-separated, no leading slash)
pub fn display(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize("/").unwrap(), PathBuf::new());
        assert_eq!(normalize("").unwrap(), PathBuf::new());
        assert_eq!(normalize(".").unwrap(), PathBuf::new());
    }

    #[test]
    fn test_normalize_strips_noise() {
        assert_eq!(normalize("/etc/conf").unwrap(), PathBuf::from("etc/conf"));
        assert_eq!(normalize("etc//conf/").unwrap(), PathBuf::from("etc/conf"));
        assert_eq!(normalize("./etc/./conf").unwrap(), PathBuf::from("etc/conf"));
        assert_eq!(normalize("etc/x/../conf").unwrap(), PathBuf::from("etc/conf"));
    }

    #[test]
    fn test_normalize_rejects_escape() {
        assert!(matches!(normalize("../etc"), Err(Error::InvalidPath(_))));
        assert!(matches!(normalize("a/../../b"), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn test_normalize_rejects_long_names() {
        let long = "x".repeat(300);
        assert!(normalize(&long).is_err());
    }

    #[test]
    fn test_split() {
        let (parent, name) = split(Path::new("a/b/c")).unwrap();
        assert_eq!(parent, Path::new("a/b"));
        assert_eq!(name, "c");

        let (parent, name) = split(Path::new("top")).unwrap();
        assert_eq!(parent, Path::new(""));
        assert_eq!(name, "top");

        assert!(split(Path::new("")).is_none());
    }

    #[test]
    fn test_ancestors() {
        let path = Path::new("a/b/c");
        assert_eq!(
            ancestors(path),
            vec![Path::new(""), Path::new("a"), Path::new("a/b")]
        );
        assert!(ancestors(Path::new("")).is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(display(Path::new("a/b")), "a/b");
        assert_eq!(display(Path::new("")), "");
    }
}
