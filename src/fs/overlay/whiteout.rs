//! Whiteout and opaque markers
//!
//! A whiteout is a zero-byte sibling file `.wh.<name>`: as of the layer that
//! holds it, `<name>` does not exist. An opaque marker is a zero-byte
//! `.wh..wh..opq` file inside a directory: children of that directory from
//! lower layers are not merged. Markers are plain files, so the convention
//! works on any local filesystem.

use crate::error::{Error, Result};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::layer::Layer;

pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// Logical path of the whiteout marker for `path` (None for the root)
pub fn whiteout_name(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?;
    let mut marker = OsString::from(WHITEOUT_PREFIX);
    marker.push(name);
    Some(match path.parent() {
        Some(parent) => parent.join(marker),
        None => PathBuf::from(marker),
    })
}

/// Logical path of the opaque marker inside `dir`
pub fn opaque_name(dir: &Path) -> PathBuf {
    dir.join(OPAQUE_MARKER)
}

/// True for `.wh.<name>` entries (the opaque marker is not a whiteout)
pub fn is_whiteout_name(name: &OsStr) -> bool {
    name.as_bytes().starts_with(WHITEOUT_PREFIX.as_bytes()) && !is_opaque_name(name)
}

pub fn is_opaque_name(name: &OsStr) -> bool {
    name == OPAQUE_MARKER
}

/// Any reserved marker name
pub fn is_marker_name(name: &OsStr) -> bool {
    name.as_bytes().starts_with(WHITEOUT_PREFIX.as_bytes())
}

/// The hidden base name a whiteout entry refers to
pub fn whiteout_target(name: &OsStr) -> Option<OsString> {
    if !is_whiteout_name(name) {
        return None;
    }
    let target = &name.as_bytes()[WHITEOUT_PREFIX.len()..];
    if target.is_empty() {
        return None;
    }
    Some(OsStr::from_bytes(target).to_os_string())
}

/// Reject logical paths that would address a marker file directly
pub fn check_not_reserved(path: &Path) -> Result<()> {
    if path.components().any(|c| is_marker_name(c.as_os_str())) {
        return Err(Error::InvalidPath(format!(
            "'{}' uses the reserved {} prefix",
            path.display(),
            WHITEOUT_PREFIX
        )));
    }
    Ok(())
}

/// Does `layer` hold a whiteout for `path`
pub fn has_whiteout(layer: &Layer, path: &Path) -> bool {
    whiteout_name(path)
        .map(|marker| layer.exists(&marker))
        .unwrap_or(false)
}

/// Does `layer` hold an opaque marker inside `dir`
pub fn has_opaque(layer: &Layer, dir: &Path) -> bool {
    layer.exists(&opaque_name(dir))
}

/// Create the whiteout for `path` inside `layer`
pub fn create_whiteout(layer: &Layer, path: &Path) -> Result<PathBuf> {
    let marker = whiteout_name(path)
        .ok_or_else(|| Error::InvalidOperation("cannot whiteout the root".to_string()))?;
    touch(layer, &marker)?;
    debug!(layer = %layer.label(), path = %path.display(), "Created whiteout");
    Ok(layer.physical(&marker))
}

/// Remove the whiteout for `path` from `layer`; returns whether one existed
pub fn remove_whiteout(layer: &Layer, path: &Path) -> Result<bool> {
    match whiteout_name(path) {
        Some(marker) => remove_marker(layer, &marker),
        None => Ok(false),
    }
}

/// Mark `dir` opaque inside `layer`
pub fn create_opaque(layer: &Layer, dir: &Path) -> Result<PathBuf> {
    let marker = opaque_name(dir);
    touch(layer, &marker)?;
    debug!(layer = %layer.label(), dir = %dir.display(), "Marked directory opaque");
    Ok(layer.physical(&marker))
}

/// Remove the opaque marker of `dir` from `layer`; returns whether one existed
pub fn remove_opaque(layer: &Layer, dir: &Path) -> Result<bool> {
    remove_marker(layer, &opaque_name(dir))
}

fn touch(layer: &Layer, marker: &Path) -> Result<()> {
    let physical = layer.physical(marker);
    if let Some(parent) = physical.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&physical)?;
    Ok(())
}

fn remove_marker(layer: &Layer, marker: &Path) -> Result<bool> {
    match fs::remove_file(layer.physical(marker)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_whiteout_name() {
        assert_eq!(
            whiteout_name(Path::new("etc/conf")),
            Some(PathBuf::from("etc/.wh.conf"))
        );
        assert_eq!(whiteout_name(Path::new("f")), Some(PathBuf::from(".wh.f")));
        assert_eq!(whiteout_name(Path::new("")), None);
    }

    #[test]
    fn test_name_classification() {
        assert!(is_whiteout_name(OsStr::new(".wh.conf")));
        assert!(!is_whiteout_name(OsStr::new(OPAQUE_MARKER)));
        assert!(!is_whiteout_name(OsStr::new("conf")));
        assert!(is_opaque_name(OsStr::new(".wh..wh..opq")));
        assert!(is_marker_name(OsStr::new(".wh..wh..opq")));

        assert_eq!(
            whiteout_target(OsStr::new(".wh.conf")),
            Some(OsString::from("conf"))
        );
        assert_eq!(whiteout_target(OsStr::new(".wh.")), None);
        assert_eq!(whiteout_target(OsStr::new("plain")), None);
    }

    #[test]
    fn test_reserved_paths() {
        assert!(check_not_reserved(Path::new("a/b")).is_ok());
        assert!(check_not_reserved(Path::new("a/.wh.b")).is_err());
        assert!(check_not_reserved(Path::new(".wh..wh..opq")).is_err());
        // a dot file is not a marker
        assert!(check_not_reserved(Path::new(".whatever")).is_ok());
    }

    #[test]
    fn test_create_and_remove_markers() {
        let dir = tempdir().unwrap();
        let layer = Layer::new(dir.path(), true, Some("upper")).unwrap();

        let marker = create_whiteout(&layer, Path::new("etc/conf")).unwrap();
        assert_eq!(marker, dir.path().join("etc/.wh.conf"));
        assert!(has_whiteout(&layer, Path::new("etc/conf")));
        assert_eq!(fs::metadata(&marker).unwrap().len(), 0);

        assert!(remove_whiteout(&layer, Path::new("etc/conf")).unwrap());
        assert!(!remove_whiteout(&layer, Path::new("etc/conf")).unwrap());
        assert!(!has_whiteout(&layer, Path::new("etc/conf")));

        create_opaque(&layer, Path::new("etc")).unwrap();
        assert!(has_opaque(&layer, Path::new("etc")));
        assert!(remove_opaque(&layer, Path::new("etc")).unwrap());
        assert!(!has_opaque(&layer, Path::new("etc")));
    }

    #[test]
    fn test_whiteout_root_rejected() {
        let dir = tempdir().unwrap();
        let layer = Layer::new(dir.path(), true, None).unwrap();
        assert!(create_whiteout(&layer, Path::new("")).is_err());
    }
}
