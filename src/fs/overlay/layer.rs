//! A single directory tree in the stack
//!
//! Provides physical (per-layer) access: mapping logical paths onto the
//! layer root and raw, marker-unaware directory reads.

use crate::error::Result;
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};

use super::entry::EntryKind;

/// Directory entry read straight from one layer
#[derive(Debug, Clone)]
pub struct RawDirEntry {
    pub name: OsString,
    pub kind: EntryKind,
}

/// One layer of the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Absolute root path of the layer
    root: PathBuf,
    /// Whether the layer may receive writes
    writable: bool,
    /// Human-readable name
    label: String,
}

impl Layer {
    /// Create a layer; the root is made absolute (it does not need to exist yet)
    pub fn new(root: impl AsRef<Path>, writable: bool, label: Option<&str>) -> Result<Self> {
        let root = absolute(root.as_ref())?;
        let label = label
            .map(str::to_string)
            .unwrap_or_else(|| default_label(&root));
        Ok(Self {
            root,
            writable,
            label,
        })
    }

    /// Get the root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Map a logical path onto this layer
    pub fn physical(&self, path: &Path) -> PathBuf {
        if path.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(path)
        }
    }

    /// Convert a physical path inside this layer back to a logical path
    pub fn to_logical(&self, physical: &Path) -> Option<PathBuf> {
        physical.strip_prefix(&self.root).ok().map(Path::to_path_buf)
    }

    /// lstat of the logical path in this layer, if it physically exists
    pub fn metadata(&self, path: &Path) -> Option<Metadata> {
        fs::symlink_metadata(self.physical(path)).ok()
    }

    /// Check if the path physically exists (dangling symlinks count)
    pub fn exists(&self, path: &Path) -> bool {
        self.metadata(path).is_some()
    }

    /// Check if path is a real directory (symlinks are not followed)
    pub fn is_dir(&self, path: &Path) -> bool {
        self.metadata(path).map(|m| m.is_dir()).unwrap_or(false)
    }

    /// Read raw directory entries, markers included
    pub fn readdir(&self, path: &Path) -> Result<Vec<RawDirEntry>> {
        let mut entries = Vec::new();

        for entry in fs::read_dir(self.physical(path))? {
            let entry = entry?;
            let kind = EntryKind::from(entry.file_type()?);
            entries.push(RawDirEntry {
                name: entry.file_name(),
                kind,
            });
        }

        Ok(entries)
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}, {})",
            self.label,
            self.root.display(),
            if self.writable { "rw" } else { "ro" }
        )
    }
}

/// Label used when a layer is registered without one
pub fn default_label(root: &Path) -> String {
    root.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.to_string_lossy().into_owned())
}

pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
