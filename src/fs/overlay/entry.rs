//! Values produced by the merged view
//!
//! Entries, stat snapshots, per-layer versions, diff records and trees.

use serde::Serialize;
use std::path::PathBuf;
use std::time::SystemTime;

/// File type of a merged entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    /// Device nodes, FIFOs and sockets
    Other,
}

impl From<std::fs::FileType> for EntryKind {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
            EntryKind::Symlink => "symlink",
            EntryKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// One child in a merged directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entry {
    /// Base name
    pub name: String,
    /// Physical path inside the source layer
    pub absolute_path: PathBuf,
    /// Logical path in the merged view
    pub relative_path: PathBuf,
    /// Label of the layer that provides this entry
    pub layer: String,
    pub kind: EntryKind,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }
}

/// Point-in-time attributes of a resolved path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatSnapshot {
    pub kind: EntryKind,
    pub size: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    /// Label of the layer the attributes were read from
    pub layer: String,
}

impl StatSnapshot {
    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata, layer: &str) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            kind: EntryKind::from(meta.file_type()),
            size: meta.len(),
            mode: meta.mode() & 0o7777,
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: SystemTime::UNIX_EPOCH
                + std::time::Duration::new(meta.ctime().max(0) as u64, meta.ctime_nsec().max(0) as u32),
            layer: layer.to_string(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(meta: &std::fs::Metadata, layer: &str) -> Self {
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Self {
            kind: EntryKind::from(meta.file_type()),
            size: meta.len(),
            mode: if meta.permissions().readonly() { 0o444 } else { 0o644 },
            nlink: 1,
            uid: 0,
            gid: 0,
            atime: meta.accessed().unwrap_or(mtime),
            mtime,
            ctime: meta.created().unwrap_or(mtime),
            layer: layer.to_string(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == EntryKind::Symlink
    }
}

/// A physical copy of a logical path in one layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Version {
    pub layer: String,
    pub writable: bool,
    pub path: PathBuf,
    pub kind: EntryKind,
    pub size: u64,
    pub mtime: SystemTime,
}

/// Kind of change recorded in the writable layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Present only in the writable layer
    Added,
    /// Present in the writable layer and shadowing a lower copy
    Modified,
    /// Hidden by a whiteout
    Deleted,
    /// Directory marked opaque
    Opaque,
}

/// One change of the writable layer relative to the layers below
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    pub path: PathBuf,
    pub change: ChangeKind,
    pub kind: Option<EntryKind>,
}

/// Nested merged listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    pub name: String,
    pub kind: EntryKind,
    pub layer: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    /// Number of nodes below this one
    pub fn descendant_count(&self) -> usize {
        self.children
            .iter()
            .map(|c| 1 + c.descendant_count())
            .sum()
    }

    pub fn child(&self, name: &str) -> Option<&TreeNode> {
        self.children.iter().find(|c| c.name == name)
    }
}
