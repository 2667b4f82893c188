//! layerfs - a layered (union) filesystem engine
//!
//! This library presents an ordered stack of ordinary directory trees as one
//! merged tree. Reads fall through the stack top-down, writes land in a
//! single writable layer with copy-on-write, and deletions of lower content
//! are recorded as whiteout marker files, so lower layers are never modified.

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;

pub use config::Config;
pub use error::{Error, Result};
pub use fs::overlay::{
    ChangeKind, DiffEntry, Entry, EntryKind, FsOptions, HookEvent, HookPayload, LayeredFs,
    OpenMode, OverlayFile, StatSnapshot, TreeNode, Version,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, LayerConfig};
    pub use crate::error::{Error, Result};
    pub use crate::fs::overlay::{EntryKind, HookEvent, HookPayload, LayeredFs, OpenMode};
}
