//! Union (overlay) view over a stack of directory trees
//!
//! - Layers: ordered directory trees; the first writable one takes writes
//! - Whiteouts: `.wh.<name>` marker files record deletions of lower content
//! - Opaque directories: `.wh..wh..opq` stops merging of lower children
//! - Copy-up: lower content is copied into the writable layer before mutation

mod copy_up;
mod entry;
mod events;
mod filesystem;
mod handle;
mod layer;
mod merger;
mod registry;
mod resolver;
mod whiteout;

pub use entry::{ChangeKind, DiffEntry, Entry, EntryKind, StatSnapshot, TreeNode, Version};
pub use events::{HookEvent, HookPayload, Hooks, Listener};
pub use filesystem::{FsOptions, LayeredFs};
pub use handle::{OpenMode, OverlayFile};
pub use layer::{default_label, Layer, RawDirEntry};
pub use merger::Merger;
pub use registry::LayerRegistry;
pub use resolver::{resolve, Probe, Resolved};
pub use whiteout::{
    is_marker_name, is_opaque_name, is_whiteout_name, opaque_name, whiteout_name, OPAQUE_MARKER,
    WHITEOUT_PREFIX,
};
