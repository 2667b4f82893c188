//! Filesystem layer
//!
//! Logical path handling and the layered (union) view built on top of it.

pub mod overlay;
pub mod path;

pub use overlay::{LayeredFs, OpenMode, OverlayFile};
