//! Directory merging
//!
//! Produces merged listings across the stack. Layers are walked top-down
//! with two name sets: `seen` (already emitted) and `hidden` (whiteouts met so
//! far). An opaque directory, a whiteout on the directory or an ancestor, or a
//! non-directory in its place ends the walk for that listing. Recursive
//! operations (`glob`, `find`, `tree`) only ever use merged listings, never a
//! single layer's raw tree.

use crate::error::{Error, Result};
use glob::{MatchOptions, Pattern};
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::entry::{Entry, EntryKind, TreeNode};
use super::layer::Layer;
use super::resolver;
use super::whiteout;
use crate::fs::path;

/// Merged listings over a snapshot of the stack
pub struct Merger<'a> {
    layers: &'a [Arc<Layer>],
}

impl<'a> Merger<'a> {
    pub fn new(layers: &'a [Arc<Layer>]) -> Self {
        Self { layers }
    }

    /// Merged children of `dir`, sorted by name
    ///
    /// `dir` must be a normalized logical path; a directory that no layer
    /// provides yields an empty listing.
    pub fn entries(&self, dir: &Path) -> Result<Vec<Entry>> {
        let mut seen: HashSet<OsString> = HashSet::new();
        let mut hidden: HashSet<OsString> = HashSet::new();
        let mut out = Vec::new();

        for layer in self.layers {
            if !path::is_root(dir) && resolver::shadowed(layer, dir) {
                break;
            }

            match layer.metadata(dir) {
                Some(meta) if meta.is_dir() => {
                    let raw = layer.readdir(dir)?;

                    // whiteouts first, so a marker and a same-layer copy never race on order
                    for child in &raw {
                        if let Some(target) = whiteout::whiteout_target(&child.name) {
                            hidden.insert(target);
                        }
                    }

                    for child in raw {
                        if whiteout::is_marker_name(&child.name) {
                            continue;
                        }
                        if seen.contains(&child.name) || hidden.contains(&child.name) {
                            continue;
                        }
                        let relative_path = dir.join(&child.name);
                        out.push(Entry {
                            name: child.name.to_string_lossy().into_owned(),
                            absolute_path: layer.physical(&relative_path),
                            relative_path,
                            layer: layer.label().to_string(),
                            kind: child.kind,
                        });
                        seen.insert(child.name);
                    }
                }
                // a non-directory at this level shadows lower directories
                Some(_) => break,
                None => {}
            }

            if whiteout::has_opaque(layer, dir) || resolver::opaque_above(layer, dir) {
                debug!(layer = %layer.label(), dir = %dir.display(), "Opaque directory ends merge");
                break;
            }
        }

        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Every merged entry whose logical path matches `pattern`
    ///
    /// `*` and `?` do not cross `/`; a `**` component matches any depth.
    pub fn glob(&self, pattern: &str) -> Result<Vec<Entry>> {
        let pattern = pattern.trim_start_matches('/');
        let compiled = Pattern::new(pattern)
            .map_err(|e| Error::InvalidPath(format!("bad glob '{}': {}", pattern, e)))?;
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let mut out = Vec::new();
        self.walk(Path::new(""), &mut |entry| {
            if compiled.matches_with(&path::display(&entry.relative_path), options) {
                out.push(entry.clone());
            }
        })?;
        out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(out)
    }

    /// Depth-first merged walk below `dir`, filtered by `predicate`
    pub fn find(
        &self,
        dir: &Path,
        predicate: Option<&dyn Fn(&Entry) -> bool>,
    ) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        self.walk(dir, &mut |entry| {
            if predicate.map_or(true, |p| p(entry)) {
                out.push(entry.clone());
            }
        })?;
        Ok(out)
    }

    /// Nested listing of `dir`, `depth` levels deep (None = unlimited)
    pub fn tree(&self, dir: &Path, depth: Option<usize>) -> Result<TreeNode> {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let layer = resolver::resolve(self.layers, dir).map(|r| r.label().to_string());
        Ok(TreeNode {
            name,
            kind: EntryKind::Directory,
            layer,
            children: self.subtree(dir, depth)?,
        })
    }

    fn subtree(&self, dir: &Path, depth: Option<usize>) -> Result<Vec<TreeNode>> {
        if depth == Some(0) {
            return Ok(Vec::new());
        }
        let next = depth.map(|d| d - 1);

        self.entries(dir)?
            .into_iter()
            .map(|entry| {
                let children = if entry.is_dir() {
                    self.subtree(&entry.relative_path, next)?
                } else {
                    Vec::new()
                };
                Ok(TreeNode {
                    name: entry.name,
                    kind: entry.kind,
                    layer: Some(entry.layer),
                    children,
                })
            })
            .collect()
    }

    fn walk(&self, dir: &Path, visit: &mut dyn FnMut(&Entry)) -> Result<()> {
        for entry in self.entries(dir)? {
            visit(&entry);
            if entry.is_dir() {
                self.walk(&entry.relative_path, visit)?;
            }
        }
        Ok(())
    }
}
