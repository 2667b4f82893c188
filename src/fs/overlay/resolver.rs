//! Path resolution
//!
//! Maps a logical path onto the (layer, physical path) that provides it in the
//! merged view. Layers are probed top-down; within one layer:
//!
//! 1. a whiteout for the path or any ancestor, or an ancestor that is not a
//!    directory, hides the path from this layer and every layer below;
//! 2. if the path physically exists in the layer, it resolves there;
//! 3. if an ancestor directory in this layer is opaque, lower layers are not
//!    consulted.
//!
//! Rule 3 runs after rule 2, so an opaque directory never hides its own
//! layer's children. The directory merger applies the same rules.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::layer::Layer;
use super::whiteout;
use crate::fs::path;

/// Where a logical path lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub layer: Arc<Layer>,
    /// Physical path inside `layer`
    pub path: PathBuf,
}

impl Resolved {
    pub fn label(&self) -> &str {
        self.layer.label()
    }
}

/// Outcome of probing one layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The layer provides the path
    Found,
    /// The layer hides the path; stop
    Hidden,
    /// Not here and the layer is opaque above the path; stop
    Opaque,
    /// Not here; keep looking below
    Absent,
}

/// Whiteout on `path` or an ancestor, or a non-directory ancestor, inside `layer`
pub fn shadowed(layer: &Layer, logical: &Path) -> bool {
    for ancestor in path::ancestors(logical) {
        if path::is_root(ancestor) {
            continue;
        }
        if whiteout::has_whiteout(layer, ancestor) {
            return true;
        }
        if let Some(meta) = layer.metadata(ancestor) {
            if !meta.is_dir() {
                return true;
            }
        }
    }
    whiteout::has_whiteout(layer, logical)
}

/// Is any strict ancestor of `path` marked opaque inside `layer`
pub fn opaque_above(layer: &Layer, logical: &Path) -> bool {
    path::ancestors(logical)
        .into_iter()
        .any(|ancestor| whiteout::has_opaque(layer, ancestor))
}

/// Probe one layer for a logical path
pub fn probe(layer: &Layer, logical: &Path) -> Probe {
    if path::is_root(logical) {
        return if layer.is_dir(logical) {
            Probe::Found
        } else {
            Probe::Absent
        };
    }
    if shadowed(layer, logical) {
        return Probe::Hidden;
    }
    if layer.exists(logical) {
        return Probe::Found;
    }
    if opaque_above(layer, logical) {
        return Probe::Opaque;
    }
    Probe::Absent
}

/// Resolve a normalized logical path against a stack (top first)
pub fn resolve(layers: &[Arc<Layer>], logical: &Path) -> Option<Resolved> {
    for layer in layers {
        match probe(layer, logical) {
            Probe::Found => {
                return Some(Resolved {
                    layer: layer.clone(),
                    path: layer.physical(logical),
                });
            }
            Probe::Hidden | Probe::Opaque => return None,
            Probe::Absent => {}
        }
    }
    None
}

/// Every layer that physically holds `path`, markers ignored (top first)
pub fn physical_copies(layers: &[Arc<Layer>], logical: &Path) -> Vec<Resolved> {
    layers
        .iter()
        .filter(|layer| layer.exists(logical))
        .map(|layer| Resolved {
            layer: layer.clone(),
            path: layer.physical(logical),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    struct Stack {
        _dirs: Vec<TempDir>,
        layers: Vec<Arc<Layer>>,
    }

    impl Stack {
        /// Build a stack top first
        fn new(stack: &[(&str, bool)]) -> Self {
            let mut dirs = Vec::new();
            let mut layers = Vec::new();
            for (label, writable) in stack {
                let dir = tempdir().unwrap();
                layers.push(Arc::new(Layer::new(dir.path(), *writable, Some(*label)).unwrap()));
                dirs.push(dir);
            }
            Stack {
                _dirs: dirs,
                layers,
            }
        }

        fn put(&self, index: usize, rel: &str, content: &str) {
            let p = self.layers[index].physical(Path::new(rel));
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, content).unwrap();
        }

        fn mkdir(&self, index: usize, rel: &str) {
            fs::create_dir_all(self.layers[index].physical(Path::new(rel))).unwrap();
        }

        fn label_of(&self, rel: &str) -> Option<String> {
            resolve(&self.layers, Path::new(rel)).map(|r| r.label().to_string())
        }
    }

    #[test]
    fn test_top_down_resolution() {
        let stack = Stack::new(&[("upper", true), ("base", false)]);
        stack.put(1, "etc/conf", "1.0");
        assert_eq!(stack.label_of("etc/conf").as_deref(), Some("base"));

        stack.put(0, "etc/conf", "2.0");
        assert_eq!(stack.label_of("etc/conf").as_deref(), Some("upper"));
        assert_eq!(stack.label_of("missing"), None);
    }

    #[test]
    fn test_whiteout_hides_lower() {
        let stack = Stack::new(&[("upper", true), ("base", false)]);
        stack.put(1, "etc/conf", "1.0");
        whiteout::create_whiteout(&stack.layers[0], Path::new("etc/conf")).unwrap();
        assert_eq!(stack.label_of("etc/conf"), None);
    }

    #[test]
    fn test_higher_copy_beats_lower_whiteout() {
        let stack = Stack::new(&[("top", true), ("mid", false), ("bottom", false)]);
        stack.put(2, "f", "old");
        whiteout::create_whiteout(&stack.layers[1], Path::new("f")).unwrap();
        assert_eq!(stack.label_of("f"), None);

        stack.put(0, "f", "new");
        assert_eq!(stack.label_of("f").as_deref(), Some("top"));
    }

    #[test]
    fn test_ancestor_whiteout_hides_descendants() {
        let stack = Stack::new(&[("upper", true), ("base", false)]);
        stack.put(1, "dir/sub/file", "x");
        whiteout::create_whiteout(&stack.layers[0], Path::new("dir")).unwrap();
        assert_eq!(stack.label_of("dir/sub/file"), None);
        assert_eq!(stack.label_of("dir/sub"), None);
    }

    #[test]
    fn test_file_shadows_lower_directory() {
        let stack = Stack::new(&[("upper", true), ("base", false)]);
        stack.put(1, "a/b", "lower child");
        stack.put(0, "a", "now a file");
        assert_eq!(stack.label_of("a").as_deref(), Some("upper"));
        assert_eq!(stack.label_of("a/b"), None);
    }

    #[test]
    fn test_opaque_blocks_lower_but_not_own_layer() {
        let stack = Stack::new(&[("upper", true), ("base", false)]);
        stack.put(1, "dir/x", "x");
        stack.put(1, "dir/y", "y");
        stack.put(0, "dir/z", "z");
        whiteout::create_opaque(&stack.layers[0], Path::new("dir")).unwrap();

        assert_eq!(stack.label_of("dir/x"), None);
        assert_eq!(stack.label_of("dir/y"), None);
        // an opaque ancestor never hides its own layer's content
        assert_eq!(stack.label_of("dir/z").as_deref(), Some("upper"));
        assert_eq!(stack.label_of("dir").as_deref(), Some("upper"));
    }

    #[test]
    fn test_opaque_in_lower_layer_only_blocks_below_it() {
        let stack = Stack::new(&[("top", true), ("mid", false), ("bottom", false)]);
        stack.put(2, "dir/old", "o");
        stack.mkdir(1, "dir");
        whiteout::create_opaque(&stack.layers[1], Path::new("dir")).unwrap();
        stack.put(0, "dir/new", "n");

        assert_eq!(stack.label_of("dir/old"), None);
        assert_eq!(stack.label_of("dir/new").as_deref(), Some("top"));
    }

    #[test]
    fn test_root_resolves_to_first_existing_layer() {
        let stack = Stack::new(&[("upper", true), ("base", false)]);
        assert_eq!(stack.label_of("").as_deref(), Some("upper"));
    }

    #[test]
    fn test_physical_copies_ignore_markers() {
        let stack = Stack::new(&[("upper", true), ("base", false)]);
        stack.put(1, "f", "x");
        whiteout::create_whiteout(&stack.layers[0], Path::new("f")).unwrap();

        let copies = physical_copies(&stack.layers, Path::new("f"));
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].label(), "base");
    }
}
