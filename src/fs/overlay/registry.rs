//! Layer registry
//!
//! Ordered stack, top first. Writable layers are pushed on top, read-only
//! layers are appended at the bottom. The active writable layer is always the
//! first writable layer in the stack; other writable layers are consulted for
//! reads but never receive writes.

use crate::error::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::layer::{self, Layer};

/// Ordered stack of layers
#[derive(Debug, Default, Clone)]
pub struct LayerRegistry {
    layers: Vec<Arc<Layer>>,
}

impl LayerRegistry {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Register a layer: writable on top, read-only at the bottom
    pub fn add(&mut self, layer: Layer) -> Arc<Layer> {
        let layer = Arc::new(layer);
        if layer.is_writable() {
            self.layers.insert(0, layer.clone());
        } else {
            self.layers.push(layer.clone());
        }
        info!(layer = %layer, depth = self.layers.len(), "Registered layer");
        layer
    }

    /// Drop every layer whose label or root matches; returns the removed layers
    pub fn remove(&mut self, label_or_path: &str) -> Vec<Arc<Layer>> {
        // roots are stored absolute
        let as_path = layer::absolute(Path::new(label_or_path)).ok();
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .layers
            .drain(..)
            .partition(|l| l.label() == label_or_path || as_path.as_deref() == Some(l.root()));
        self.layers = kept;
        for layer in &removed {
            info!(layer = %layer, "Removed layer");
        }
        removed
    }

    /// Promote a registered writable layer to the top of the stack
    pub fn set_writable(&mut self, label: &str) -> Result<Arc<Layer>> {
        let index = self
            .layers
            .iter()
            .position(|l| l.label() == label)
            .ok_or_else(|| Error::LayerNotFound(label.to_string()))?;

        if !self.layers[index].is_writable() {
            return Err(Error::InvalidOperation(format!(
                "layer '{}' is read-only",
                label
            )));
        }

        let layer = self.layers.remove(index);
        self.layers.insert(0, layer.clone());
        info!(layer = %layer, "Activated writable layer");
        Ok(layer)
    }

    /// The active writable layer
    pub fn writable(&self) -> Option<Arc<Layer>> {
        self.layers.iter().find(|l| l.is_writable()).cloned()
    }

    /// All non-writable layers, stack order preserved
    pub fn readonly(&self) -> Vec<Arc<Layer>> {
        self.layers
            .iter()
            .filter(|l| !l.is_writable())
            .cloned()
            .collect()
    }

    /// Every layer except the active writable one, stack order preserved
    pub fn lower(&self) -> Vec<Arc<Layer>> {
        let active = self.writable();
        self.layers
            .iter()
            .filter(|l| active.as_ref().map_or(true, |a| !Arc::ptr_eq(a, l)))
            .cloned()
            .collect()
    }

    pub fn find(&self, label: &str) -> Option<Arc<Layer>> {
        self.layers.iter().find(|l| l.label() == label).cloned()
    }

    /// Snapshot of the stack, top first
    pub fn layers(&self) -> Vec<Arc<Layer>> {
        self.layers.clone()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
