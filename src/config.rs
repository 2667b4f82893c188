//! Configuration management for layerfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Default bound on memoized resolution/stat entries
pub const DEFAULT_CACHE_ENTRIES: usize = 10_000;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Layer stack, in the order layers are registered
    #[serde(default)]
    pub layers: Vec<LayerConfig>,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
}

/// One directory tree participating in the stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Root directory of the layer
    pub path: PathBuf,

    /// Whether writes and copy-ups land in this layer
    #[serde(default)]
    pub writable: bool,

    /// Optional label (defaults to the directory name)
    #[serde(default)]
    pub label: Option<String>,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Memoize resolution and stat results
    pub enabled: bool,

    /// Maximum memoized entries per table (0 = unlimited)
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            max_entries: DEFAULT_CACHE_ENTRIES,
        }
    }
}

impl LayerConfig {
    pub fn readonly(path: impl Into<PathBuf>) -> Self {
        LayerConfig {
            path: path.into(),
            writable: false,
            label: None,
        }
    }

    pub fn writable(path: impl Into<PathBuf>) -> Self {
        LayerConfig {
            path: path.into(),
            writable: true,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label this layer will be registered under
    pub fn effective_label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| crate::fs::overlay::default_label(&self.path))
    }
}

impl Config {
    /// Load configuration from a JSON or YAML file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        };

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("LAYERFS_CACHE_ENABLED") {
            match enabled.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.cache.enabled = true,
                "0" | "false" | "no" | "off" => self.cache.enabled = false,
                _ => {}
            }
        }

        if let Ok(max_entries) = std::env::var("LAYERFS_CACHE_MAX_ENTRIES") {
            if let Ok(n) = max_entries.trim().parse::<usize>() {
                self.cache.max_entries = n;
            }
        }

        if let Ok(writable) = std::env::var("LAYERFS_WRITABLE") {
            let writable = writable.trim();
            if !writable.is_empty() {
                self.layers.retain(|l| !l.writable);
                self.layers.push(LayerConfig::writable(writable));
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one layer is required".to_string(),
            ));
        }

        if self.layers.iter().any(|l| l.path.as_os_str().is_empty()) {
            return Err(Error::InvalidConfig("Layer path must not be empty".to_string()));
        }

        if self.layers.iter().filter(|l| l.writable).count() > 1 {
            return Err(Error::InvalidConfig(
                "At most one writable layer may be configured".to_string(),
            ));
        }

        let mut labels = HashSet::new();
        for layer in &self.layers {
            let label = layer.effective_label();
            if !labels.insert(label.clone()) {
                return Err(Error::InvalidConfig(format!(
                    "Duplicate layer label: {}",
                    label
                )));
            }
        }

        Ok(())
    }

    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("layerfs")
            .join("config.json")
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Config {
        Config {
            layers: vec![
                LayerConfig::readonly("/srv/base").with_label("base"),
                LayerConfig::writable("/srv/overlay").with_label("overlay"),
            ],
            cache: CacheConfig::default(),
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.layers.is_empty());
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_entries, DEFAULT_CACHE_ENTRIES);
    }

    #[test]
    fn test_validate() {
        assert!(sample().validate().is_ok());
        assert!(Config::default().validate().is_err());

        let mut two_writable = sample();
        two_writable
            .layers
            .push(LayerConfig::writable("/srv/other").with_label("other"));
        assert!(two_writable.validate().is_err());

        let mut duplicate = sample();
        duplicate
            .layers
            .push(LayerConfig::readonly("/elsewhere/base"));
        assert!(duplicate.validate().is_err());
    }

    #[test]
    fn test_effective_label_defaults_to_dir_name() {
        assert_eq!(LayerConfig::readonly("/srv/base").effective_label(), "base");
        assert_eq!(
            LayerConfig::readonly("/srv/base").with_label("b").effective_label(),
            "b"
        );
    }

    #[test]
    fn test_save_and_load_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        sample().save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.layers.len(), 2);
        assert_eq!(loaded.layers[1].label.as_deref(), Some("overlay"));
        assert!(loaded.layers[1].writable);
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "layers:\n  - path: /srv/base\n  - path: /srv/overlay\n    writable: true\ncache:\n  enabled: false\n  max_entries: 16\n",
        )
        .unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.layers.len(), 2);
        assert!(!loaded.layers[0].writable);
        assert_eq!(loaded.cache.max_entries, 16);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }
}
