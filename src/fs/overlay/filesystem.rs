//! Layered filesystem engine
//!
//! Combines a stack of directory trees into one merged view with
//! copy-on-write semantics. Reads resolve top-down through the stack; every
//! mutation lands in the active writable layer, copying lower content up
//! first when a modification needs the old bytes, and deletions of lower
//! content are recorded as whiteouts.

use crate::cache::{CacheStats, PathCache};
use crate::config::{Config, DEFAULT_CACHE_ENTRIES};
use crate::error::{Error, Result};
use crate::fs::path;
use dashmap::DashMap;
use nix::unistd::{access, AccessFlags};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::copy_up;
use super::entry::{ChangeKind, DiffEntry, Entry, EntryKind, StatSnapshot, TreeNode, Version};
use super::events::{HookEvent, HookPayload, Hooks};
use super::handle::{OpenMode, OverlayFile};
use super::layer::Layer;
use super::merger::Merger;
use super::registry::LayerRegistry;
use super::resolver::{self, Resolved};
use super::whiteout;

/// Engine options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsOptions {
    /// Memoize resolution and stat results
    pub cache_enabled: bool,
    /// Bound on memoized entries per table (0 = unlimited)
    pub cache_max_entries: usize,
}

impl Default for FsOptions {
    fn default() -> Self {
        FsOptions {
            cache_enabled: true,
            cache_max_entries: DEFAULT_CACHE_ENTRIES,
        }
    }
}

/// Merged view over a stack of layers
pub struct LayeredFs {
    /// Layer stack, top first
    registry: RwLock<LayerRegistry>,
    /// Resolution and lstat memo tables
    cache: PathCache<Option<Resolved>, StatSnapshot>,
    /// Lifecycle listeners
    hooks: Hooks,
    /// One lock per logical path being copied up
    copy_up_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl Default for LayeredFs {
    fn default() -> Self {
        Self::new()
    }
}

impl LayeredFs {
    /// Create an engine with no layers and the default cache
    pub fn new() -> Self {
        Self::with_options(FsOptions::default())
    }

    pub fn with_options(options: FsOptions) -> Self {
        Self {
            registry: RwLock::new(LayerRegistry::new()),
            cache: PathCache::new(options.cache_enabled, options.cache_max_entries),
            hooks: Hooks::new(),
            copy_up_locks: DashMap::new(),
        }
    }

    /// Build an engine from a validated configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let fs = Self::with_options(FsOptions {
            cache_enabled: config.cache.enabled,
            cache_max_entries: config.cache.max_entries,
        });
        for layer in &config.layers {
            fs.add_layer(&layer.path, layer.writable, layer.label.as_deref())?;
        }
        Ok(fs)
    }

    // ----- layers -----

    /// Register a layer. Writable layers go on top and become the active
    /// writable layer; read-only layers go to the bottom.
    pub fn add_layer(
        &self,
        root: impl AsRef<Path>,
        writable: bool,
        label: Option<&str>,
    ) -> Result<Arc<Layer>> {
        let layer = Layer::new(root, writable, label)?;
        if writable {
            fs::create_dir_all(layer.root())?;
        }

        let mut registry = self.registry.write();
        if registry.find(layer.label()).is_some() {
            return Err(Error::InvalidOperation(format!(
                "layer label '{}' is already registered",
                layer.label()
            )));
        }
        let layer = registry.add(layer);
        self.cache.clear();
        Ok(layer)
    }

    /// Remove every layer matching a label or root path
    pub fn remove_layer(&self, label_or_path: &str) -> Result<()> {
        let mut registry = self.registry.write();
        if registry.remove(label_or_path).is_empty() {
            return Err(Error::LayerNotFound(label_or_path.to_string()));
        }
        self.cache.clear();
        Ok(())
    }

    /// Make a registered writable layer the active one
    pub fn set_writable_layer(&self, label: &str) -> Result<Arc<Layer>> {
        let mut registry = self.registry.write();
        let layer = registry.set_writable(label)?;
        self.cache.clear();
        Ok(layer)
    }

    /// Snapshot of the stack, top first
    pub fn layers(&self) -> Vec<Arc<Layer>> {
        self.registry.read().layers()
    }

    pub fn writable_layer(&self) -> Option<Arc<Layer>> {
        self.registry.read().writable()
    }

    pub fn readonly_layers(&self) -> Vec<Arc<Layer>> {
        self.registry.read().readonly()
    }

    // ----- cache -----

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_enabled()
    }

    /// Turn memoization on or off; turning it off drops every entry
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache.set_enabled(enabled);
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    // ----- resolution -----

    /// The layer and physical path providing `path`, if it is visible
    pub fn resolve(&self, p: impl AsRef<Path>) -> Result<Option<Resolved>> {
        let logical = path::normalize(p)?;
        Ok(self.lookup(&logical))
    }

    pub fn which_layer(&self, p: impl AsRef<Path>) -> Option<String> {
        self.resolve(p)
            .ok()
            .flatten()
            .map(|r| r.label().to_string())
    }

    /// Is `path` provided by the active writable layer
    pub fn in_writable_layer(&self, p: impl AsRef<Path>) -> bool {
        let writable = match self.writable_layer() {
            Some(layer) => layer,
            None => return false,
        };
        matches!(self.resolve(p), Ok(Some(r)) if Arc::ptr_eq(&r.layer, &writable))
    }

    /// Does any layer below the active writable layer physically hold `path`
    pub fn exists_in_lower_layers(&self, p: impl AsRef<Path>) -> bool {
        let logical = match path::normalize(p) {
            Ok(logical) => logical,
            Err(_) => return false,
        };
        let lower = self.registry.read().lower();
        !resolver::physical_copies(&lower, &logical).is_empty()
    }

    /// Every physical copy of `path`, top first, markers ignored
    pub fn all_versions(&self, p: impl AsRef<Path>) -> Result<Vec<Version>> {
        let logical = path::normalize(p)?;
        let layers = self.layers();
        resolver::physical_copies(&layers, &logical)
            .into_iter()
            .map(|copy| {
                let meta = fs::symlink_metadata(&copy.path)?;
                Ok(Version {
                    layer: copy.label().to_string(),
                    writable: copy.layer.is_writable(),
                    kind: EntryKind::from(meta.file_type()),
                    size: meta.len(),
                    mtime: meta.modified()?,
                    path: copy.path,
                })
            })
            .collect()
    }

    /// Changes recorded in the active writable layer, sorted by path
    pub fn diff(&self) -> Result<Vec<DiffEntry>> {
        let (writable, lower) = {
            let registry = self.registry.read();
            (
                registry.writable().ok_or(Error::NoWritableLayer)?,
                registry.lower(),
            )
        };

        let mut out = Vec::new();
        if writable.is_dir(Path::new("")) {
            diff_dir(&writable, &lower, Path::new(""), &mut out)?;
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    // ----- predicates -----

    pub fn exists(&self, p: impl AsRef<Path>) -> bool {
        matches!(self.resolve(p), Ok(Some(_)))
    }

    pub fn is_file(&self, p: impl AsRef<Path>) -> bool {
        self.stat(p).map(|s| s.is_file()).unwrap_or(false)
    }

    pub fn is_dir(&self, p: impl AsRef<Path>) -> bool {
        self.stat(p).map(|s| s.is_dir()).unwrap_or(false)
    }

    pub fn is_symlink(&self, p: impl AsRef<Path>) -> bool {
        self.lstat(p).map(|s| s.is_symlink()).unwrap_or(false)
    }

    pub fn is_readable(&self, p: impl AsRef<Path>) -> bool {
        self.check_access(p, AccessFlags::R_OK)
    }

    /// Writable only when a writable layer exists and the resolved copy grants write access
    pub fn is_writable(&self, p: impl AsRef<Path>) -> bool {
        self.writable_layer().is_some() && self.check_access(p, AccessFlags::W_OK)
    }

    pub fn is_executable(&self, p: impl AsRef<Path>) -> bool {
        self.check_access(p, AccessFlags::X_OK)
    }

    /// Zero-length file or directory without merged children
    pub fn is_empty(&self, p: impl AsRef<Path>) -> bool {
        let p = p.as_ref();
        match self.stat(p) {
            Ok(stat) if stat.is_dir() => self.children(p).map(|c| c.is_empty()).unwrap_or(false),
            Ok(stat) => stat.size == 0,
            Err(_) => false,
        }
    }

    fn check_access(&self, p: impl AsRef<Path>, flags: AccessFlags) -> bool {
        match self.resolve(p) {
            Ok(Some(resolved)) => access(&resolved.path, flags).is_ok(),
            _ => false,
        }
    }

    // ----- metadata -----

    /// Attributes of `path`, following a final symlink
    pub fn stat(&self, p: impl AsRef<Path>) -> Result<StatSnapshot> {
        let logical = path::normalize(p)?;
        let snapshot = self.lstat_logical(&logical)?;
        if !snapshot.is_symlink() {
            return Ok(snapshot);
        }
        let resolved = self.require(&logical)?;
        let meta = fs::metadata(&resolved.path)?;
        Ok(StatSnapshot::from_metadata(&meta, resolved.label()))
    }

    /// Attributes of `path` itself (memoized)
    pub fn lstat(&self, p: impl AsRef<Path>) -> Result<StatSnapshot> {
        let logical = path::normalize(p)?;
        self.lstat_logical(&logical)
    }

    pub fn size(&self, p: impl AsRef<Path>) -> Result<u64> {
        Ok(self.stat(p)?.size)
    }

    pub fn mtime(&self, p: impl AsRef<Path>) -> Result<SystemTime> {
        Ok(self.stat(p)?.mtime)
    }

    pub fn atime(&self, p: impl AsRef<Path>) -> Result<SystemTime> {
        Ok(self.stat(p)?.atime)
    }

    pub fn ctime(&self, p: impl AsRef<Path>) -> Result<SystemTime> {
        Ok(self.stat(p)?.ctime)
    }

    /// Type of `path` itself (symlinks are not followed)
    pub fn ftype(&self, p: impl AsRef<Path>) -> Result<EntryKind> {
        Ok(self.lstat(p)?.kind)
    }

    /// BLAKE3 hex digest of the visible content of a file
    pub fn checksum(&self, p: impl AsRef<Path>) -> Result<String> {
        let logical = path::normalize(p)?;
        let resolved = self.require(&logical)?;
        if fs::metadata(&resolved.path)?.is_dir() {
            return Err(Error::IsADirectory(logical));
        }
        let mut file = File::open(&resolved.path)?;
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(hasher.finalize().to_hex().to_string())
    }

    // ----- directories -----

    /// Create one directory; the parent must already exist in the merged view
    pub fn mkdir(&self, p: impl AsRef<Path>) -> Result<PathBuf> {
        let (logical, writable) = self.target(p)?;
        if path::is_root(&logical) || self.lookup(&logical).is_some() {
            return Err(Error::AlreadyExists(logical));
        }
        if let Some((parent, _)) = path::split(&logical) {
            if !path::is_root(parent) {
                match self.lstat_logical(parent) {
                    Ok(stat) if stat.is_dir() => {}
                    Ok(_) => return Err(Error::NotADirectory(parent.to_path_buf())),
                    Err(_) => return Err(Error::NotFound(parent.to_path_buf())),
                }
            }
        }
        self.make_dir(&writable, &logical)
    }

    /// Create a directory and any missing ancestors; existing directories are fine
    ///
    /// Symlinks are not followed: the merged view never resolves through a
    /// symlinked ancestor, so one in the chain is `NotADirectory`.
    pub fn mkdir_p(&self, p: impl AsRef<Path>) -> Result<()> {
        let (logical, writable) = self.target(p)?;
        let mut chain = path::ancestors(&logical);
        chain.push(&logical);

        for dir in chain {
            if path::is_root(dir) {
                continue;
            }
            match self.lookup(dir) {
                Some(_) => {
                    let stat = self.lstat_logical(dir)?;
                    if stat.is_dir() {
                        continue;
                    }
                    return Err(if dir == logical.as_path() {
                        Error::AlreadyExists(logical.clone())
                    } else {
                        Error::NotADirectory(dir.to_path_buf())
                    });
                }
                None => {
                    self.make_dir(&writable, dir)?;
                }
            }
        }
        Ok(())
    }

    /// Remove an empty directory
    pub fn rmdir(&self, p: impl AsRef<Path>) -> Result<()> {
        let (logical, writable) = self.target(p)?;
        if path::is_root(&logical) {
            return Err(Error::InvalidOperation("cannot remove the root".to_string()));
        }
        let stat = self.lstat_logical(&logical)?;
        if !stat.is_dir() {
            return Err(Error::NotADirectory(logical));
        }
        if !self.merged_entries(&logical)?.is_empty() {
            return Err(Error::NotEmpty(logical));
        }

        self.remove_node(&writable, &logical)?;
        debug!("rmdir({})", logical.display());
        self.hooks
            .trigger(HookPayload::new(HookEvent::AfterRmdir, &logical))
    }

    /// Merged children of a directory, sorted by name
    pub fn entries(&self, p: impl AsRef<Path>) -> Result<Vec<Entry>> {
        let logical = path::normalize(p)?;
        self.require_dir(&logical)?;
        self.merged_entries(&logical)
    }

    /// Names of the merged children of a directory
    pub fn children(&self, p: impl AsRef<Path>) -> Result<Vec<String>> {
        Ok(self.entries(p)?.into_iter().map(|e| e.name).collect())
    }

    /// Merged entries whose logical path matches a glob pattern
    pub fn glob(&self, pattern: &str) -> Result<Vec<Entry>> {
        let layers = self.layers();
        Merger::new(&layers).glob(pattern)
    }

    /// Depth-first merged walk below a directory
    pub fn find(
        &self,
        p: impl AsRef<Path>,
        predicate: Option<&dyn Fn(&Entry) -> bool>,
    ) -> Result<Vec<Entry>> {
        let logical = path::normalize(p)?;
        self.require_dir(&logical)?;
        let layers = self.layers();
        Merger::new(&layers).find(&logical, predicate)
    }

    /// Nested merged listing, `depth` levels deep (None = unlimited)
    pub fn tree(&self, p: impl AsRef<Path>, depth: Option<usize>) -> Result<TreeNode> {
        let logical = path::normalize(p)?;
        self.require_dir(&logical)?;
        let layers = self.layers();
        Merger::new(&layers).tree(&logical, depth)
    }

    // ----- files -----

    pub fn read(&self, p: impl AsRef<Path>) -> Result<String> {
        let bytes = self.read_binary(p)?;
        String::from_utf8(bytes).map_err(|e| Error::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
    }

    pub fn read_binary(&self, p: impl AsRef<Path>) -> Result<Vec<u8>> {
        let logical = path::normalize(p)?;
        let resolved = self.require(&logical)?;
        if fs::metadata(&resolved.path)?.is_dir() {
            return Err(Error::IsADirectory(logical));
        }

        self.hooks.trigger(
            HookPayload::new(HookEvent::BeforeRead, &logical).with_source(&resolved.path),
        )?;
        let data = fs::read(&resolved.path)?;
        self.hooks.trigger(
            HookPayload::new(HookEvent::AfterRead, &logical)
                .with_source(&resolved.path)
                .with_bytes(data.len()),
        )?;
        Ok(data)
    }

    /// Replace the content of a file, creating it and its parents as needed
    pub fn write(&self, p: impl AsRef<Path>, content: &str) -> Result<()> {
        self.write_binary(p, content.as_bytes())
    }

    pub fn write_binary(&self, p: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        let (logical, writable) = self.target(p)?;
        self.put_file(&writable, &logical, data)?;
        Ok(())
    }

    /// Replace the content of a file through a temporary file and rename,
    /// so readers see either the old or the new content
    pub fn atomic_write(&self, p: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        let (logical, writable) = self.target(p)?;
        let previous = self.writable_file_target(&logical)?;

        self.hooks.trigger(
            HookPayload::new(HookEvent::BeforeWrite, &logical).with_bytes(data.len()),
        )?;
        self.prepare_parents(&writable, &logical)?;
        self.claim_target(&writable, &logical)?;

        let dest = writable.physical(&logical);
        let dir = dest
            .parent()
            .ok_or_else(|| Error::InvalidOperation(format!("no parent for {}", dest.display())))?;
        let mut staged = NamedTempFile::new_in(dir)?;
        staged.write_all(data)?;
        if let Some(mode) = previous {
            staged.as_file().set_permissions(Permissions::from_mode(mode))?;
        }
        staged.as_file().sync_all()?;
        staged.persist(&dest).map_err(|e| {
            warn!(dest = %dest.display(), error = %e.error, "Atomic write rename failed");
            Error::Io(e.error)
        })?;

        self.cache.invalidate(&logical);
        debug!("atomic_write({}, {} bytes)", logical.display(), data.len());
        self.hooks.trigger(
            HookPayload::new(HookEvent::AfterWrite, &logical)
                .with_destination(&dest)
                .with_bytes(data.len()),
        )
    }

    /// Append to a file, copying it up first if a lower layer provides it
    pub fn append(&self, p: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        let (logical, writable) = self.target(p)?;
        if path::is_root(&logical) {
            return Err(Error::IsADirectory(logical));
        }
        let exists = match self.lstat_logical(&logical) {
            Ok(stat) if stat.is_dir() => return Err(Error::IsADirectory(logical)),
            Ok(_) => true,
            Err(_) => false,
        };

        self.hooks.trigger(
            HookPayload::new(HookEvent::BeforeWrite, &logical).with_bytes(data.len()),
        )?;

        let (dest, copied) = self.with_path_lock(&logical, || {
            let (dest, copied) = if exists {
                self.copy_up_locked(&logical)?
            } else {
                self.prepare_parents(&writable, &logical)?;
                self.claim_target(&writable, &logical)?;
                (writable.physical(&logical), None)
            };
            let mut file = OpenOptions::new().create(true).append(true).open(&dest)?;
            file.write_all(data)?;
            self.cache.invalidate(&logical);
            Ok((dest, copied))
        })?;

        if let Some(payload) = copied {
            self.hooks.trigger(payload)?;
        }
        debug!("append({}, {} bytes)", logical.display(), data.len());
        self.hooks.trigger(
            HookPayload::new(HookEvent::AfterWrite, &logical)
                .with_destination(&dest)
                .with_bytes(data.len()),
        )
    }

    /// Open a file in the merged view
    ///
    /// Read-only modes open the visible copy directly. Truncating modes and
    /// files already in the writable layer open the writable copy. Other
    /// write modes on a lower-layer file return a handle that copies the file
    /// up on its first write.
    pub fn open(&self, p: impl AsRef<Path>, mode: OpenMode) -> Result<OverlayFile<'_>> {
        let logical = path::normalize(p)?;
        let existing = self.lookup(&logical);
        if let Some(resolved) = &existing {
            if fs::metadata(&resolved.path).map(|m| m.is_dir()).unwrap_or(false) {
                return Err(Error::IsADirectory(logical));
            }
        }

        if !mode.is_writable() {
            let resolved = existing.ok_or_else(|| Error::NotFound(logical.clone()))?;
            let file = File::open(&resolved.path)?;
            return Ok(OverlayFile::direct(self, logical, mode, file));
        }

        whiteout::check_not_reserved(&logical)?;
        let writable = self.writable()?;

        match existing {
            Some(resolved) if Arc::ptr_eq(&resolved.layer, &writable) => {
                let file = mode.options().open(&resolved.path)?;
                self.cache.invalidate_entry(&logical);
                Ok(OverlayFile::direct(self, logical, mode, file))
            }
            Some(resolved) if !mode.truncates() => {
                let file = File::open(&resolved.path)?;
                debug!("open({}) deferred on layer {}", logical.display(), resolved.label());
                Ok(OverlayFile::deferred(self, logical, mode, file))
            }
            existing => {
                if existing.is_none() && !mode.creates() {
                    return Err(Error::NotFound(logical));
                }
                self.prepare_parents(&writable, &logical)?;
                self.claim_target(&writable, &logical)?;
                let file = mode.options().open(writable.physical(&logical))?;
                self.cache.invalidate(&logical);
                Ok(OverlayFile::direct(self, logical, mode, file))
            }
        }
    }

    /// Open a file, run `f` on the handle, flush and close it
    pub fn with_open<T>(
        &self,
        p: impl AsRef<Path>,
        mode: OpenMode,
        f: impl FnOnce(&mut OverlayFile<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut file = self.open(p, mode)?;
        let out = f(&mut file)?;
        file.flush()?;
        Ok(out)
    }

    /// Copy a file, symlink or directory tree within the merged view
    pub fn copy(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        let source = path::normalize(src)?;
        let (dest, writable) = self.target(dst)?;
        if dest.starts_with(&source) {
            return Err(Error::InvalidOperation(format!(
                "cannot copy {} into itself",
                path::display(&source)
            )));
        }
        self.copy_tree(&writable, &source, &dest)
    }

    /// Move a file or directory tree within the merged view
    pub fn rename(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        let source = path::normalize(src)?;
        let (dest, writable) = self.target(dst)?;
        whiteout::check_not_reserved(&source)?;
        self.require(&source)?;
        if source == dest {
            return Ok(());
        }
        if path::is_root(&source) || dest.starts_with(&source) {
            return Err(Error::InvalidOperation(format!(
                "cannot move {} into itself",
                path::display(&source)
            )));
        }

        self.copy_tree(&writable, &source, &dest)?;
        self.delete_recursive(&source, false)?;
        debug!("rename({} -> {})", source.display(), dest.display());
        Ok(())
    }

    /// Delete a file, symlink or empty directory
    ///
    /// With `force`, a missing path is not an error.
    pub fn delete(&self, p: impl AsRef<Path>, force: bool) -> Result<()> {
        let (logical, writable) = self.target(p)?;
        let stat = match self.deletable(&logical, force)? {
            Some(stat) => stat,
            None => return Ok(()),
        };
        if stat.is_dir() && !self.merged_entries(&logical)?.is_empty() {
            return Err(Error::NotEmpty(logical));
        }

        self.hooks
            .trigger(HookPayload::new(HookEvent::BeforeDelete, &logical))?;
        self.remove_node(&writable, &logical)?;
        debug!("delete({})", logical.display());
        self.hooks
            .trigger(HookPayload::new(HookEvent::AfterDelete, &logical))
    }

    /// Delete a path and everything visible below it
    pub fn delete_recursive(&self, p: impl AsRef<Path>, force: bool) -> Result<()> {
        let (logical, writable) = self.target(p)?;
        let stat = match self.deletable(&logical, force)? {
            Some(stat) => stat,
            None => return Ok(()),
        };

        // children first, each through the hooked delete path
        if stat.is_dir() {
            for entry in self.merged_entries(&logical)? {
                if entry.is_dir() {
                    self.delete_recursive(&entry.relative_path, false)?;
                } else {
                    self.delete(&entry.relative_path, false)?;
                }
            }
        }

        self.hooks
            .trigger(HookPayload::new(HookEvent::BeforeDelete, &logical))?;
        self.remove_node(&writable, &logical)?;
        debug!("delete_recursive({})", logical.display());
        self.hooks
            .trigger(HookPayload::new(HookEvent::AfterDelete, &logical))
    }

    // ----- symlinks -----

    /// Create a symlink at `link` pointing to `target`
    pub fn symlink(&self, target: impl AsRef<Path>, link: impl AsRef<Path>) -> Result<()> {
        let (logical, writable) = self.target(link)?;
        if path::is_root(&logical) || self.lookup(&logical).is_some() {
            return Err(Error::AlreadyExists(logical));
        }
        self.prepare_parents(&writable, &logical)?;
        self.claim_target(&writable, &logical)?;
        std::os::unix::fs::symlink(target.as_ref(), writable.physical(&logical))?;
        self.cache.invalidate(&logical);
        debug!("symlink({} -> {})", logical.display(), target.as_ref().display());
        Ok(())
    }

    pub fn readlink(&self, p: impl AsRef<Path>) -> Result<PathBuf> {
        let logical = path::normalize(p)?;
        let resolved = self.require(&logical)?;
        if !self.lstat_logical(&logical)?.is_symlink() {
            return Err(Error::InvalidOperation(format!(
                "{} is not a symlink",
                path::display(&logical)
            )));
        }
        Ok(fs::read_link(&resolved.path)?)
    }

    /// Canonical physical path of the visible copy, symlinks dereferenced
    pub fn realpath(&self, p: impl AsRef<Path>) -> Result<PathBuf> {
        let logical = path::normalize(p)?;
        let resolved = self.require(&logical)?;
        Ok(fs::canonicalize(&resolved.path)?)
    }

    // ----- markers -----

    /// Hide `path` from every layer below the writable layer
    pub fn create_whiteout(&self, p: impl AsRef<Path>) -> Result<PathBuf> {
        let (logical, writable) = self.target(p)?;
        let layers = self.layers();
        copy_up::ensure_parents(&layers, &writable, &logical)?;
        let marker = whiteout::create_whiteout(&writable, &logical)?;
        self.cache.invalidate(&logical);
        Ok(marker)
    }

    pub fn remove_whiteout(&self, p: impl AsRef<Path>) -> Result<bool> {
        let (logical, writable) = self.target(p)?;
        let removed = whiteout::remove_whiteout(&writable, &logical)?;
        self.cache.invalidate(&logical);
        Ok(removed)
    }

    /// Does any layer hold a whiteout for `path`
    pub fn is_whiteout(&self, p: impl AsRef<Path>) -> bool {
        match path::normalize(p) {
            Ok(logical) => self
                .layers()
                .iter()
                .any(|layer| whiteout::has_whiteout(layer, &logical)),
            Err(_) => false,
        }
    }

    /// Stop merging lower-layer children into a directory
    pub fn make_opaque(&self, p: impl AsRef<Path>) -> Result<PathBuf> {
        let (logical, writable) = self.target(p)?;
        if !self.lstat_logical(&logical)?.is_dir() {
            return Err(Error::NotADirectory(logical));
        }
        if !writable.is_dir(&logical) {
            let layers = self.layers();
            copy_up::ensure_parents(&layers, &writable, &logical)?;
            fs::create_dir(writable.physical(&logical))?;
        }
        let marker = whiteout::create_opaque(&writable, &logical)?;
        self.cache.invalidate(&logical);
        Ok(marker)
    }

    pub fn remove_opaque(&self, p: impl AsRef<Path>) -> Result<bool> {
        let (logical, writable) = self.target(p)?;
        let removed = whiteout::remove_opaque(&writable, &logical)?;
        self.cache.invalidate(&logical);
        Ok(removed)
    }

    /// Does any layer mark `path` opaque
    pub fn is_opaque(&self, p: impl AsRef<Path>) -> bool {
        match path::normalize(p) {
            Ok(logical) => self
                .layers()
                .iter()
                .any(|layer| whiteout::has_opaque(layer, &logical)),
            Err(_) => false,
        }
    }

    // ----- copy-up -----

    /// Materialize `path` in the writable layer; returns the writable physical path
    ///
    /// A path already provided by the writable layer is returned unchanged.
    pub fn copy_up(&self, p: impl AsRef<Path>) -> Result<PathBuf> {
        let logical = path::normalize(p)?;
        self.writable()?;
        let (dest, event) = self.with_path_lock(&logical, || self.copy_up_locked(&logical))?;
        if let Some(payload) = event {
            self.hooks.trigger(payload)?;
        }
        Ok(dest)
    }

    /// Copy up while the caller holds the path lock; the returned event is
    /// fired by the caller after the lock is released
    pub(crate) fn copy_up_locked(&self, logical: &Path) -> Result<(PathBuf, Option<HookPayload>)> {
        let writable = self.writable()?;
        let dest = writable.physical(logical);
        let source = self.require(logical)?;
        if Arc::ptr_eq(&source.layer, &writable) {
            return Ok((dest, None));
        }

        let layers = self.layers();
        copy_up::ensure_parents(&layers, &writable, logical)?;
        copy_up::copy_node(&source, &dest)?;
        self.cache.invalidate(logical);

        let payload = HookPayload::new(HookEvent::AfterCopyUp, logical)
            .with_source(&source.path)
            .with_destination(&dest);
        Ok((dest, Some(payload)))
    }

    pub(crate) fn path_lock(&self, logical: &Path) -> Arc<Mutex<()>> {
        self.copy_up_locks
            .entry(logical.to_path_buf())
            .or_default()
            .value()
            .clone()
    }

    /// Drop a lock taken with [`path_lock`](Self::path_lock), forgetting it when unused
    pub(crate) fn release_path_lock(&self, logical: &Path, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.copy_up_locks
            .remove_if(logical, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn with_path_lock<T>(&self, logical: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.path_lock(logical);
        let result = {
            let _guard = lock.lock();
            f()
        };
        self.release_path_lock(logical, lock);
        result
    }

    /// Forget memoized data for a file whose content changed
    pub(crate) fn invalidate_entry(&self, logical: &Path) {
        self.cache.invalidate_entry(logical);
    }

    // ----- hooks -----

    /// Subscribe a listener to a lifecycle event
    pub fn on<F>(&self, event: HookEvent, listener: F)
    where
        F: Fn(&HookPayload) -> Result<()> + Send + Sync + 'static,
    {
        self.hooks.on(event, listener);
    }

    pub fn trigger(&self, payload: HookPayload) -> Result<()> {
        self.hooks.trigger(payload)
    }

    pub fn clear_hooks(&self, event: Option<HookEvent>) {
        self.hooks.clear(event);
    }

    // ----- internals -----

    fn lookup(&self, logical: &Path) -> Option<Resolved> {
        if let Some(hit) = self.cache.get_resolved(logical) {
            return hit;
        }
        let (layers, epoch) = {
            let registry = self.registry.read();
            (registry.layers(), self.cache.epoch())
        };
        let resolved = resolver::resolve(&layers, logical);
        self.cache
            .put_resolved(logical.to_path_buf(), resolved.clone(), epoch);
        resolved
    }

    fn lstat_logical(&self, logical: &Path) -> Result<StatSnapshot> {
        if let Some(hit) = self.cache.get_stat(logical) {
            return Ok(hit);
        }
        let epoch = self.cache.epoch();
        let resolved = self.require(logical)?;
        let meta = fs::symlink_metadata(&resolved.path)?;
        let snapshot = StatSnapshot::from_metadata(&meta, resolved.label());
        self.cache
            .put_stat(logical.to_path_buf(), snapshot.clone(), epoch);
        Ok(snapshot)
    }

    fn require(&self, logical: &Path) -> Result<Resolved> {
        self.lookup(logical)
            .ok_or_else(|| Error::NotFound(logical.to_path_buf()))
    }

    fn require_dir(&self, logical: &Path) -> Result<()> {
        if self.lstat_logical(logical)?.is_dir() {
            Ok(())
        } else {
            Err(Error::NotADirectory(logical.to_path_buf()))
        }
    }

    fn writable(&self) -> Result<Arc<Layer>> {
        self.registry.read().writable().ok_or(Error::NoWritableLayer)
    }

    /// Normalize a mutation target and fetch the active writable layer
    fn target(&self, p: impl AsRef<Path>) -> Result<(PathBuf, Arc<Layer>)> {
        let logical = path::normalize(p)?;
        whiteout::check_not_reserved(&logical)?;
        let writable = self.writable()?;
        Ok((logical, writable))
    }

    fn merged_entries(&self, logical: &Path) -> Result<Vec<Entry>> {
        let layers = self.layers();
        Merger::new(&layers).entries(logical)
    }

    /// Stat of a delete target; None when it is missing and `force` is set
    fn deletable(&self, logical: &Path, force: bool) -> Result<Option<StatSnapshot>> {
        if path::is_root(logical) {
            return Err(Error::InvalidOperation("cannot delete the root".to_string()));
        }
        match self.lstat_logical(logical) {
            Ok(stat) => Ok(Some(stat)),
            Err(e) if force && e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Mode to carry over when replacing a file; rejects directories
    fn writable_file_target(&self, logical: &Path) -> Result<Option<u32>> {
        if path::is_root(logical) {
            return Err(Error::IsADirectory(logical.to_path_buf()));
        }
        match self.lookup(logical) {
            Some(resolved) => {
                let meta = fs::symlink_metadata(&resolved.path)?;
                if meta.is_dir() {
                    return Err(Error::IsADirectory(logical.to_path_buf()));
                }
                Ok(meta.is_file().then(|| meta.permissions().mode()))
            }
            None => Ok(None),
        }
    }

    /// Make every ancestor of `logical` a directory in the writable layer
    ///
    /// An ancestor the writable layer had whited out is recreated opaque, so
    /// the deleted lower content stays hidden. A symlinked ancestor is
    /// rejected, matching resolution.
    fn prepare_parents(&self, writable: &Layer, logical: &Path) -> Result<()> {
        for ancestor in path::ancestors(logical) {
            if path::is_root(ancestor) {
                continue;
            }
            if let Ok(stat) = self.lstat_logical(ancestor) {
                if !stat.is_dir() {
                    return Err(Error::NotADirectory(ancestor.to_path_buf()));
                }
            }
            if whiteout::remove_whiteout(writable, ancestor)? {
                remove_physical(writable, ancestor)?;
                fs::create_dir_all(writable.physical(ancestor))?;
                whiteout::create_opaque(writable, ancestor)?;
                self.cache.invalidate(ancestor);
            }
        }
        let layers = self.layers();
        copy_up::ensure_parents(&layers, writable, logical)
    }

    /// Clear a whiteout on the target itself; returns whether one was there
    fn claim_target(&self, writable: &Layer, logical: &Path) -> Result<bool> {
        let recreated = whiteout::remove_whiteout(writable, logical)?;
        if recreated {
            remove_physical(writable, logical)?;
            self.cache.invalidate(logical);
        }
        Ok(recreated)
    }

    fn make_dir(&self, writable: &Layer, logical: &Path) -> Result<PathBuf> {
        self.prepare_parents(writable, logical)?;
        let recreated = self.claim_target(writable, logical)?;
        let dest = writable.physical(logical);
        fs::create_dir(&dest)?;
        if recreated {
            whiteout::create_opaque(writable, logical)?;
        }
        self.cache.invalidate(logical);

        debug!("mkdir({}) opaque={}", logical.display(), recreated);
        self.hooks.trigger(
            HookPayload::new(HookEvent::AfterMkdir, logical).with_destination(&dest),
        )?;
        Ok(dest)
    }

    fn put_file(&self, writable: &Layer, logical: &Path, data: &[u8]) -> Result<PathBuf> {
        let previous = self.writable_file_target(logical)?;

        self.hooks.trigger(
            HookPayload::new(HookEvent::BeforeWrite, logical).with_bytes(data.len()),
        )?;
        self.prepare_parents(writable, logical)?;
        self.claim_target(writable, logical)?;

        let dest = writable.physical(logical);
        let fresh = !writable.exists(logical);
        fs::write(&dest, data)?;
        if let (true, Some(mode)) = (fresh, previous) {
            fs::set_permissions(&dest, Permissions::from_mode(mode))?;
        }
        self.cache.invalidate(logical);

        debug!("write({}, {} bytes)", logical.display(), data.len());
        self.hooks.trigger(
            HookPayload::new(HookEvent::AfterWrite, logical)
                .with_destination(&dest)
                .with_bytes(data.len()),
        )?;
        Ok(dest)
    }

    /// Remove the writable copy of `logical`; whiteout it if a lower copy is still visible
    fn remove_node(&self, writable: &Layer, logical: &Path) -> Result<()> {
        remove_physical(writable, logical)?;
        self.cache.invalidate(logical);

        if self.lookup(logical).is_some() {
            let layers = self.layers();
            copy_up::ensure_parents(&layers, writable, logical)?;
            whiteout::create_whiteout(writable, logical)?;
            self.cache.invalidate(logical);
        }
        Ok(())
    }

    fn copy_tree(&self, writable: &Layer, source: &Path, dest: &Path) -> Result<()> {
        let resolved = self.require(source)?;
        let stat = self.lstat_logical(source)?;

        match stat.kind {
            EntryKind::Directory => {
                if self.lookup(dest).is_some() {
                    if !self.lstat_logical(dest)?.is_dir() {
                        return Err(Error::AlreadyExists(dest.to_path_buf()));
                    }
                } else {
                    let created = self.make_dir(writable, dest)?;
                    fs::set_permissions(created, Permissions::from_mode(stat.mode))?;
                }
                for entry in self.merged_entries(source)? {
                    self.copy_tree(writable, &entry.relative_path, &dest.join(&entry.name))?;
                }
            }
            EntryKind::Symlink => {
                let target = fs::read_link(&resolved.path)?;
                if let Some(existing) = self.lookup(dest) {
                    if fs::symlink_metadata(&existing.path)?.is_dir() {
                        return Err(Error::IsADirectory(dest.to_path_buf()));
                    }
                }
                self.prepare_parents(writable, dest)?;
                self.claim_target(writable, dest)?;
                remove_physical(writable, dest)?;
                std::os::unix::fs::symlink(&target, writable.physical(dest))?;
                self.cache.invalidate(dest);
            }
            EntryKind::File => {
                let data = fs::read(&resolved.path)?;
                let written = self.put_file(writable, dest, &data)?;
                fs::set_permissions(written, Permissions::from_mode(stat.mode))?;
            }
            EntryKind::Other => {
                return Err(Error::InvalidOperation(format!(
                    "cannot copy special file {}",
                    path::display(source)
                )));
            }
        }
        Ok(())
    }
}

/// Delete whatever `layer` physically holds at `logical`
fn remove_physical(layer: &Layer, logical: &Path) -> Result<()> {
    match layer.metadata(logical) {
        Some(meta) if meta.is_dir() => fs::remove_dir_all(layer.physical(logical))?,
        Some(_) => fs::remove_file(layer.physical(logical))?,
        None => {}
    }
    Ok(())
}

fn diff_dir(
    writable: &Layer,
    lower: &[Arc<Layer>],
    dir: &Path,
    out: &mut Vec<DiffEntry>,
) -> Result<()> {
    for raw in writable.readdir(dir)? {
        if whiteout::is_opaque_name(&raw.name) {
            out.push(DiffEntry {
                path: dir.to_path_buf(),
                change: ChangeKind::Opaque,
                kind: Some(EntryKind::Directory),
            });
            continue;
        }
        if let Some(target) = whiteout::whiteout_target(&raw.name) {
            let logical = dir.join(target);
            let kind = resolver::resolve(lower, &logical)
                .and_then(|r| fs::symlink_metadata(&r.path).ok())
                .map(|m| EntryKind::from(m.file_type()));
            out.push(DiffEntry {
                path: logical,
                change: ChangeKind::Deleted,
                kind,
            });
            continue;
        }
        if whiteout::is_marker_name(&raw.name) {
            continue;
        }

        let logical = dir.join(&raw.name);
        let below = resolver::resolve(lower, &logical).is_some();
        match (raw.kind, below) {
            // directories that only host changes are not changes themselves
            (EntryKind::Directory, true) => {}
            (kind, true) => out.push(DiffEntry {
                path: logical.clone(),
                change: ChangeKind::Modified,
                kind: Some(kind),
            }),
            (kind, false) => out.push(DiffEntry {
                path: logical.clone(),
                change: ChangeKind::Added,
                kind: Some(kind),
            }),
        }

        if raw.kind == EntryKind::Directory {
            diff_dir(writable, lower, &logical, out)?;
        }
    }
    Ok(())
}
