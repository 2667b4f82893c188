//! Copy-up
//!
//! Materializes a lower-layer node in the writable layer before it is
//! mutated. Directories are copied as empty nodes (their children follow on
//! demand), symlinks are recreated with the same target, regular files are
//! copied through a sibling temporary file and renamed into place, so an
//! interrupted copy never leaves a truncated file in the writable layer.

use crate::error::{Error, Result};
use std::fs::{self, File, FileTimes, Permissions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::entry::EntryKind;
use super::layer::Layer;
use super::resolver::{self, Resolved};
use crate::fs::path;

/// Create every missing ancestor of `logical` inside `writable`
///
/// Each directory created takes the mode of the merged directory it mirrors.
pub fn ensure_parents(layers: &[Arc<Layer>], writable: &Layer, logical: &Path) -> Result<()> {
    for ancestor in path::ancestors(logical) {
        if path::is_root(ancestor) {
            if !writable.is_dir(ancestor) {
                fs::create_dir_all(writable.root())?;
            }
            continue;
        }

        match writable.metadata(ancestor) {
            Some(meta) if meta.is_dir() => continue,
            Some(_) => return Err(Error::NotADirectory(ancestor.to_path_buf())),
            None => {}
        }

        let target = writable.physical(ancestor);
        fs::create_dir(&target).or_else(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists && target.is_dir() {
                Ok(())
            } else {
                Err(e)
            }
        })?;

        if let Some(source) = resolver::resolve(layers, ancestor) {
            if let Ok(meta) = fs::metadata(&source.path) {
                if meta.is_dir() {
                    fs::set_permissions(&target, meta.permissions())?;
                }
            }
        }
    }
    Ok(())
}

/// Copy one resolved node to `dest` (a physical path in the writable layer)
pub fn copy_node(source: &Resolved, dest: &Path) -> Result<EntryKind> {
    let meta = fs::symlink_metadata(&source.path)?;
    let kind = EntryKind::from(meta.file_type());

    match kind {
        EntryKind::Directory => {
            match fs::create_dir(dest) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dest.is_dir() => {}
                Err(e) => return Err(e.into()),
            }
            fs::set_permissions(dest, Permissions::from_mode(meta.permissions().mode()))?;
        }
        EntryKind::Symlink => {
            let target = fs::read_link(&source.path)?;
            std::os::unix::fs::symlink(&target, dest)?;
        }
        EntryKind::File => copy_file(&source.path, dest, &meta)?,
        EntryKind::Other => {
            return Err(Error::InvalidOperation(format!(
                "cannot copy up special file {}",
                source.path.display()
            )));
        }
    }

    debug!(
        from = %source.path.display(),
        to = %dest.display(),
        layer = %source.label(),
        kind = %kind,
        "Copied up"
    );
    Ok(kind)
}

fn copy_file(src: &Path, dest: &Path, meta: &fs::Metadata) -> Result<()> {
    let dir = dest
        .parent()
        .ok_or_else(|| Error::InvalidOperation(format!("no parent for {}", dest.display())))?;

    let mut staged = NamedTempFile::new_in(dir)?;
    {
        let mut reader = File::open(src)?;
        io::copy(&mut reader, staged.as_file_mut())?;
    }

    let file = staged.as_file();
    file.set_permissions(Permissions::from_mode(meta.permissions().mode()))?;
    let times = FileTimes::new()
        .set_accessed(meta.accessed()?)
        .set_modified(meta.modified()?);
    file.set_times(times)?;
    file.sync_all()?;

    // the temp file is removed on drop if persisting fails
    staged.persist(dest).map_err(|e| {
        warn!(dest = %dest.display(), error = %e.error, "Copy-up rename failed");
        Error::Io(e.error)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, tempfile::TempDir, Vec<Arc<Layer>>) {
        let upper = tempdir().unwrap();
        let lower = tempdir().unwrap();
        let layers = vec![
            Arc::new(Layer::new(upper.path(), true, Some("upper")).unwrap()),
            Arc::new(Layer::new(lower.path(), false, Some("lower")).unwrap()),
        ];
        (upper, lower, layers)
    }

    #[test]
    fn test_copy_file_preserves_mode_and_mtime() {
        let (_u, lower, layers) = setup();
        let src = lower.path().join("etc/conf");
        fs::create_dir_all(src.parent().unwrap()).unwrap();
        fs::write(&src, b"1.0").unwrap();
        fs::set_permissions(&src, Permissions::from_mode(0o640)).unwrap();
        let past = SystemTime::now() - Duration::from_secs(3600);
        File::options()
            .write(true)
            .open(&src)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let logical = Path::new("etc/conf");
        ensure_parents(&layers, &layers[0], logical).unwrap();
        let source = resolver::resolve(&layers, logical).unwrap();
        let dest = layers[0].physical(logical);
        assert_eq!(copy_node(&source, &dest).unwrap(), EntryKind::File);

        assert_eq!(fs::read(&dest).unwrap(), b"1.0");
        let meta = fs::metadata(&dest).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o640);
        assert_eq!(meta.modified().unwrap(), fs::metadata(&src).unwrap().modified().unwrap());
        // no temp files left behind
        assert_eq!(fs::read_dir(dest.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_copy_directory_is_shallow() {
        let (_u, lower, layers) = setup();
        fs::create_dir_all(lower.path().join("dir/child")).unwrap();
        fs::write(lower.path().join("dir/file"), b"x").unwrap();

        let logical = Path::new("dir");
        let source = resolver::resolve(&layers, logical).unwrap();
        let dest = layers[0].physical(logical);
        ensure_parents(&layers, &layers[0], logical).unwrap();
        assert_eq!(copy_node(&source, &dest).unwrap(), EntryKind::Directory);

        assert!(dest.is_dir());
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn test_copy_symlink_keeps_target() {
        let (_u, lower, layers) = setup();
        std::os::unix::fs::symlink("target/elsewhere", lower.path().join("link")).unwrap();

        let logical = Path::new("link");
        let source = resolver::resolve(&layers, logical).unwrap();
        let dest = layers[0].physical(logical);
        assert_eq!(copy_node(&source, &dest).unwrap(), EntryKind::Symlink);
        assert_eq!(fs::read_link(&dest).unwrap(), Path::new("target/elsewhere"));
    }

    #[test]
    fn test_ensure_parents_copies_directory_modes() {
        let (_u, lower, layers) = setup();
        fs::create_dir_all(lower.path().join("a/b")).unwrap();
        fs::set_permissions(lower.path().join("a"), Permissions::from_mode(0o750)).unwrap();

        ensure_parents(&layers, &layers[0], Path::new("a/b/file")).unwrap();
        let upper_a = layers[0].physical(Path::new("a"));
        assert!(layers[0].is_dir(Path::new("a/b")));
        assert_eq!(fs::metadata(upper_a).unwrap().permissions().mode() & 0o777, 0o750);
    }

    #[test]
    fn test_ensure_parents_rejects_file_ancestor() {
        let (upper, _l, layers) = setup();
        fs::write(upper.path().join("a"), b"file").unwrap();
        assert!(matches!(
            ensure_parents(&layers, &layers[0], Path::new("a/b")),
            Err(Error::NotADirectory(_))
        ));
    }
}
