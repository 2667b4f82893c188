//! Overlay file handles
//!
//! A write-capable handle on a file that only exists in a lower layer starts
//! out reading the lower copy. The first mutating call copies the file up,
//! reopens it in the writable layer at the same stream position and then
//! performs the write. Handles that are only ever read never trigger a copy.

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use super::events::HookPayload;
use super::filesystem::LayeredFs;

/// How a file is opened, using the familiar `fopen` mode strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `r`
    Read,
    /// `r+`
    ReadWrite,
    /// `w`
    Write,
    /// `w+`
    WriteRead,
    /// `a`
    Append,
    /// `a+`
    AppendRead,
}

impl OpenMode {
    pub fn is_readable(&self) -> bool {
        !matches!(self, OpenMode::Write | OpenMode::Append)
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self, OpenMode::Read)
    }

    pub fn is_append(&self) -> bool {
        matches!(self, OpenMode::Append | OpenMode::AppendRead)
    }

    /// Opening discards existing content
    pub fn truncates(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::WriteRead)
    }

    /// Opening creates a missing file
    pub fn creates(&self) -> bool {
        !matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    /// Options for opening the physical file in this mode
    pub fn options(&self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.is_readable())
            .write(self.is_writable() && !self.is_append())
            .append(self.is_append())
            .truncate(self.truncates())
            .create(self.creates());
        opts
    }

    /// Options for reopening an already materialized copy
    fn reopen_options(&self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(self.is_readable())
            .write(!self.is_append())
            .append(self.is_append());
        opts
    }
}

impl FromStr for OpenMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mode = s.replace('b', "");
        match mode.as_str() {
            "r" => Ok(OpenMode::Read),
            "r+" => Ok(OpenMode::ReadWrite),
            "w" => Ok(OpenMode::Write),
            "w+" => Ok(OpenMode::WriteRead),
            "a" => Ok(OpenMode::Append),
            "a+" => Ok(OpenMode::AppendRead),
            _ => Err(Error::InvalidOperation(format!("invalid open mode: {}", s))),
        }
    }
}

/// An open file in the merged view
pub struct OverlayFile<'a> {
    fs: &'a LayeredFs,
    logical: PathBuf,
    mode: OpenMode,
    file: File,
    /// Still reading a lower-layer copy
    deferred: bool,
}

impl<'a> OverlayFile<'a> {
    pub(crate) fn direct(fs: &'a LayeredFs, logical: PathBuf, mode: OpenMode, file: File) -> Self {
        Self {
            fs,
            logical,
            mode,
            file,
            deferred: false,
        }
    }

    pub(crate) fn deferred(
        fs: &'a LayeredFs,
        logical: PathBuf,
        mode: OpenMode,
        file: File,
    ) -> Self {
        Self {
            fs,
            logical,
            mode,
            file,
            deferred: true,
        }
    }

    /// Logical path this handle was opened on
    pub fn path(&self) -> &Path {
        &self.logical
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// True until the first mutating call copies the file up
    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    /// Truncate or extend the file
    pub fn set_len(&mut self, size: u64) -> Result<()> {
        self.mutate(|file| file.set_len(size))?;
        Ok(())
    }

    pub fn sync_all(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn metadata(&self) -> Result<std::fs::Metadata> {
        Ok(self.file.metadata()?)
    }

    /// Copy up if still deferred, then run `op` on the writable copy
    fn mutate<T>(&mut self, op: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        if !self.mode.is_writable() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for writing",
            ));
        }

        if !self.deferred {
            let out = op(&mut self.file)?;
            self.fs.invalidate_entry(&self.logical);
            return Ok(out);
        }

        let lock = self.fs.path_lock(&self.logical);
        let result = {
            let _guard = lock.lock();
            self.materialize().and_then(|event| {
                let out = op(&mut self.file);
                self.fs.invalidate_entry(&self.logical);
                out.map(|out| (out, event))
            })
        };
        self.fs.release_path_lock(&self.logical, lock);

        let (out, event) = result?;
        if let Some(payload) = event {
            self.fs.trigger(payload)?;
        }
        Ok(out)
    }

    /// Copy the file up and reopen it at the current position
    fn materialize(&mut self) -> io::Result<Option<HookPayload>> {
        let position = self.file.stream_position()?;
        let (dest, event) = self.fs.copy_up_locked(&self.logical)?;

        let mut file = self.mode.reopen_options().open(&dest)?;
        if !self.mode.is_append() {
            file.seek(SeekFrom::Start(position))?;
        }
        self.file = file;
        self.deferred = false;
        Ok(event)
    }
}

impl Read for OverlayFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.mode.is_readable() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file not opened for reading",
            ));
        }
        self.file.read(buf)
    }
}

impl Write for OverlayFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.mutate(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.deferred {
            return Ok(());
        }
        self.file.flush()
    }
}

impl Seek for OverlayFile<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl std::fmt::Debug for OverlayFile<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayFile")
            .field("path", &self.logical)
            .field("mode", &self.mode)
            .field("deferred", &self.deferred)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        assert_eq!("r".parse::<OpenMode>().unwrap(), OpenMode::Read);
        assert_eq!("rb".parse::<OpenMode>().unwrap(), OpenMode::Read);
        assert_eq!("r+".parse::<OpenMode>().unwrap(), OpenMode::ReadWrite);
        assert_eq!("wb+".parse::<OpenMode>().unwrap(), OpenMode::WriteRead);
        assert_eq!("a".parse::<OpenMode>().unwrap(), OpenMode::Append);
        assert_eq!("a+".parse::<OpenMode>().unwrap(), OpenMode::AppendRead);
        assert!("x".parse::<OpenMode>().is_err());
    }

    #[test]
    fn test_mode_flags() {
        assert!(OpenMode::Read.is_readable());
        assert!(!OpenMode::Read.is_writable());

        assert!(!OpenMode::Write.is_readable());
        assert!(OpenMode::Write.truncates());
        assert!(OpenMode::Write.creates());

        assert!(OpenMode::ReadWrite.is_writable());
        assert!(!OpenMode::ReadWrite.creates());
        assert!(!OpenMode::ReadWrite.truncates());

        assert!(OpenMode::Append.is_append());
        assert!(!OpenMode::Append.is_readable());
        assert!(OpenMode::AppendRead.is_readable());
    }
}
