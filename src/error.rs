//! Error types for layerfs
//!
//! Failures are reported with the same categories the OS uses
//! (not-found, already-exists, not-empty, read-only, invalid input) so
//! callers can treat the merged view like any other filesystem.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for layerfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while operating on a layered filesystem
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("No such file or directory: {}", .0.display())]
    NotFound(PathBuf),

    #[error("File exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Directory not empty: {}", .0.display())]
    NotEmpty(PathBuf),

    #[error("Not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("Is a directory: {}", .0.display())]
    IsADirectory(PathBuf),

    #[error("No writable layer configured")]
    NoWritableLayer,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    #[error("Hook listener for '{event}' failed: {message}")]
    Hook { event: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// The closest `std::io::ErrorKind` for this error
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            Error::Io(e) => e.kind(),
            Error::NotFound(_) | Error::LayerNotFound(_) => io::ErrorKind::NotFound,
            Error::AlreadyExists(_) => io::ErrorKind::AlreadyExists,
            Error::NotEmpty(_) => io::ErrorKind::DirectoryNotEmpty,
            Error::NotADirectory(_) => io::ErrorKind::NotADirectory,
            Error::IsADirectory(_) => io::ErrorKind::IsADirectory,
            Error::NoWritableLayer => io::ErrorKind::ReadOnlyFilesystem,
            Error::InvalidOperation(_)
            | Error::InvalidPath(_)
            | Error::Config(_)
            | Error::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            Error::Hook { .. } => io::ErrorKind::Other,
        }
    }

    /// True if this is a not-found condition, from the engine or the OS
    pub fn is_not_found(&self) -> bool {
        self.kind() == io::ErrorKind::NotFound
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => io::Error::new(other.kind(), other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotFound(PathBuf::from("etc/conf"));
        assert_eq!(err.to_string(), "No such file or directory: etc/conf");

        let err = Error::NoWritableLayer;
        assert_eq!(err.to_string(), "No writable layer configured");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::NotFound(PathBuf::new()).kind(), io::ErrorKind::NotFound);
        assert_eq!(Error::AlreadyExists(PathBuf::new()).kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(Error::NotEmpty(PathBuf::new()).kind(), io::ErrorKind::DirectoryNotEmpty);
        assert_eq!(Error::NoWritableLayer.kind(), io::ErrorKind::ReadOnlyFilesystem);
        assert_eq!(
            Error::InvalidOperation("readlink".into()).kind(),
            io::ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err = Error::from(io_err);
        assert!(err.is_not_found());
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_into_io_error_keeps_kind() {
        let io_err: io::Error = Error::NotEmpty(PathBuf::from("dir")).into();
        assert_eq!(io_err.kind(), io::ErrorKind::DirectoryNotEmpty);
        assert!(io_err.to_string().contains("dir"));
    }
}
