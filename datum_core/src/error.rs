//! Error types for datum_core.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using datum_core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during file operations.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A source path is missing or cannot be read.
    #[error("Cannot read {path}: {source}")]
    UnreadableInput {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Object not found in the cache or remote.
    #[error("Object not found: {hash}")]
    ObjectNotFound { hash: String },

    /// Stored content does not match its fingerprint.
    #[error("Integrity error for {hash}: {reason}")]
    Integrity { hash: String, reason: String },

    /// Pointer manifest could not be parsed.
    #[error("Malformed manifest: {reason}")]
    MalformedManifest { reason: String },

    /// A single object failed to transfer.
    #[error("Transfer of {hash} failed: {reason}")]
    Transfer { hash: String, reason: String },

    /// Invalid hash format or encoding.
    #[error("Invalid hash: {reason}")]
    InvalidHash { reason: String },

    /// Store is invalid or not initialized.
    #[error("Invalid store at {path}: {reason}")]
    InvalidStore { path: PathBuf, reason: String },

    /// Invalid tree entry.
    #[error("Invalid entry: {reason}")]
    InvalidEntry { reason: String },

    /// Unsupported algorithm.
    #[error("Unsupported algorithm: {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },

    /// Invalid configuration file.
    #[error("Invalid config: {reason}")]
    InvalidConfig { reason: String },

    /// Unknown or misconfigured remote.
    #[error("Invalid remote: {reason}")]
    InvalidRemote { reason: String },

    /// Checkout would discard workspace content that is not in the cache.
    #[error("Uncommitted changes would be lost: {}", display_paths(.paths))]
    UncommittedChanges { paths: Vec<PathBuf> },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Compression or decompression failed.
    #[error("Compression error: {reason}")]
    Compression { reason: String },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create an UnreadableInput error.
    pub fn unreadable_input(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::UnreadableInput {
            path: path.into(),
            source,
        }
    }

    /// Create an ObjectNotFound error.
    pub fn object_not_found(hash: impl Into<String>) -> Self {
        Error::ObjectNotFound { hash: hash.into() }
    }

    /// Create an Integrity error.
    pub fn integrity(hash: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Integrity {
            hash: hash.into(),
            reason: reason.into(),
        }
    }

    /// Create a MalformedManifest error.
    pub fn malformed_manifest(reason: impl Into<String>) -> Self {
        Error::MalformedManifest {
            reason: reason.into(),
        }
    }

    /// Create a Transfer error.
    pub fn transfer(hash: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Transfer {
            hash: hash.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidHash error.
    pub fn invalid_hash(reason: impl Into<String>) -> Self {
        Error::InvalidHash {
            reason: reason.into(),
        }
    }

    /// Create an InvalidStore error.
    pub fn invalid_store(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidStore {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an InvalidEntry error.
    pub fn invalid_entry(reason: impl Into<String>) -> Self {
        Error::InvalidEntry {
            reason: reason.into(),
        }
    }

    /// Create an UnsupportedAlgorithm error.
    pub fn unsupported_algorithm(algorithm: impl Into<String>) -> Self {
        Error::UnsupportedAlgorithm {
            algorithm: algorithm.into(),
        }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an InvalidRemote error.
    pub fn invalid_remote(reason: impl Into<String>) -> Self {
        Error::InvalidRemote {
            reason: reason.into(),
        }
    }

    /// Create a Compression error.
    pub fn compression_error(reason: impl Into<String>) -> Self {
        Error::Compression {
            reason: reason.into(),
        }
    }

    /// Whether the error is isolated to one object and worth retrying
    /// (after a pull, or against the same remote).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::ObjectNotFound { .. } | Error::Transfer { .. })
    }
}

// Additional From implementations for external error types

impl From<tempfile::PersistError> for Error {
    fn from(err: tempfile::PersistError) -> Self {
        Error::Io { source: err.error }
    }
}

impl From<ignore::Error> for Error {
    fn from(err: ignore::Error) -> Self {
        // ignore::Error can wrap an io::Error or be a path error
        match err.io_error() {
            Some(io_err) => Error::Io {
                source: std::io::Error::new(io_err.kind(), io_err.to_string()),
            },
            None => Error::Io {
                source: std::io::Error::other(err.to_string()),
            },
        }
    }
}
