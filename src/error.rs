//! Error types for fs-walker
//!
//! This module defines the error hierarchy for:
//! - Fatal walk errors (a path failed and recovery was disabled)
//! - Configuration and argument errors, rejected before traversal starts
//! - Async dispatcher worker errors
//!
//! Per-file errors that the walk recovers from never become a
//! [`WalkerError`]. They are attached to the visit handed to the callback
//! as a raw errno, and [`ErrorClass`] classifies them.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for fs-walker
#[derive(Error, Debug)]
pub enum WalkerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Async dispatcher errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// I/O errors not tied to a walked path
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A path-level error that aborted the walk
    #[error("Failed to walk '{}': {source}", path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Interrupted by signal
    #[error("Operation interrupted by signal")]
    Interrupted,
}

impl WalkerError {
    /// Build a path error from a raw errno
    pub fn path(path: impl Into<PathBuf>, errno: i32) -> Self {
        WalkerError::Path {
            path: path.into(),
            source: io::Error::from_raw_os_error(errno),
        }
    }

    /// The raw errno behind this error, if there is one
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            WalkerError::Path { source, .. } | WalkerError::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Configuration and argument errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Descriptor budget below the minimum the engine can work with
    #[error("Invalid descriptor budget {budget}: must be at least {min}")]
    BudgetTooSmall { budget: usize, min: usize },

    /// Invalid thread count
    #[error("Invalid thread count {count}: must be at most {max}")]
    InvalidThreadCount { count: usize, max: usize },

    /// Unknown search strategy name
    #[error("Unsupported strategy '{name}': expected one of bfs, dfs, ids, eds")]
    UnsupportedStrategy { name: String },

    /// No root paths to walk
    #[error("At least one root path is required")]
    NoRoots,

    /// Depth window is empty
    #[error("Invalid depth range: min depth {min} exceeds max depth {max}")]
    InvalidDepthRange { min: usize, max: usize },

    /// Invalid exclude pattern
    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidExcludePattern { pattern: String, reason: String },
}

/// Async dispatcher worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker panicked
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },

    /// Worker initialization failed
    #[error("Failed to initialize worker {id}: {reason}")]
    InitFailed { id: usize, reason: String },

    /// Request submitted while every slot was in flight
    #[error("Failed to submit request: dispatcher queue is full")]
    QueueFull,

    /// All workers went away while requests were outstanding
    #[error("All workers have terminated unexpectedly")]
    Disconnected,
}

/// Broad classification of a per-file errno
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A directory cycle (`ELOOP`)
    Loop,
    /// The path vanished or a component is not a directory
    NotFound,
    /// Access was denied
    PermissionDenied,
    /// Descriptor exhaustion (`EMFILE`/`ENFILE`)
    TooManyFiles,
    /// Anything else
    Other,
}

impl ErrorClass {
    /// Classify a raw errno
    pub fn of(errno: i32) -> Self {
        match errno {
            libc::ELOOP => ErrorClass::Loop,
            libc::ENOENT | libc::ENOTDIR => ErrorClass::NotFound,
            libc::EACCES | libc::EPERM => ErrorClass::PermissionDenied,
            libc::EMFILE | libc::ENFILE => ErrorClass::TooManyFiles,
            _ => ErrorClass::Other,
        }
    }

    /// Check if the walk can carry on past this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrorClass::TooManyFiles)
    }
}

/// Check whether an errno means "this path does not exist"
pub fn is_nonexistence(errno: i32) -> bool {
    ErrorClass::of(errno) == ErrorClass::NotFound
}

/// Result type alias for WalkerError
pub type Result<T> = std::result::Result<T, WalkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class() {
        assert_eq!(ErrorClass::of(libc::ELOOP), ErrorClass::Loop);
        assert_eq!(ErrorClass::of(libc::ENOTDIR), ErrorClass::NotFound);
        assert_eq!(ErrorClass::of(libc::EACCES), ErrorClass::PermissionDenied);
        assert!(ErrorClass::of(libc::EACCES).is_recoverable());
        assert!(!ErrorClass::of(libc::EMFILE).is_recoverable());
        assert!(is_nonexistence(libc::ENOENT));
        assert!(!is_nonexistence(libc::EIO));
    }

    #[test]
    fn test_error_conversion() {
        let config_err = ConfigError::BudgetTooSmall { budget: 1, min: 2 };
        let walker_err: WalkerError = config_err.into();
        assert!(matches!(walker_err, WalkerError::Config(_)));
    }

    #[test]
    fn test_path_error_keeps_errno() {
        let err = WalkerError::path("/data/missing", libc::ENOENT);
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        assert!(err.to_string().contains("/data/missing"));
    }
}
