//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::Path;
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(stowage::cache::io),
        help("Check file permissions and available disk space under the cache root")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "rename", "write", "create")
        operation: String,
    },

    /// Configuration or validation error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(stowage::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// An operation was attempted before `startup()` completed
    #[error("Cache has not been started")]
    #[diagnostic(
        code(stowage::cache::not_started),
        help("Call `FileCache::startup` (or build the cache with `open`) before using it")
    )]
    NotStarted,

    /// `startup()` was called on a cache that is already running
    #[error("Cache has already been started")]
    #[diagnostic(
        code(stowage::cache::already_started),
        help("Construct a fresh cache instance to rescan the cache directory")
    )]
    AlreadyStarted,

    /// The string form of a key cannot be persisted
    #[error("Invalid cache key {key:?}: {reason}")]
    #[diagnostic(
        code(stowage::cache::invalid_key),
        help("Key string representations must be non-empty and must not contain commas")
    )]
    InvalidKey {
        /// String form of the rejected key
        key: String,
        /// Why the key was rejected
        reason: String,
    },

    /// The digest calculator produced a value that cannot name a file
    #[error("Digest {digest:?} cannot be used as a file name")]
    #[diagnostic(code(stowage::cache::invalid_digest))]
    InvalidDigest {
        /// The rejected digest
        digest: String,
    },

    /// A property file could not be parsed
    #[error("Corrupt property file {}: {message}", path.display())]
    #[diagnostic(code(stowage::cache::corrupt_properties))]
    CorruptProperties {
        /// Path of the property file
        path: Box<Path>,
        /// What was wrong with it
        message: String,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create an I/O error without path context
    #[must_use]
    pub fn io_no_path(source: std::io::Error, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: None,
            operation: operation.into(),
        }
    }

    /// Create an invalid key error
    #[must_use]
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a corrupt property file error
    #[must_use]
    pub fn corrupt_properties(path: impl AsRef<Path>, msg: impl Into<String>) -> Self {
        Self::CorruptProperties {
            path: path.as_ref().into(),
            message: msg.into(),
        }
    }

    /// Whether this is an I/O error whose underlying kind is `NotFound`
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;
