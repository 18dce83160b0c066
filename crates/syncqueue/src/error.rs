//! Error types for syncqueue.
//!
//! This module defines all error types used throughout the syncqueue crate.
//! Most of them never reach callers of the queue: persistence and dispatch
//! failures are logged and absorbed by the queue itself. The one error the
//! queue surfaces directly is [`Error::NoConnectivity`].

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for syncqueue operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the local database.
    #[error("failed to open database at {path}: {source}")]
    StorageOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A local storage query failed.
    #[error("storage query failed: {0}")]
    StorageQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("storage migration failed: {message}")]
    StorageMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Queue Errors ===
    /// The device is offline, so a manual sync cannot be attempted.
    #[error("no network connectivity")]
    NoConnectivity,

    /// The remote persistence service rejected or failed a write.
    #[error("dispatch of {operation} for '{entity_id}' failed: {message}")]
    Dispatch {
        /// Kind of operation being dispatched.
        operation: String,
        /// The remote entity the write targeted.
        entity_id: String,
        /// Description of what went wrong.
        message: String,
    },

    /// An entity id is empty or contains characters the remote store refuses.
    #[error("invalid entity id '{0}'")]
    InvalidEntityId(String),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for syncqueue operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new dispatch error.
    #[must_use]
    pub fn dispatch(
        operation: impl Into<String>,
        entity_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Dispatch {
            operation: operation.into(),
            entity_id: entity_id.into(),
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error means the device is offline.
    #[must_use]
    pub fn is_no_connectivity(&self) -> bool {
        matches!(self, Self::NoConnectivity)
    }

    /// Check if retrying the failed operation later could succeed.
    ///
    /// Dispatch and I/O failures are transient; malformed input is not. The
    /// queue drops a write that fails with a non-retryable error right away.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Dispatch { .. }
                | Self::Io(_)
                | Self::DirectoryCreate { .. }
                | Self::NoConnectivity
                | Self::StorageQuery(_)
        )
    }
}
