//! Core error types for promptwave-core.
//!
//! This module defines the error hierarchy using thiserror. Scheduling
//! errors are recoverable by design: the engine logs them and continues
//! with the remaining triggers rather than failing a whole event.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for promptwave-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Store-related errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduling-related errors
    #[error("Scheduling error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{0}")]
    Custom(String),
}

/// Persistence-specific errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open the store
    #[error("Failed to open store at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Migration failed
    #[error("Store migration failed: {0}")]
    MigrationFailed(String),

    /// Store is locked
    #[error("Store is locked")]
    Locked,
}

/// Scheduling-specific errors.
///
/// All of these are recovered at the engine boundary: a malformed bucket
/// skips that bucket, a missing configuration skips that trigger, a denied
/// exact alarm degrades to an inexact one.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// Time-bucket string does not match `HH:MM-HH:MM`
    #[error("Malformed time bucket '{spec}': {message}")]
    MalformedBucket { spec: String, message: String },

    /// Day planner cannot place a notification without violating the
    /// minimum distance or the bucket bounds
    #[error("Unsatisfiable constraint for bucket '{bucket}': {message}")]
    UnsatisfiableConstraint { bucket: String, message: String },

    /// The OS refuses exact alarms
    #[error("Exact alarm scheduling denied for '{identifier}'")]
    SchedulingDenied { identifier: String },

    /// A trigger references an unknown id or carries an unusable value
    #[error("Missing or unusable configuration: {0}")]
    MissingConfiguration(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(err, _msg) => {
                if err.code == rusqlite::ErrorCode::DatabaseLocked {
                    StoreError::Locked
                } else {
                    StoreError::QueryFailed(err.to_string())
                }
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
