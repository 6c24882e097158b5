//! Error types for the upload queue.
//!
//! Each concern gets its own enum so callers can tell a fatal staging failure
//! apart from a per-session failure that the next drain will retry.

use crate::model::UploadState;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while copying captures into the staging area.
///
/// Staging failures abort enqueueing and are never retried automatically.
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("Failed to stage {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Session {0} has no strips to stage")]
    Empty(String),

    #[error("Invalid {field} {value:?}: must be a single non-empty path segment")]
    InvalidId { field: &'static str, value: String },

    #[error("Session {session_id} has more than one strip with index {strip_index}")]
    DuplicateStrip { session_id: String, strip_index: u32 },
}

/// Errors returned by the remote presign/upload/complete endpoints.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Remote returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid upload target: {0}")]
    InvalidTarget(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            RemoteError::Decode(e.to_string())
        } else {
            RemoteError::Transport(e.to_string())
        }
    }
}

/// Errors from the persistent session store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to (de)serialize session record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session {0} is already stored")]
    Duplicate(String),
}

/// Errors reported by the queue engine.
///
/// Apart from `Staging` and `AlreadyQueued` (returned from enqueue), these are
/// delivered through the drain's error callback and leave the session resumable.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Session {0} is already queued")]
    AlreadyQueued(String),

    #[error("No upload target returned for {path}")]
    MissingTarget { path: String },

    #[error("Presign request failed: {0}")]
    Presign(#[source] RemoteError),

    #[error("Upload of {path} failed: {source}")]
    Transfer {
        path: String,
        #[source]
        source: RemoteError,
    },

    #[error("Failed to read staged file {path}: {source}")]
    LocalRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build manifest: {0}")]
    Manifest(String),

    #[error("Finalize call failed: {0}")]
    Finalize(#[source] RemoteError),

    #[error("Failed to clean up staged files: {0}")]
    Cleanup(#[source] StagingError),

    #[error("Invalid state transition {from:?} -> {to:?}")]
    InvalidTransition { from: UploadState, to: UploadState },
}

/// Result alias used across the queue engine
pub type QueueResult<T> = Result<T, QueueError>;
