use thiserror::Error;

/// Errors returned by a [`RemoteClient`](crate::RemoteClient).
///
/// Only `NotFound` and `Conflict` carry meaning for the sync protocol; everything
/// else aborts the affected record.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Row {0} not found on the remote")]
    NotFound(String),

    #[error("Row {0} already exists on the remote")]
    Conflict(String),

    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Remote responded with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Failed to decode remote payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid remote configuration: {0}")]
    InvalidConfig(String),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Conflict(_))
    }
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Local store error: {0}")]
    Store(#[from] sea_orm::DbErr),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Failed to encode or decode task data: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Invalid timestamp in local store: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("Task {0} has been deleted")]
    Deleted(String),

    #[error("Invalid task patch: {0}")]
    InvalidPatch(String),
}
