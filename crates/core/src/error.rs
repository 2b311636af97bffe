use crate::domain::{AssetId, GroupId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("catalog schema version {db} is newer than supported version {code}")]
    SchemaTooNew { db: u32, code: u32 },

    #[error("asset not found: {0}")]
    AssetNotFound(AssetId),

    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("feature extraction failed for {id}: {message}")]
    ExtractionFailed { id: AssetId, message: String },

    #[error("asset source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("background task failed: {0}")]
    Task(String),

    #[error("analysis worker has stopped")]
    WorkerStopped,

    #[error("cursor belongs to an outdated feed generation")]
    StaleCursor,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// A blocking or spawned task that panicked or was cancelled.
    pub(crate) fn task(context: &str, e: tokio::task::JoinError) -> Self {
        Error::Task(format!("{context}: {e}"))
    }
}
