use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Failures surfaced by the pipeline. Row-level and shard-level failures are normally
/// absorbed by their callers; everything that reaches a message handler leaves the
/// message on the queue for redelivery.
#[derive(Debug, Error)]
pub enum Error {
    /// A row, timestamp, or summary line that could not be interpreted.
    #[error("malformed record: {0}")]
    Parse(String),
    /// A required object is absent. Optional state (e.g. no aggregate yet) is never
    /// reported this way.
    #[error("object {bucket}/{key} not found")]
    Missing { bucket: String, key: String },
    /// The blob store or queue backend failed.
    #[error("storage failure: {0}")]
    Storage(#[from] tokio_postgres::Error),
    /// A persisted shard could not be decoded.
    #[error("corrupt aggregate: {0}")]
    Corrupt(String),
    /// Every shard handed to a merge was unreadable.
    #[error("all {0} shards are corrupt")]
    AllShardsCorrupt(usize),
    /// A queue message body that is not a recognizable notification.
    #[error("malformed notification: {0}")]
    Notification(#[from] serde_json::Error),
    /// A blocking task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<bitcode::Error> for Error {
    fn from(err: bitcode::Error) -> Self {
        Self::Corrupt(alloc::format!("{err}"))
    }
}
