//! Commands and responses for the database actor.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::oneshot;

use taskdb::{TaskKeyParts, TaskRecord, TaskStatus};

/// Errors from database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Storage(String),

    #[error("Channel error")]
    ChannelError,
}

/// Response from database operations.
pub type DbResponse<T> = Result<T, DbError>;

/// Commands sent to the database actor.
#[derive(Debug)]
pub enum DbCommand {
    Insert {
        record: TaskRecord,
        reply: oneshot::Sender<DbResponse<()>>,
    },
    Get {
        uuid: String,
        reply: oneshot::Sender<DbResponse<Option<TaskRecord>>>,
    },
    Update {
        record: TaskRecord,
        reply: oneshot::Sender<DbResponse<()>>,
    },
    SetStatus {
        uuid: String,
        status: TaskStatus,
        reply: oneshot::Sender<DbResponse<()>>,
    },
    SetError {
        uuid: String,
        message: String,
        reply: oneshot::Sender<DbResponse<()>>,
    },
    AddStats {
        uuid: String,
        llm_calls: i64,
        tool_calls: i64,
        tokens: i64,
        compressions: i64,
        reply: oneshot::Sender<DbResponse<()>>,
    },
    FindCompletedByKey {
        parts: TaskKeyParts,
        since: Option<DateTime<Utc>>,
        reply: oneshot::Sender<DbResponse<Vec<TaskRecord>>>,
    },
    LatestByKey {
        parts: TaskKeyParts,
        reply: oneshot::Sender<DbResponse<Option<TaskRecord>>>,
    },
    ListByStatus {
        status: TaskStatus,
        reply: oneshot::Sender<DbResponse<Vec<TaskRecord>>>,
    },
    MarkOrphanedRunningFailed {
        live_uuids: Vec<String>,
        reply: oneshot::Sender<DbResponse<usize>>,
    },
    Shutdown,
}
