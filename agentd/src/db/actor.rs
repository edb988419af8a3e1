//! Database actor and its handle.

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use taskdb::{TaskDb, TaskKeyParts, TaskRecord, TaskStatus};

use super::messages::{DbCommand, DbError, DbResponse};

/// Cloneable handle to the database actor.
#[derive(Clone)]
pub struct DbHandle {
    tx: mpsc::Sender<DbCommand>,
}

impl DbHandle {
    /// Open the database and spawn its actor on a blocking thread.
    pub fn spawn(db_path: impl AsRef<Path>) -> eyre::Result<Self> {
        debug!(db_path = %db_path.as_ref().display(), "spawn: called");
        let db = TaskDb::open(db_path.as_ref())?;
        Ok(Self::spawn_with(db))
    }

    /// Spawn over an in-memory database; used by tests.
    pub fn spawn_in_memory() -> eyre::Result<Self> {
        Ok(Self::spawn_with(TaskDb::open_in_memory()?))
    }

    fn spawn_with(db: TaskDb) -> Self {
        let (tx, rx) = mpsc::channel(256);
        // rusqlite is synchronous; the actor runs on its own thread so the
        // runtime never blocks on disk.
        std::thread::spawn(move || actor_loop(db, rx));
        info!("DbHandle spawned");
        Self { tx }
    }

    pub async fn insert(&self, record: TaskRecord) -> DbResponse<()> {
        self.request(|reply| DbCommand::Insert { record, reply }).await
    }

    pub async fn get(&self, uuid: &str) -> DbResponse<Option<TaskRecord>> {
        let uuid = uuid.to_string();
        self.request(|reply| DbCommand::Get { uuid, reply }).await
    }

    /// Get a record, erroring if absent.
    pub async fn get_required(&self, uuid: &str) -> DbResponse<TaskRecord> {
        self.get(uuid).await?.ok_or_else(|| DbError::NotFound(uuid.to_string()))
    }

    pub async fn update(&self, record: TaskRecord) -> DbResponse<()> {
        self.request(|reply| DbCommand::Update { record, reply }).await
    }

    pub async fn set_status(&self, uuid: &str, status: TaskStatus) -> DbResponse<()> {
        let uuid = uuid.to_string();
        self.request(|reply| DbCommand::SetStatus { uuid, status, reply }).await
    }

    pub async fn set_error(&self, uuid: &str, message: &str) -> DbResponse<()> {
        let uuid = uuid.to_string();
        let message = message.to_string();
        self.request(|reply| DbCommand::SetError { uuid, message, reply }).await
    }

    pub async fn add_stats(&self, uuid: &str, llm_calls: i64, tool_calls: i64, tokens: i64, compressions: i64) -> DbResponse<()> {
        let uuid = uuid.to_string();
        self.request(|reply| DbCommand::AddStats {
            uuid,
            llm_calls,
            tool_calls,
            tokens,
            compressions,
            reply,
        })
        .await
    }

    pub async fn find_completed_by_key(
        &self,
        parts: TaskKeyParts,
        since: Option<DateTime<Utc>>,
    ) -> DbResponse<Vec<TaskRecord>> {
        self.request(|reply| DbCommand::FindCompletedByKey { parts, since, reply }).await
    }

    pub async fn latest_by_key(&self, parts: TaskKeyParts) -> DbResponse<Option<TaskRecord>> {
        self.request(|reply| DbCommand::LatestByKey { parts, reply }).await
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> DbResponse<Vec<TaskRecord>> {
        self.request(|reply| DbCommand::ListByStatus { status, reply }).await
    }

    pub async fn mark_orphaned_running_failed(&self, live_uuids: Vec<String>) -> DbResponse<usize> {
        self.request(|reply| DbCommand::MarkOrphanedRunningFailed { live_uuids, reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(DbCommand::Shutdown).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<DbResponse<T>>) -> DbCommand) -> DbResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).await.map_err(|_| DbError::ChannelError)?;
        reply_rx.await.map_err(|_| DbError::ChannelError)?
    }
}

fn storage_err(e: eyre::Report) -> DbError {
    DbError::Storage(e.to_string())
}

fn actor_loop(db: TaskDb, mut rx: mpsc::Receiver<DbCommand>) {
    while let Some(command) = rx.blocking_recv() {
        match command {
            DbCommand::Insert { record, reply } => {
                let _ = reply.send(db.insert(&record).map_err(storage_err));
            }
            DbCommand::Get { uuid, reply } => {
                let _ = reply.send(db.get(&uuid).map_err(storage_err));
            }
            DbCommand::Update { record, reply } => {
                let _ = reply.send(db.update(&record).map_err(storage_err));
            }
            DbCommand::SetStatus { uuid, status, reply } => {
                let _ = reply.send(db.set_status(&uuid, status).map_err(storage_err));
            }
            DbCommand::SetError { uuid, message, reply } => {
                let _ = reply.send(db.set_error(&uuid, &message).map_err(storage_err));
            }
            DbCommand::AddStats {
                uuid,
                llm_calls,
                tool_calls,
                tokens,
                compressions,
                reply,
            } => {
                let _ = reply.send(
                    db.add_stats(&uuid, llm_calls, tool_calls, tokens, compressions)
                        .map_err(storage_err),
                );
            }
            DbCommand::FindCompletedByKey { parts, since, reply } => {
                let _ = reply.send(db.find_completed_by_key(&parts, since).map_err(storage_err));
            }
            DbCommand::LatestByKey { parts, reply } => {
                let _ = reply.send(db.latest_by_key(&parts).map_err(storage_err));
            }
            DbCommand::ListByStatus { status, reply } => {
                let _ = reply.send(db.list_by_status(status).map_err(storage_err));
            }
            DbCommand::MarkOrphanedRunningFailed { live_uuids, reply } => {
                let _ = reply.send(db.mark_orphaned_running_failed(&live_uuids).map_err(storage_err));
            }
            DbCommand::Shutdown => {
                debug!("actor_loop: shutdown");
                break;
            }
        }
    }
    debug!("actor_loop: exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts() -> TaskKeyParts {
        TaskKeyParts {
            task_source: "github".to_string(),
            task_type: "issue".to_string(),
            owner: Some("acme".to_string()),
            repo: Some("svc".to_string()),
            project_id: None,
            number: 42,
        }
    }

    #[tokio::test]
    async fn test_insert_get_through_actor() {
        let handle = DbHandle::spawn_in_memory().unwrap();
        handle.insert(TaskRecord::new_pending("u-1", &parts(), None)).await.unwrap();

        let record = handle.get_required("u-1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Pending);

        assert!(matches!(handle.get_required("ghost").await, Err(DbError::NotFound(_))));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_status_and_stats_through_actor() {
        let handle = DbHandle::spawn_in_memory().unwrap();
        handle.insert(TaskRecord::new_pending("u-2", &parts(), None)).await.unwrap();

        handle.set_status("u-2", TaskStatus::Running).await.unwrap();
        handle.add_stats("u-2", 1, 2, 100, 0).await.unwrap();

        let record = handle.get_required("u-2").await.unwrap();
        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.tool_call_count, 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_inheritance_query_through_actor() {
        let handle = DbHandle::spawn_in_memory().unwrap();
        handle.insert(TaskRecord::new_pending("u-3", &parts(), None)).await.unwrap();
        handle.set_status("u-3", TaskStatus::Completed).await.unwrap();

        let found = handle.find_completed_by_key(parts(), None).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uuid, "u-3");
        handle.shutdown().await;
    }
}
