//! SQLite-backed task index.
//!
//! One connection, owned by the caller; the daemon wraps it in an actor so
//! all access is serialized. Timestamps are stored as RFC 3339 text.

use std::path::Path;

use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use rusqlite::{Connection, Row, params};
use tracing::{debug, info, warn};

use crate::record::{TaskKeyParts, TaskRecord, TaskStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    uuid              TEXT PRIMARY KEY,
    task_source       TEXT NOT NULL,
    task_type         TEXT NOT NULL,
    owner             TEXT,
    repo              TEXT,
    project_id        INTEGER,
    number            INTEGER NOT NULL,
    status            TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    started_at        TEXT,
    completed_at      TEXT,
    process_id        INTEGER,
    hostname          TEXT,
    llm_provider      TEXT,
    model             TEXT,
    context_length    INTEGER,
    llm_call_count    INTEGER NOT NULL DEFAULT 0,
    tool_call_count   INTEGER NOT NULL DEFAULT 0,
    total_tokens      INTEGER NOT NULL DEFAULT 0,
    compression_count INTEGER NOT NULL DEFAULT 0,
    error_message     TEXT,
    user              TEXT
);
CREATE INDEX IF NOT EXISTS ix_tasks_status ON tasks (status);
CREATE INDEX IF NOT EXISTS ix_tasks_created_at ON tasks (created_at);
CREATE INDEX IF NOT EXISTS ix_tasks_user ON tasks (user);
CREATE INDEX IF NOT EXISTS ix_tasks_task_key
    ON tasks (task_source, task_type, owner, repo, project_id, number);
";

/// Task database over a single rusqlite connection.
pub struct TaskDb {
    conn: Connection,
}

impl TaskDb {
    /// Open (creating schema and indexes if needed) at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path.as_ref()).context("Failed to open task database")?;
        conn.execute_batch(SCHEMA).context("Failed to create schema")?;
        info!(path = %path.as_ref().display(), "TaskDb opened");
        Ok(Self { conn })
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn insert(&self, record: &TaskRecord) -> Result<()> {
        debug!(uuid = %record.uuid, status = %record.status, "insert: called");
        self.conn
            .execute(
                "INSERT INTO tasks (uuid, task_source, task_type, owner, repo, project_id, number,
                                    status, created_at, started_at, completed_at, process_id, hostname,
                                    llm_provider, model, context_length, llm_call_count, tool_call_count,
                                    total_tokens, compression_count, error_message, user)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
                params![
                    record.uuid,
                    record.task_source,
                    record.task_type,
                    record.owner,
                    record.repo,
                    record.project_id,
                    record.number,
                    record.status.as_str(),
                    record.created_at.to_rfc3339(),
                    record.started_at.map(|t| t.to_rfc3339()),
                    record.completed_at.map(|t| t.to_rfc3339()),
                    record.process_id,
                    record.hostname,
                    record.llm_provider,
                    record.model,
                    record.context_length,
                    record.llm_call_count,
                    record.tool_call_count,
                    record.total_tokens,
                    record.compression_count,
                    record.error_message,
                    record.user,
                ],
            )
            .context("Failed to insert task")?;
        Ok(())
    }

    pub fn get(&self, uuid: &str) -> Result<Option<TaskRecord>> {
        let mut stmt = self.conn.prepare("SELECT * FROM tasks WHERE uuid = ?1")?;
        let mut rows = stmt.query(params![uuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    /// Full-row update keyed by uuid.
    pub fn update(&self, record: &TaskRecord) -> Result<()> {
        debug!(uuid = %record.uuid, status = %record.status, "update: called");
        let changed = self.conn.execute(
            "UPDATE tasks SET status = ?2, started_at = ?3, completed_at = ?4, process_id = ?5,
                              hostname = ?6, llm_provider = ?7, model = ?8, context_length = ?9,
                              llm_call_count = ?10, tool_call_count = ?11, total_tokens = ?12,
                              compression_count = ?13, error_message = ?14, user = ?15
             WHERE uuid = ?1",
            params![
                record.uuid,
                record.status.as_str(),
                record.started_at.map(|t| t.to_rfc3339()),
                record.completed_at.map(|t| t.to_rfc3339()),
                record.process_id,
                record.hostname,
                record.llm_provider,
                record.model,
                record.context_length,
                record.llm_call_count,
                record.tool_call_count,
                record.total_tokens,
                record.compression_count,
                record.error_message,
                record.user,
            ],
        )?;
        if changed == 0 {
            return Err(eyre!("no task row for uuid {}", record.uuid));
        }
        Ok(())
    }

    /// Flip the status, stamping `started_at` on Running and `completed_at`
    /// on terminal states.
    pub fn set_status(&self, uuid: &str, status: TaskStatus) -> Result<()> {
        debug!(uuid, %status, "set_status: called");
        let now = Utc::now().to_rfc3339();
        let changed = match status {
            TaskStatus::Running => self.conn.execute(
                "UPDATE tasks SET status = ?2, started_at = COALESCE(started_at, ?3) WHERE uuid = ?1",
                params![uuid, status.as_str(), now],
            )?,
            s if s.is_terminal() => self.conn.execute(
                "UPDATE tasks SET status = ?2, completed_at = ?3 WHERE uuid = ?1",
                params![uuid, status.as_str(), now],
            )?,
            _ => self
                .conn
                .execute("UPDATE tasks SET status = ?2 WHERE uuid = ?1", params![uuid, status.as_str()])?,
        };
        if changed == 0 {
            return Err(eyre!("no task row for uuid {uuid}"));
        }
        Ok(())
    }

    pub fn set_error(&self, uuid: &str, message: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET error_message = ?2 WHERE uuid = ?1",
            params![uuid, message],
        )?;
        Ok(())
    }

    /// Monotonic counter increments in one statement.
    pub fn add_stats(&self, uuid: &str, llm_calls: i64, tool_calls: i64, tokens: i64, compressions: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE tasks SET llm_call_count = llm_call_count + ?2,
                              tool_call_count = tool_call_count + ?3,
                              total_tokens = total_tokens + ?4,
                              compression_count = compression_count + ?5
             WHERE uuid = ?1",
            params![uuid, llm_calls, tool_calls, tokens, compressions],
        )?;
        Ok(())
    }

    /// Completed or stopped runs of the same key, newest completion first.
    ///
    /// This is the inheritance query; `since` bounds how far back a summary
    /// may be adopted.
    pub fn find_completed_by_key(&self, parts: &TaskKeyParts, since: Option<DateTime<Utc>>) -> Result<Vec<TaskRecord>> {
        let since_text = since.map(|t| t.to_rfc3339()).unwrap_or_default();
        let mut stmt = self.conn.prepare(
            "SELECT * FROM tasks
             WHERE task_source = ?1 AND task_type = ?2
               AND (owner IS ?3) AND (repo IS ?4) AND (project_id IS ?5) AND number = ?6
               AND status IN ('completed', 'stopped')
               AND (?7 = '' OR completed_at >= ?7)
             ORDER BY completed_at DESC",
        )?;
        let rows = stmt.query_map(
            params![
                parts.task_source,
                parts.task_type,
                parts.owner,
                parts.repo,
                parts.project_id,
                parts.number,
                since_text,
            ],
            |row| row_to_record_sql(row),
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        debug!(count = records.len(), "find_completed_by_key: done");
        Ok(records)
    }

    /// The most recently created run on a key, any status.
    pub fn latest_by_key(&self, parts: &TaskKeyParts) -> Result<Option<TaskRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM tasks
             WHERE task_source = ?1 AND task_type = ?2
               AND (owner IS ?3) AND (repo IS ?4) AND (project_id IS ?5) AND number = ?6
             ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![
            parts.task_source,
            parts.task_type,
            parts.owner,
            parts.repo,
            parts.project_id,
            parts.number,
        ])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let mut stmt = self.conn.prepare("SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at")?;
        let rows = stmt.query_map(params![status.as_str()], |row| row_to_record_sql(row))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Crash reconciliation: flip `running` rows whose uuid is not among the
    /// live run directories to `failed`. The filesystem wins. Returns the
    /// number of rows reconciled.
    pub fn mark_orphaned_running_failed(&self, live_uuids: &[String]) -> Result<usize> {
        let running = self.list_by_status(TaskStatus::Running)?;
        let mut reconciled = 0;
        for record in running {
            if !live_uuids.contains(&record.uuid) {
                warn!(uuid = %record.uuid, "mark_orphaned_running_failed: no live directory, marking failed");
                self.set_status(&record.uuid, TaskStatus::Failed)?;
                self.set_error(&record.uuid, "orphaned by consumer crash")?;
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }
}

fn row_to_record(row: &Row<'_>) -> Result<TaskRecord> {
    row_to_record_sql(row).context("Failed to decode task row")
}

fn row_to_record_sql(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status_text: String = row.get("status")?;
    let status = TaskStatus::parse(&status_text).unwrap_or(TaskStatus::Failed);

    Ok(TaskRecord {
        uuid: row.get("uuid")?,
        task_source: row.get("task_source")?,
        task_type: row.get("task_type")?,
        owner: row.get("owner")?,
        repo: row.get("repo")?,
        project_id: row.get("project_id")?,
        number: row.get("number")?,
        status,
        created_at: parse_timestamp(row.get::<_, String>("created_at")?),
        started_at: row.get::<_, Option<String>>("started_at")?.map(parse_timestamp),
        completed_at: row.get::<_, Option<String>>("completed_at")?.map(parse_timestamp),
        process_id: row.get("process_id")?,
        hostname: row.get("hostname")?,
        llm_provider: row.get("llm_provider")?,
        model: row.get("model")?,
        context_length: row.get("context_length")?,
        llm_call_count: row.get("llm_call_count")?,
        tool_call_count: row.get("tool_call_count")?,
        total_tokens: row.get("total_tokens")?,
        compression_count: row.get("compression_count")?,
        error_message: row.get("error_message")?,
        user: row.get("user")?,
    })
}

fn parse_timestamp(text: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn github_parts(number: i64) -> TaskKeyParts {
        TaskKeyParts {
            task_source: "github".to_string(),
            task_type: "issue".to_string(),
            owner: Some("acme".to_string()),
            repo: Some("svc".to_string()),
            project_id: None,
            number,
        }
    }

    fn gitlab_parts(iid: i64) -> TaskKeyParts {
        TaskKeyParts {
            task_source: "gitlab".to_string(),
            task_type: "issue".to_string(),
            owner: None,
            repo: None,
            project_id: Some(7),
            number: iid,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let db = TaskDb::open_in_memory().unwrap();
        let record = TaskRecord::new_pending("u-1", &github_parts(42), Some("alice"));
        db.insert(&record).unwrap();

        let loaded = db.get("u-1").unwrap().unwrap();
        assert_eq!(loaded.owner.as_deref(), Some("acme"));
        assert_eq!(loaded.number, 42);
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert!(db.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_set_status_stamps_timestamps() {
        let db = TaskDb::open_in_memory().unwrap();
        db.insert(&TaskRecord::new_pending("u-2", &github_parts(1), None)).unwrap();

        db.set_status("u-2", TaskStatus::Running).unwrap();
        let running = db.get("u-2").unwrap().unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        db.set_status("u-2", TaskStatus::Completed).unwrap();
        let completed = db.get("u-2").unwrap().unwrap();
        assert!(completed.completed_at.is_some());
    }

    #[test]
    fn test_set_status_unknown_uuid_fails() {
        let db = TaskDb::open_in_memory().unwrap();
        assert!(db.set_status("ghost", TaskStatus::Running).is_err());
    }

    #[test]
    fn test_add_stats_increments() {
        let db = TaskDb::open_in_memory().unwrap();
        db.insert(&TaskRecord::new_pending("u-3", &github_parts(1), None)).unwrap();

        db.add_stats("u-3", 2, 5, 1200, 1).unwrap();
        db.add_stats("u-3", 1, 0, 300, 0).unwrap();

        let record = db.get("u-3").unwrap().unwrap();
        assert_eq!(record.llm_call_count, 3);
        assert_eq!(record.tool_call_count, 5);
        assert_eq!(record.total_tokens, 1500);
        assert_eq!(record.compression_count, 1);
    }

    #[test]
    fn test_find_completed_by_key_orders_desc() {
        let db = TaskDb::open_in_memory().unwrap();
        for (uuid, status) in [("a", TaskStatus::Completed), ("b", TaskStatus::Stopped), ("c", TaskStatus::Failed)] {
            db.insert(&TaskRecord::new_pending(uuid, &github_parts(42), None)).unwrap();
            db.set_status(uuid, TaskStatus::Running).unwrap();
            db.set_status(uuid, status).unwrap();
        }
        // Different key, same repo
        db.insert(&TaskRecord::new_pending("d", &github_parts(43), None)).unwrap();
        db.set_status("d", TaskStatus::Completed).unwrap();

        let found = db.find_completed_by_key(&github_parts(42), None).unwrap();
        // Failed runs are not inheritance candidates
        assert_eq!(found.len(), 2);
        assert!(found.windows(2).all(|w| w[0].completed_at >= w[1].completed_at));
    }

    #[test]
    fn test_find_completed_respects_since() {
        let db = TaskDb::open_in_memory().unwrap();
        db.insert(&TaskRecord::new_pending("old", &gitlab_parts(3), None)).unwrap();
        db.set_status("old", TaskStatus::Completed).unwrap();

        let future = Utc::now() + chrono::Duration::days(1);
        assert!(db.find_completed_by_key(&gitlab_parts(3), Some(future)).unwrap().is_empty());
        assert_eq!(db.find_completed_by_key(&gitlab_parts(3), None).unwrap().len(), 1);
    }

    #[test]
    fn test_gitlab_key_projection_distinct() {
        let db = TaskDb::open_in_memory().unwrap();
        db.insert(&TaskRecord::new_pending("g-1", &gitlab_parts(3), None)).unwrap();
        db.set_status("g-1", TaskStatus::Completed).unwrap();

        // Same iid, different project
        let mut other = gitlab_parts(3);
        other.project_id = Some(8);
        assert!(db.find_completed_by_key(&other, None).unwrap().is_empty());
    }

    #[test]
    fn test_mark_orphaned_running_failed() {
        let db = TaskDb::open_in_memory().unwrap();
        for uuid in ["live", "orphan"] {
            db.insert(&TaskRecord::new_pending(uuid, &github_parts(1), None)).unwrap();
            db.set_status(uuid, TaskStatus::Running).unwrap();
        }

        let reconciled = db.mark_orphaned_running_failed(&["live".to_string()]).unwrap();
        assert_eq!(reconciled, 1);
        assert_eq!(db.get("orphan").unwrap().unwrap().status, TaskStatus::Failed);
        assert_eq!(db.get("live").unwrap().unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn test_reopen_preserves_rows() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("tasks.db");

        {
            let db = TaskDb::open(&path).unwrap();
            db.insert(&TaskRecord::new_pending("persist", &github_parts(7), Some("alice"))).unwrap();
            db.set_status("persist", TaskStatus::Completed).unwrap();
        }

        let db = TaskDb::open(&path).unwrap();
        let record = db.get("persist").unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(record.user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_latest_by_key() {
        let db = TaskDb::open_in_memory().unwrap();
        let mut first = TaskRecord::new_pending("first", &github_parts(9), None);
        first.created_at = Utc::now() - chrono::Duration::hours(1);
        db.insert(&first).unwrap();
        db.insert(&TaskRecord::new_pending("second", &github_parts(9), None)).unwrap();

        let latest = db.latest_by_key(&github_parts(9)).unwrap().unwrap();
        assert_eq!(latest.uuid, "second");
    }
}
