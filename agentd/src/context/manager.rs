//! Task context manager.
//!
//! Owns one run's on-disk directory and mirrors every lifecycle transition
//! into the task database. After any successful transition the directory
//! placement and the database status agree; crash recovery reconciles by
//! trusting the filesystem.

use std::path::PathBuf;

use chrono::Utc;
use eyre::{Context, Result, eyre};
use serde_json::Value;
use tracing::{info, warn};

use ctxstore::{ContextLayout, MessageStore, PlanningHistoryStore, RunMetadata, RunState, SummaryStore, TaskState, ToolStore};
use taskdb::TaskStatus;

use crate::db::DbHandle;
use crate::domain::TaskRun;

/// Exclusive owner of a run's context directory.
pub struct TaskContextManager {
    run: TaskRun,
    layout: ContextLayout,
    dir: PathBuf,
    db: DbHandle,
}

impl TaskContextManager {
    /// Create the directory and database mirror for a fresh attempt.
    ///
    /// The producer may already have inserted a pending row; in that case the
    /// row is flipped to running rather than inserted twice.
    pub async fn create(
        layout: ContextLayout,
        db: DbHandle,
        run: TaskRun,
        provider: &str,
        model: &str,
        context_length: u64,
    ) -> Result<Self> {
        let dir = layout.create_running(&run.uuid)?;

        let mut metadata = run.to_metadata(provider, model, context_length);
        metadata.status = TaskStatus::Running.to_string();
        metadata.save(&dir)?;

        if db.get(&run.uuid).await.map_err(|e| eyre!(e))?.is_none() {
            db.insert(run.to_record()).await.map_err(|e| eyre!(e))?;
        }
        db.set_status(&run.uuid, TaskStatus::Running).await.map_err(|e| eyre!(e))?;

        info!(uuid = %run.uuid, key = %run.key, "task context created");
        Ok(Self { run, layout, dir, db })
    }

    /// Restore a paused attempt: move the directory back to `running/`,
    /// bump the resume counter and flip the mirror.
    pub async fn resume(layout: ContextLayout, db: DbHandle, run: TaskRun) -> Result<Self> {
        let paused_dir = layout.run_dir(RunState::Paused, &run.uuid);
        if !paused_dir.is_dir() {
            return Err(eyre!("no paused context for {}", run.uuid));
        }

        let mut state = TaskState::load(&paused_dir).context("paused run has no task_state.json")?;
        state.mark_resumed();
        state.status = "running".to_string();
        state.save(&paused_dir)?;

        let dir = layout.transition(&run.uuid, RunState::Paused, RunState::Running)?;

        let mut metadata = RunMetadata::load(&dir)?;
        metadata.status = TaskStatus::Running.to_string();
        metadata.is_resumed = true;
        metadata.resume_count = state.resume_count;
        metadata.save(&dir)?;

        db.set_status(&run.uuid, TaskStatus::Running).await.map_err(|e| eyre!(e))?;

        info!(uuid = %run.uuid, resume_count = state.resume_count, "task context resumed");
        Ok(Self { run, layout, dir, db })
    }

    pub fn run(&self) -> &TaskRun {
        &self.run
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn messages(&self) -> MessageStore {
        MessageStore::new(&self.dir)
    }

    pub fn summaries(&self) -> SummaryStore {
        SummaryStore::new(&self.dir)
    }

    pub fn tool_log(&self) -> ToolStore {
        ToolStore::new(&self.dir)
    }

    pub fn planning_history(&self) -> Result<PlanningHistoryStore> {
        PlanningHistoryStore::new(self.dir.join("planning"), &self.run.uuid)
    }

    /// The paused-run planning state, if this attempt was resumed.
    pub fn restored_planning_state(&self) -> Option<Value> {
        TaskState::load(&self.dir).ok().and_then(|s| s.planning_state)
    }

    /// Increment run counters in both the mirror and the metadata file.
    pub async fn add_stats(&self, llm_calls: i64, tool_calls: i64, tokens: i64, compressions: i64) -> Result<()> {
        self.db
            .add_stats(&self.run.uuid, llm_calls, tool_calls, tokens, compressions)
            .await
            .map_err(|e| eyre!(e))?;

        if let Ok(mut metadata) = RunMetadata::load(&self.dir) {
            metadata.llm_call_count += llm_calls.max(0) as u64;
            metadata.tool_call_count += tool_calls.max(0) as u64;
            metadata.total_tokens += tokens.max(0) as u64;
            metadata.compression_count += compressions.max(0) as u64;
            metadata.save(&self.dir)?;
        }
        Ok(())
    }

    /// Terminal transition: completed.
    pub async fn complete(self) -> Result<()> {
        self.finish(TaskStatus::Completed, None).await
    }

    /// Terminal transition: failed, with the error recorded.
    pub async fn fail(self, error: &str) -> Result<()> {
        self.db.set_error(&self.run.uuid, error).await.ok();
        self.finish(TaskStatus::Failed, Some(error.to_string())).await
    }

    /// Terminal transition: stopped by the control plane.
    pub async fn stop(self) -> Result<()> {
        self.finish(TaskStatus::Stopped, None).await
    }

    /// Suspend: write the resumption bundle and park the directory under
    /// `paused/`.
    pub async fn pause(self, planning_state: Option<Value>) -> Result<()> {
        let uuid = self.run.uuid.clone();

        let state = TaskState {
            task_key: self.run.key.to_dict(),
            uuid: uuid.clone(),
            user: self.run.user.clone(),
            paused_at: Utc::now(),
            status: "paused".to_string(),
            resume_count: RunMetadata::load(&self.dir).map(|m| m.resume_count).unwrap_or(0),
            resumed_at: None,
            last_error: None,
            context_path: format!("contexts/paused/{uuid}"),
            planning_state,
        };
        state.save(&self.dir)?;

        if let Ok(mut metadata) = RunMetadata::load(&self.dir) {
            metadata.status = TaskStatus::Paused.to_string();
            metadata.save(&self.dir)?;
        }

        self.layout.transition(&uuid, RunState::Running, RunState::Paused)?;
        self.db.set_status(&uuid, TaskStatus::Paused).await.map_err(|e| eyre!(e))?;

        info!(uuid = %uuid, "task paused");
        Ok(())
    }

    async fn finish(self, status: TaskStatus, error: Option<String>) -> Result<()> {
        let uuid = self.run.uuid.clone();

        if let Ok(mut metadata) = RunMetadata::load(&self.dir) {
            metadata.status = status.to_string();
            metadata.completed_at = Some(Utc::now());
            metadata.error_message = error;
            metadata.save(&self.dir)?;
        } else {
            warn!(uuid = %uuid, "finish: metadata.json unreadable");
        }

        self.layout.transition(&uuid, RunState::Running, RunState::Completed)?;
        self.db.set_status(&uuid, status).await.map_err(|e| eyre!(e))?;

        info!(uuid = %uuid, %status, "task finished");
        Ok(())
    }
}
