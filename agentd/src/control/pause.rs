//! Pause and resume.
//!
//! Pause is signaled by the presence of a configured file. The signal file
//! is never removed by the runtime; operators delete it to re-enable
//! pickup. Paused runs are re-enqueued on consumer startup.

use std::path::PathBuf;

use eyre::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{PauseResumeConfig, TrackerConfig};
use crate::context::TaskContextManager;
use crate::tracker::TrackedTask;

/// Pause signal detection and the pause/resume transitions.
pub struct PauseResumeManager {
    enabled: bool,
    signal_file: PathBuf,
}

impl PauseResumeManager {
    pub fn new(config: &PauseResumeConfig) -> Self {
        Self {
            enabled: config.enabled,
            signal_file: config.signal_file.clone(),
        }
    }

    /// True while the signal file exists.
    pub fn check_pause_signal(&self) -> bool {
        if !self.enabled {
            return false;
        }
        let present = self.signal_file.exists();
        if present {
            info!(signal = %self.signal_file.display(), "pause signal detected");
        }
        present
    }

    /// Park the run: resumption bundle, directory move, label swap, notice.
    /// Label and comment failures are tolerated; the park itself is not.
    pub async fn pause_task(
        &self,
        ctx: TaskContextManager,
        task: &dyn TrackedTask,
        tracker: &TrackerConfig,
        planning_state: Option<Value>,
    ) -> Result<()> {
        let uuid = ctx.run().uuid.clone();
        info!(%uuid, "pause_task: parking run");

        ctx.pause(planning_state).await?;

        if let Err(e) = task.remove_label(&tracker.processing_label).await {
            warn!(error = %e, "pause_task: removing processing label failed");
        }
        if let Err(e) = task.add_label(&tracker.paused_label).await {
            warn!(error = %e, "pause_task: adding paused label failed");
        }
        if let Err(e) = task
            .comment("⏸️ Task paused. It will be resumed once the pause signal is cleared.", false)
            .await
        {
            warn!(error = %e, "pause_task: notice comment failed");
        }

        // The signal file stays; operators remove it to resume.
        info!(signal = %self.signal_file.display(), "pause_task: signal file left in place");
        Ok(())
    }

    /// Upstream side of resumption: swap labels back and post the notice.
    /// The directory move is done by the context manager's resume.
    pub async fn announce_resume(&self, task: &dyn TrackedTask, tracker: &TrackerConfig) {
        if let Err(e) = task.remove_label(&tracker.paused_label).await {
            warn!(error = %e, "announce_resume: removing paused label failed");
        }
        if let Err(e) = task.add_label(&tracker.processing_label).await {
            warn!(error = %e, "announce_resume: adding processing label failed");
        }
        if let Err(e) = task.comment("▶️ Resuming the paused task.", false).await {
            warn!(error = %e, "announce_resume: notice comment failed");
        }
    }
}
