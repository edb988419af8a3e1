//! Context directory layout and lifecycle transitions.
//!
//! A run lives in exactly one of `running/`, `paused/` or `completed/`
//! under the base directory. Transitions are atomic directory renames, and
//! the filesystem placement is the source of truth for in-flight runs; the
//! task database is the queryable mirror.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Where a run's directory currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Completed,
}

impl RunState {
    fn dir_name(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

/// The run descriptor persisted as `metadata.json`.
///
/// Source of truth for the in-flight attempt; the database row mirrors it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub uuid: String,
    pub task_key: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>,
    #[serde(default)]
    pub llm_call_count: u64,
    #[serde(default)]
    pub tool_call_count: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub compression_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub is_resumed: bool,
    #[serde(default)]
    pub resume_count: u32,
}

impl RunMetadata {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("metadata.json");
        let content = fs::read_to_string(&path).context(format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).context("Malformed metadata.json")
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join("metadata.json");
        fs::write(&path, serde_json::to_string_pretty(self)?).context(format!("Failed to write {}", path.display()))
    }
}

/// The resumption bundle persisted as `task_state.json` while paused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_key: Value,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub paused_at: DateTime<Utc>,
    pub status: String,
    #[serde(default)]
    pub resume_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub context_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planning_state: Option<Value>,
}

impl TaskState {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("task_state.json");
        let content = fs::read_to_string(&path).context(format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).context("Malformed task_state.json")
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join("task_state.json");
        fs::write(&path, serde_json::to_string_pretty(self)?).context(format!("Failed to write {}", path.display()))
    }

    /// Stamp a resumption: bump the counter and record the time.
    pub fn mark_resumed(&mut self) {
        self.resume_count += 1;
        self.resumed_at = Some(Utc::now());
    }
}

/// The `contexts/` tree: run directories keyed by uuid across three states.
#[derive(Debug, Clone)]
pub struct ContextLayout {
    base_dir: PathBuf,
}

impl ContextLayout {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create the three state directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for state in [RunState::Running, RunState::Paused, RunState::Completed] {
            fs::create_dir_all(self.state_dir(state)).context("Failed to create context state directory")?;
        }
        Ok(())
    }

    pub fn state_dir(&self, state: RunState) -> PathBuf {
        self.base_dir.join(state.dir_name())
    }

    pub fn run_dir(&self, state: RunState, uuid: &str) -> PathBuf {
        self.state_dir(state).join(uuid)
    }

    /// Create a fresh `running/<uuid>/` directory with its planning subdir.
    pub fn create_running(&self, uuid: &str) -> Result<PathBuf> {
        self.ensure_dirs()?;
        let dir = self.run_dir(RunState::Running, uuid);
        fs::create_dir_all(dir.join("planning")).context("Failed to create run directory")?;
        debug!(uuid, dir = %dir.display(), "create_running: run directory created");
        Ok(dir)
    }

    /// Locate a run directory by uuid, preferring running over paused over
    /// completed.
    pub fn find(&self, uuid: &str) -> Option<(RunState, PathBuf)> {
        for state in [RunState::Running, RunState::Paused, RunState::Completed] {
            let dir = self.run_dir(state, uuid);
            if dir.is_dir() {
                return Some((state, dir));
            }
        }
        None
    }

    /// Atomically move a run directory between states.
    pub fn transition(&self, uuid: &str, from: RunState, to: RunState) -> Result<PathBuf> {
        let source = self.run_dir(from, uuid);
        let target = self.run_dir(to, uuid);

        if !source.is_dir() {
            return Err(eyre!("run directory not found: {}", source.display()));
        }
        fs::create_dir_all(self.state_dir(to))?;
        fs::rename(&source, &target).context(format!(
            "Failed to move {} -> {}",
            source.display(),
            target.display()
        ))?;

        info!(uuid, from = from.dir_name(), to = to.dir_name(), "transition: run directory moved");
        Ok(target)
    }

    /// Uuids of runs sitting in `paused/` with a readable resumption bundle.
    pub fn list_paused(&self) -> Result<Vec<TaskState>> {
        let paused_dir = self.state_dir(RunState::Paused);
        if !paused_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut states = Vec::new();
        for entry in fs::read_dir(&paused_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            match TaskState::load(&entry.path()) {
                Ok(state) if state.status == "paused" => states.push(state),
                Ok(state) => {
                    warn!(uuid = %state.uuid, status = %state.status, "list_paused: unexpected bundle status");
                }
                Err(e) => {
                    warn!(dir = %entry.path().display(), error = %e, "list_paused: unreadable task_state.json");
                }
            }
        }
        Ok(states)
    }

    /// Uuids of directories currently under `running/`.
    pub fn list_running(&self) -> Result<Vec<String>> {
        let running_dir = self.state_dir(RunState::Running);
        if !running_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut uuids = Vec::new();
        for entry in fs::read_dir(&running_dir)? {
            let entry = entry?;
            if entry.path().is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                uuids.push(name.to_string());
            }
        }
        Ok(uuids)
    }
}
