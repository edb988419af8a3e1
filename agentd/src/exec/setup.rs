//! Environment setup verification and repair.
//!
//! After the container is provisioned, a quick verification confirms the
//! workspace is usable. Classifiably fixable failures are handed to the
//! model, which proposes repair commands; fatal failures log a warning and
//! the run proceeds without a verified sandbox.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::llm::{ChatMessage, LlmClient};
use crate::planning::extract_json;

use super::manager::ExecEnvManager;

/// Maximum model-proposed repair attempts.
const MAX_REGENERATIONS: u32 = 3;

/// Checks that must pass for the workspace to count as ready.
const VERIFICATION_COMMANDS: &[&str] = &["test -d /workspace/project", "git -C /workspace/project status --short"];

/// Failure classes for setup errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupFailure {
    /// Worth retrying or repairing: missing packages, transient fetches
    Fixable,
    /// Not repairable from inside the container
    Fatal,
}

/// Outcome of the setup phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupStatus {
    Verified,
    /// Proceeding anyway; the planner is told the sandbox is degraded
    ProceededWithWarning(String),
}

/// Verifies a prepared container and repairs fixable failures through the
/// model.
pub struct EnvironmentSetupManager {
    exec: Arc<ExecEnvManager>,
    llm: Arc<dyn LlmClient>,
}

impl EnvironmentSetupManager {
    pub fn new(exec: Arc<ExecEnvManager>, llm: Arc<dyn LlmClient>) -> Self {
        Self { exec, llm }
    }

    /// Run the verification commands; on fixable failure ask the model for
    /// a repair command, execute it, and re-verify, up to the regeneration
    /// budget.
    pub async fn verify_and_repair(&self, container: &str) -> SetupStatus {
        let mut regenerations = 0;

        loop {
            let Some((command, stderr)) = self.first_failure(container).await else {
                info!(container, "verify_and_repair: environment verified");
                return SetupStatus::Verified;
            };

            let failure = classify_failure(&stderr);
            if failure == SetupFailure::Fatal || regenerations >= MAX_REGENERATIONS {
                let reason = format!("setup verification failed on `{command}`: {stderr}");
                warn!(container, %reason, "verify_and_repair: proceeding with warning");
                return SetupStatus::ProceededWithWarning(reason);
            }

            regenerations += 1;
            debug!(container, regenerations, %command, "verify_and_repair: requesting repair");
            let Some(repair) = self.request_repair_command(&command, &stderr).await else {
                let reason = format!("no usable repair for `{command}`: {stderr}");
                warn!(container, %reason, "verify_and_repair: proceeding with warning");
                return SetupStatus::ProceededWithWarning(reason);
            };

            let result = self.exec.execute(container, &repair).await;
            if result.exit_code != 0 {
                debug!(container, repair, stderr = %result.stderr, "verify_and_repair: repair command failed");
            }
        }
    }

    /// The first verification command that fails, with its stderr.
    async fn first_failure(&self, container: &str) -> Option<(String, String)> {
        for command in VERIFICATION_COMMANDS {
            let result = self.exec.execute(container, command).await;
            if result.exit_code != 0 {
                return Some(((*command).to_string(), result.stderr));
            }
        }
        None
    }

    /// Ask the model for one shell command that repairs the failure.
    async fn request_repair_command(&self, command: &str, stderr: &str) -> Option<String> {
        let prompt = format!(
            "Environment setup verification failed inside a Linux container.\n\
             Failed check: {command}\n\
             Error output: {stderr}\n\n\
             Propose ONE shell command that repairs the environment.\n\
             Return ONLY a JSON object: {{\"command\": \"...\"}}"
        );

        let response = self.llm.chat(&[ChatMessage::user(prompt)]).await.ok()?;
        let value = extract_json(&response.content)?;
        value
            .get("command")
            .and_then(Value::as_str)
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string)
    }
}

/// Classify setup stderr into fixable vs fatal.
fn classify_failure(stderr: &str) -> SetupFailure {
    let lowered = stderr.to_lowercase();
    let fatal_markers = ["no space left", "out of memory", "cannot allocate", "read-only file system"];
    if fatal_markers.iter().any(|m| lowered.contains(m)) {
        return SetupFailure::Fatal;
    }
    SetupFailure::Fixable
}
