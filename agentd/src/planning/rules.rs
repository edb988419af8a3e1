//! Project agent rules.
//!
//! Repositories may carry rule files addressed to coding agents. When
//! enabled, their content is read out of the workspace and included in the
//! planning prompt, bounded by per-file and total size caps.

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::config::ProjectRulesConfig;
use crate::mcp::ToolCaller;

/// Reads rule files from the task workspace through the executor.
pub struct ProjectRulesLoader {
    config: ProjectRulesConfig,
}

impl ProjectRulesLoader {
    pub fn new(config: ProjectRulesConfig) -> Self {
        Self { config }
    }

    /// Concatenate the configured rule files, each truncated to the
    /// per-file cap, stopping at the total cap. None when disabled, no
    /// executor is wired, or nothing was found.
    pub async fn load(&self, executor: Option<&Arc<dyn ToolCaller>>) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        let executor = executor?;

        let mut collected = String::new();
        for file in &self.config.files {
            if collected.len() >= self.config.max_total_size {
                info!(cap = self.config.max_total_size, "load: total rules cap reached");
                break;
            }

            let outcome = executor
                .call("execute_command", json!({"command": format!("cat {file}")}))
                .await;
            if !outcome.success || outcome.content.trim().is_empty() {
                debug!(file, "load: rule file absent or empty");
                continue;
            }

            let mut content = outcome.content;
            if content.len() > self.config.max_file_size {
                let mut cut = self.config.max_file_size;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
                content.push_str("\n... [truncated]");
            }

            collected.push_str(&format!("### {file}\n{content}\n\n"));
        }

        let budget = self.config.max_total_size;
        if collected.len() > budget {
            let mut cut = budget;
            while !collected.is_char_boundary(cut) {
                cut -= 1;
            }
            collected.truncate(cut);
            collected.push_str("\n... [truncated]");
        }

        if collected.is_empty() { None } else { Some(collected) }
    }
}
