//! Executor exposed as a tool server.
//!
//! Wraps the environment manager so the coordinator can dispatch command
//! execution through the same catalog as every MCP server. The tool is
//! advertised as `executor_execute_command`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::mcp::{ToolCaller, ToolOutcome};

use super::manager::ExecEnvManager;

/// The execution environment as a `ToolCaller`, bound to one container.
pub struct ExecutorToolCaller {
    manager: Arc<ExecEnvManager>,
    container: String,
}

impl ExecutorToolCaller {
    pub fn new(manager: Arc<ExecEnvManager>, container: impl Into<String>) -> Self {
        Self {
            manager,
            container: container.into(),
        }
    }
}

#[async_trait]
impl ToolCaller for ExecutorToolCaller {
    async fn call(&self, tool: &str, args: Value) -> ToolOutcome {
        if tool != "execute_command" {
            return ToolOutcome::failure(format!("unknown executor tool: {tool}"));
        }
        let Some(command) = args.get("command").and_then(Value::as_str) else {
            return ToolOutcome::failure("missing required argument: command");
        };

        let result = self.manager.execute(&self.container, command).await;
        let mut content = result.stdout;
        if !result.stderr.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&result.stderr);
        }

        if result.exit_code == 0 {
            ToolOutcome {
                success: true,
                content,
                error: None,
            }
        } else {
            ToolOutcome {
                success: false,
                content: String::new(),
                error: Some(format!("exit code {}: {}", result.exit_code, content)),
            }
        }
    }

    fn schemas(&self) -> Vec<Value> {
        vec![json!({
            "name": "executor_execute_command",
            "description": "Run a shell command in the task's sandboxed project workspace",
            "parameters": {
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command to run in /workspace/project"}
                },
                "required": ["command"]
            },
        })]
    }

    fn name(&self) -> &str {
        "executor"
    }
}
