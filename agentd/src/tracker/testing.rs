//! Mock tool server for tracker and coordinator tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::mcp::{ToolCaller, ToolOutcome};

/// Records calls and replies with canned JSON per tool name.
pub struct MockToolServer {
    name: String,
    responses: Mutex<HashMap<String, Vec<ToolOutcome>>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockToolServer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queue a successful JSON reply for a tool. Repeated calls reuse the
    /// last queued reply.
    pub async fn respond_with(&self, tool: &str, payload: Value) {
        self.responses.lock().await.entry(tool.to_string()).or_default().push(ToolOutcome {
            success: true,
            content: payload.to_string(),
            error: None,
        });
    }

    /// Queue a failure for a tool.
    pub async fn fail_with(&self, tool: &str, error: &str) {
        self.responses
            .lock()
            .await
            .entry(tool.to_string())
            .or_default()
            .push(ToolOutcome::failure(error));
    }

    pub async fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, tool: &str) -> usize {
        self.calls.lock().await.iter().filter(|(t, _)| t == tool).count()
    }
}

#[async_trait]
impl ToolCaller for MockToolServer {
    async fn call(&self, tool: &str, args: Value) -> ToolOutcome {
        self.calls.lock().await.push((tool.to_string(), args));

        let mut responses = self.responses.lock().await;
        match responses.get_mut(tool) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) if queue.len() == 1 => queue[0].clone(),
            _ => ToolOutcome::failure(format!("no mock response for {tool}")),
        }
    }

    fn schemas(&self) -> Vec<Value> {
        vec![serde_json::json!({
            "name": format!("{}_mock_tool", self.name),
            "description": "mock",
            "parameters": {"type": "object", "properties": {}},
        })]
    }

    fn name(&self) -> &str {
        &self.name
    }
}
