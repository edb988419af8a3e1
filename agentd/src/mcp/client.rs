//! Long-lived MCP tool subprocess client.
//!
//! The client owns one child process and serializes full request/response
//! cycles under a lock; responses with a non-matching id are dropped. Tool
//! errors never escape as Rust errors: every failure path folds into a
//! `ToolOutcome` with `success = false` so the planner can reason about it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpToolDef, ToolCallResult, initialize_params,
};

/// Maximum number of non-JSON lines tolerated before declaring the server broken.
const MAX_SKIP_LINES: usize = 1000;

/// Grace period between closing stdin and SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Launch configuration for one tool server.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Server name; prefixes every advertised tool
    pub name: String,
    /// Command and arguments, often `docker exec -i <container> <server>`
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Per-call timeout
    pub call_timeout: Duration,
}

impl McpServerConfig {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            env: BTreeMap::new(),
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// Errors inside the transport. Collapsed into `ToolOutcome` at the
/// `call_tool` boundary.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tool server process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Result of one tool call, in the shape the planner consumes.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn failure(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            content: String::new(),
            error: Some(error),
        }
    }
}

/// Object-safe calling surface over a tool server.
///
/// `ToolClient` is the production implementation; tests substitute mocks.
#[async_trait::async_trait]
pub trait ToolCaller: Send + Sync {
    /// Invoke a tool by its unprefixed name.
    async fn call(&self, tool: &str, args: Value) -> ToolOutcome;

    /// OpenAI function schemas, names prefixed with the server name.
    fn schemas(&self) -> Vec<Value>;

    /// The server name used as the tool-name prefix.
    fn name(&self) -> &str;
}

#[async_trait::async_trait]
impl ToolCaller for ToolClient {
    async fn call(&self, tool: &str, args: Value) -> ToolOutcome {
        self.call_tool(tool, args).await
    }

    fn schemas(&self) -> Vec<Value> {
        self.function_schemas()
    }

    fn name(&self) -> &str {
        self.server_name()
    }
}

/// One tool subprocess speaking newline-delimited JSON-RPC.
pub struct ToolClient {
    config: McpServerConfig,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    /// Serializes whole request/response cycles; the protocol has no pipelining
    request_lock: Mutex<()>,
    next_id: AtomicU64,
    tools: Vec<McpToolDef>,
}

impl ToolClient {
    /// Spawn the server, run the `initialize` handshake and fetch the tool
    /// catalog.
    pub async fn start(config: McpServerConfig) -> Result<Self, TransportError> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| TransportError::Handshake("empty server command".to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no child stdin")))?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no child stdout"))
        })?;

        let client = Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            tools: Vec::new(),
            config,
        };

        client.initialize().await?;
        let tools = client.fetch_tools().await.unwrap_or_else(|e| {
            warn!(server = %client.config.name, error = %e, "start: tools/list failed, empty catalog");
            Vec::new()
        });

        info!(server = %client.config.name, tool_count = tools.len(), "tool client started");
        Ok(Self { tools, ..client })
    }

    pub fn server_name(&self) -> &str {
        &self.config.name
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let response = self.send_request("initialize", Some(initialize_params())).await?;
        response
            .into_result()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let notification = JsonRpcNotification::new("notifications/initialized");
        self.write_line(&serde_json::to_string(&notification)?).await?;
        Ok(())
    }

    async fn fetch_tools(&self) -> Result<Vec<McpToolDef>, TransportError> {
        let response = self.send_request("tools/list", None).await?;
        let result = response
            .into_result()
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let list: super::protocol::ToolsListResult = serde_json::from_value(result)?;
        Ok(list.tools)
    }

    /// Invoke one tool. Transport and protocol failures come back as
    /// unsuccessful outcomes, not errors; the process is not restarted.
    pub async fn call_tool(&self, name: &str, args: Value) -> ToolOutcome {
        debug!(server = %self.config.name, tool = name, "call_tool: called");

        let params = json!({"name": name, "arguments": args});
        let response = match self.send_request("tools/call", Some(params)).await {
            Ok(response) => response,
            Err(TransportError::Timeout) => {
                return ToolOutcome::failure(format!("No response from {} (timeout)", self.config.name));
            }
            Err(e) => return ToolOutcome::failure(e.to_string()),
        };

        let result = match response.into_result() {
            Ok(result) => result,
            Err(e) => return ToolOutcome::failure(e.to_string()),
        };

        let call_result: ToolCallResult = match serde_json::from_value(result) {
            Ok(parsed) => parsed,
            Err(e) => return ToolOutcome::failure(format!("malformed tool result: {e}")),
        };

        let text = call_result.joined_text();
        if call_result.is_error {
            ToolOutcome::failure(text)
        } else {
            ToolOutcome {
                success: true,
                content: text,
                error: None,
            }
        }
    }

    /// OpenAI function-calling schemas for this server's catalog, names
    /// prefixed `<server>_<tool>`.
    pub fn function_schemas(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                json!({
                    "name": format!("{}_{}", self.config.name, tool.name),
                    "description": tool.description,
                    "parameters": tool.input_schema,
                })
            })
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools
            .iter()
            .map(|t| format!("{}_{}", self.config.name, t.name))
            .collect()
    }

    pub async fn is_running(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }

    /// Close stdin, give the server a grace period, then SIGKILL.
    pub async fn stop(&self) {
        debug!(server = %self.config.name, "stop: called");
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                debug!(error = %e, "stop: closing stdin failed");
            }
        }

        let mut child = self.child.lock().await;
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(server = %self.config.name, ?status, "stop: server exited"),
            Ok(Err(e)) => warn!(server = %self.config.name, error = %e, "stop: wait failed"),
            Err(_) => {
                warn!(server = %self.config.name, "stop: grace period expired, killing");
                let _ = child.kill().await;
            }
        }
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, TransportError> {
        // One cycle at a time, otherwise callers could read each other's
        // responses.
        let _guard = self.request_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        self.write_line(&serde_json::to_string(&request)?).await?;

        let read = async {
            loop {
                let line = self.read_line().await?;
                if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&line) {
                    if response.id == id {
                        return Ok(response);
                    }
                    debug!(expected = id, got = response.id, "send_request: dropping mismatched response");
                    continue;
                }
                // Notifications and other traffic between request and
                // response are skipped.
                debug!(line = %line, "send_request: skipping non-response line");
            }
        };

        match tokio::time::timeout(self.config.call_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_line(&self) -> Result<String, TransportError> {
        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let bytes_read = stdout.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Err(TransportError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            // A misconfigured server logging to stdout must not spin us
            // forever.
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "tool server produced too many non-JSON lines on stdout",
                )));
            }
            debug!(line = %trimmed, "read_line: skipping non-JSON stdout line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A shell script standing in for a tool server: replies to initialize,
    /// tools/list and tools/call with canned single-line JSON.
    fn fake_server_command() -> Vec<String> {
        let script = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *notifications/initialized*) ;;
    *initialize*) printf '{"jsonrpc":"2.0","id":%s,"result":{"capabilities":{}}}\n' "$id" ;;
    *tools/list*) printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echo text","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *tools/call*fail*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"boom"}],"isError":true}}\n' "$id" ;;
    *tools/call*) printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hello"},{"type":"text","text":"world"}]}}\n' "$id" ;;
  esac
done
"#;
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_start_and_call_tool() {
        let config = McpServerConfig::new("fake", fake_server_command());
        let client = ToolClient::start(config).await.unwrap();

        assert_eq!(client.tool_names(), vec!["fake_echo".to_string()]);

        let outcome = client.call_tool("echo", json!({"text": "hi"})).await;
        assert!(outcome.success);
        assert_eq!(outcome.content, "hello\nworld");

        client.stop().await;
    }

    #[tokio::test]
    async fn test_is_error_flips_success() {
        let config = McpServerConfig::new("fake", fake_server_command());
        let client = ToolClient::start(config).await.unwrap();

        let outcome = client.call_tool("echo", json!({"mode": "fail"})).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("boom"));

        client.stop().await;
    }

    #[tokio::test]
    async fn test_silent_server_times_out_as_failure() {
        let mut config = McpServerConfig::new(
            "mute",
            vec!["sh".to_string(), "-c".to_string(), "cat > /dev/null".to_string()],
        );
        config.call_timeout = Duration::from_millis(300);

        // The handshake itself never completes against a mute server.
        let started = ToolClient::start(config).await;
        assert!(matches!(started, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_function_schemas_prefixed() {
        let config = McpServerConfig::new("fake", fake_server_command());
        let client = ToolClient::start(config).await.unwrap();

        let schemas = client.function_schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0]["name"], "fake_echo");
        assert_eq!(schemas[0]["description"], "echo text");

        client.stop().await;
    }
}
