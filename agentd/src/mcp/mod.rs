//! MCP tool clients.
//!
//! Every tool server speaks JSON-RPC 2.0 over newline-delimited stdio. One
//! client owns one long-lived subprocess; calls are strictly
//! request/response with no pipelining, serialized by an internal lock.

mod client;
mod protocol;

pub use client::{McpServerConfig, ToolCaller, ToolClient, ToolOutcome};
pub use protocol::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpToolDef, PROTOCOL_VERSION, ToolCallContent,
    ToolCallResult, ToolsListResult, initialize_params,
};
