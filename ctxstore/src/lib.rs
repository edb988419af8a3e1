//! File-backed context storage for agent task runs.
//!
//! Every task run owns one directory under `contexts/{running,paused,completed}`
//! holding append-only JSONL logs:
//!
//! - `messages.jsonl` - the full audit log, one seq-numbered record per line
//! - `current.jsonl` - the live context window shown to the model (lossy)
//! - `summaries.jsonl` - compression history
//! - `tools.jsonl` - tool execution history
//! - `planning/<uuid>.jsonl` - plans, reflections, revisions, replan decisions
//!
//! The audit log is authoritative: a crash between the paired writes to
//! `messages.jsonl` and `current.jsonl` is recovered by reconciling the
//! current window from the audit log.

pub mod estimate;
pub mod layout;
pub mod message;
pub mod planning;
pub mod summary;
pub mod tool_log;

pub use estimate::{estimate_messages_tokens, estimate_tokens};
pub use layout::{ContextLayout, RunMetadata, RunState, TaskState};
pub use message::{CurrentMessage, MessageStore, StoredMessage};
pub use planning::PlanningHistoryStore;
pub use summary::{SummaryRecord, SummaryStore};
pub use tool_log::{ToolCallRecord, ToolCallStatus, ToolStore};
