//! The tracked-task trait.

use async_trait::async_trait;
use eyre::Result;

use crate::domain::TaskKey;
use crate::exec::RepoSpec;

/// One upstream work item and the operations the runtime performs on it.
///
/// Implementations speak through the tracker's MCP tool server. Label
/// mutations are best-effort at the call sites that tolerate inconsistency
/// (pause, stop); `prepare`/`finish` propagate failures.
#[async_trait]
pub trait TrackedTask: Send + Sync {
    fn key(&self) -> &TaskKey;

    fn title(&self) -> &str;

    fn body(&self) -> &str;

    /// Swap the activation label for the processing label.
    async fn prepare(&self) -> Result<()>;

    /// True while the processing label is still present upstream.
    async fn check(&self) -> Result<bool>;

    /// The user request: title, body and discussion so far.
    async fn prompt(&self) -> Result<String>;

    /// Post a comment; `mention` prefixes the item's author.
    /// Returns the new comment's id when the tracker exposes one.
    async fn comment(&self, text: &str, mention: bool) -> Result<Option<String>>;

    /// Rewrite an existing comment (progress checklists).
    async fn update_comment(&self, comment_id: &str, text: &str) -> Result<()>;

    /// Swap the processing label for the done label.
    async fn finish(&self) -> Result<()>;

    async fn add_label(&self, label: &str) -> Result<()>;

    async fn remove_label(&self, label: &str) -> Result<()>;

    /// Current assignee usernames, re-read from the API.
    async fn assignees(&self) -> Result<Vec<String>>;

    /// Repository checkout for the execution environment, when applicable.
    fn clone_spec(&self) -> Option<RepoSpec>;
}
