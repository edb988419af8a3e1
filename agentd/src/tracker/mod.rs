//! Issue-tracker surface.
//!
//! Tasks talk to GitHub/GitLab exclusively through their MCP tool servers;
//! arguments follow the upstream server schemas and response text comes out
//! of `result.content[*].text`. Labels on the upstream item are the task's
//! externally visible state machine.

mod getter;
mod github;
mod gitlab;
mod task;

pub use getter::TaskGetter;
pub use github::GithubTask;
pub use gitlab::GitlabTask;
pub use task::TrackedTask;

pub mod testing;
