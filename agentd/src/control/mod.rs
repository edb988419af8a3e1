//! External control plane.
//!
//! Two signals interject into a running task: a pause file dropped on disk,
//! and removal of the bot from the upstream item's assignees. Both are
//! cooperative: the coordinator polls at phase boundaries and the current
//! action always completes first.

mod pause;
mod stop;

use async_trait::async_trait;

pub use pause::PauseResumeManager;
pub use stop::TaskStopManager;

/// What the control plane wants the coordinator to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Continue,
    Pause,
    Stop,
}

/// Polled by the coordinator between phases and actions.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn poll(&self) -> ControlAction;
}
