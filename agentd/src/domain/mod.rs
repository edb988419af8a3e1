//! Core domain types: work-item identity and run attempts.

mod task;
mod task_key;

pub use task::TaskRun;
pub use task_key::TaskKey;
