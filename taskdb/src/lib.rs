//! Relational index of task runs.
//!
//! The context directory on disk is the source of truth for an in-flight
//! run; this database is the queryable mirror, indexed so prior attempts on
//! the same work item are discoverable cheaply. One row per run attempt.

pub mod db;
pub mod record;

pub use db::TaskDb;
pub use record::{TaskKeyParts, TaskRecord, TaskStatus};
