//! Task database actor.
//!
//! The rusqlite connection is owned by a single actor task; handles send
//! commands over a channel, so every consumer shares one serialized
//! connection without blocking the async runtime from multiple threads.

mod actor;
mod messages;

pub use actor::DbHandle;
pub use messages::{DbCommand, DbError, DbResponse};
