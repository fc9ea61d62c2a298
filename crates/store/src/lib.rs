//! Embedded persistence for the Leon runtime.
//!
//! One sqlite database file (`leon.db` under `LEON_HOME`) holds every
//! durable table: threads, runs, the run-event log, checkpoints, summaries,
//! the message queue, and the resolver's session/terminal/lease tables.
//! Each store type borrows a [`Database`] handle; the connection is
//! writer-serialized with WAL and a 30 s busy timeout.

pub mod checkpoints;
pub mod db;
pub mod events;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod runs;
pub mod summaries;
pub mod threads;

pub use checkpoints::{Checkpoint, CheckpointConfig, CheckpointStore, SqliteCheckpointStore};
pub use db::Database;
pub use events::EventLog;
pub use queue::{QueueStore, QueuedMessage, RoutingMode};
pub use resolver::ResolverStore;
pub use runs::RunStore;
pub use summaries::{Summary, SummaryStore};
pub use threads::{ThreadRecord, ThreadStore};
