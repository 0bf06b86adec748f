//! PostgreSQL access layer for the steep-repl daemon.
//!
//! Owns the connection pool, bootstraps the `steep_repl` control schema,
//! and provides the durable work queue plus LISTEN/NOTIFY plumbing that
//! the rest of the control plane builds on.

mod error;
mod notify;
mod pool;
mod schema;
mod work_queue;

pub use error::DbError;
pub use notify::{NotifyListener, Notifier, PROGRESS_CHANNEL, WORK_CHANNEL};
pub use pool::{Db, PoolOptions, connect_with_retry, is_network_error};
pub use schema::bootstrap_control_schema;
pub use work_queue::{WorkQueueEntry, WorkQueueStore};
