//! Replication slot and subscription lifecycle.
//!
//! Slots are created on the source with the `pgoutput` plugin through a
//! dedicated connection, capturing the consistent-point LSN returned at
//! creation. Subscriptions are created on the target against a standing
//! `steep_pub` publication with `create_slot = false`, pointing at the
//! slot this daemon prepared. Failure and cancellation restore the
//! pre-call state: a subscription that failed to create drops the slot it
//! would have consumed.

mod monitor;
mod slots;
mod subscriptions;

pub use monitor::{CopyTableProgress, SubscriptionMonitor};
pub use slots::{PreparedSlot, SlotManager};
pub use subscriptions::{SubscriptionManager, subscription_name};

use steep_types::ErrorKind;

/// The standing publication every source node carries.
pub const PUBLICATION: &str = "steep_pub";

/// Errors from slot and subscription management.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Db(#[from] steep_db::DbError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("replication slot {0:?} already exists")]
    SlotExists(String),

    #[error("replication slot {0:?} not found")]
    SlotNotFound(String),

    #[error("subscription {0:?} already exists")]
    SubscriptionExists(String),

    #[error("malformed LSN returned by server: {0}")]
    MalformedLsn(String),
}

impl ReplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReplicationError::Db(e) => e.kind(),
            ReplicationError::SlotExists(_) | ReplicationError::SubscriptionExists(_) => {
                ErrorKind::AlreadyExists
            }
            ReplicationError::SlotNotFound(_) => ErrorKind::NotFound,
            ReplicationError::Postgres(e) if steep_db::is_network_error(e) => ErrorKind::Unavailable,
            ReplicationError::Postgres(_) | ReplicationError::MalformedLsn(_) => ErrorKind::Internal,
        }
    }
}

/// SQLSTATE 42710: duplicate_object.
pub(crate) fn is_duplicate_object(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&tokio_postgres::error::SqlState::DUPLICATE_OBJECT)
}

/// SQLSTATE 42704: undefined_object.
pub(crate) fn is_undefined_object(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&tokio_postgres::error::SqlState::UNDEFINED_OBJECT)
}

/// Escapes a value for embedding in a single-quoted SQL literal. DDL
/// statements such as CREATE SUBSCRIPTION cannot take bind parameters.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_quoting_doubles_quotes() {
        assert_eq!(quote_literal("host=db1"), "'host=db1'");
        assert_eq!(quote_literal("pa'ss"), "'pa''ss'");
    }
}
