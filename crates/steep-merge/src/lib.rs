//! Bidirectional merge engine.
//!
//! Reconciles pre-existing divergent rows between two already-populated
//! databases before bidirectional replication is enabled. Overlap is
//! computed per table by joining the local table with a foreign mirror of
//! the peer over postgres_fdw, comparing 64-bit row hashes computed
//! identically on both sides; only primary keys and hashes cross the
//! wire. Tables are processed in foreign-key topological order.

mod catalog;
mod engine;
mod fdw;
mod quiesce;
mod row_hash;
mod topo;

pub use catalog::{MergeColumn, MergeTable, fetch_merge_tables, fetch_user_triggers};
pub use engine::{MergeOptions, MergeSummary, PeerEndpoint, TableMergeOutcome, run_merge};
pub use fdw::{FdwBridge, foreign_server_name, hash_view_name};
pub use quiesce::{QuiesceGuard, install_support};
pub use row_hash::{FNV1A_64_SQL, encode_row, encoded_row_expr, fnv1a_64};
pub use topo::{CycleError, topo_order};

use steep_types::ErrorKind;

/// Errors from the merge engine.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    Db(#[from] steep_db::DbError),

    #[error(transparent)]
    Fingerprint(#[from] steep_fingerprint::FingerprintError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("table {0} has no primary key; every merged table requires one")]
    MissingPrimaryKey(String),

    #[error(
        "strategy last_modified requires track_commit_timestamp = on on both nodes ({node} has it off)"
    )]
    CommitTimestampUnavailable { node: String },

    #[error("table {table} carries user trigger {trigger:?} that would double-apply during merge")]
    TriggerWouldDoubleApply { table: String, trigger: String },

    #[error("foreign-key cycle prevents ordering: {0}")]
    Cycle(#[from] topo::CycleError),

    #[error("schema fingerprints differ on {0} table(s); merge requires structural equality")]
    FingerprintMismatch(usize),

    #[error("could not quiesce writes within {timeout_ms} ms")]
    QuiesceTimeout { timeout_ms: u64 },

    #[error("merge cancelled")]
    Cancelled,
}

impl MergeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MergeError::Db(e) => e.kind(),
            MergeError::Fingerprint(e) => e.kind(),
            MergeError::Postgres(e) if steep_db::is_network_error(e) => ErrorKind::Unavailable,
            MergeError::Postgres(_) => ErrorKind::Internal,
            MergeError::MissingPrimaryKey(_)
            | MergeError::CommitTimestampUnavailable { .. }
            | MergeError::TriggerWouldDoubleApply { .. }
            | MergeError::Cycle(_)
            | MergeError::FingerprintMismatch(_)
            | MergeError::QuiesceTimeout { .. } => ErrorKind::FailedPrecondition,
            MergeError::Cancelled => ErrorKind::Canceled,
        }
    }
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn sanitize_identifier(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
