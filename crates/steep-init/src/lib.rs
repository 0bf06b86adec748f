//! The init state machine.
//!
//! Drives a target node from Uninitialized to Synchronized by one of four
//! methods (logical snapshot, manual backup restore, two-phase file
//! snapshot, direct side-channel), gating on schema compatibility,
//! orchestrating slots and subscriptions, and reporting through the
//! progress fabric. Transitions are serialized per target node; exactly
//! one init may be in flight per target.

mod catchup;
mod machine;
mod progress_store;

pub use catchup::{CatchupTracker, Ewma};
pub use machine::{InitMachine, StartInitSpec};
pub use progress_store::InitProgressStore;

use steep_types::{ErrorKind, InitState, NodeId};

/// Minimum supported server version (PostgreSQL 18.0).
pub const MIN_SERVER_VERSION_NUM: i32 = 180_000;

/// Errors from the init state machine.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Db(#[from] steep_db::DbError),

    #[error(transparent)]
    Registry(#[from] steep_registry::RegistryError),

    #[error(transparent)]
    Fingerprint(#[from] steep_fingerprint::FingerprintError),

    #[error(transparent)]
    Replication(#[from] steep_replication::ReplicationError),

    #[error(transparent)]
    Snapshot(#[from] steep_snapshot::SnapshotError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("an init for {0} is already in flight")]
    AlreadyInFlight(NodeId),

    #[error("node {node} is {state}; the requested operation needs {needed}")]
    WrongState {
        node: NodeId,
        state: InitState,
        needed: &'static str,
    },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("server version {found} is older than the required PostgreSQL 18.0")]
    VersionTooOld { found: i32 },

    #[error("method direct requires a connection string in the options")]
    MissingConninfo,

    #[error("method two_phase requires a snapshot output directory in the options")]
    MissingSnapshotDir,

    #[error("no active init for {0}")]
    NoActiveInit(NodeId),

    #[error("init cancelled")]
    Cancelled,
}

impl InitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InitError::Db(e) => e.kind(),
            InitError::Registry(e) => e.kind(),
            InitError::Fingerprint(e) => e.kind(),
            InitError::Replication(e) => e.kind(),
            InitError::Snapshot(e) => e.kind(),
            InitError::Postgres(e) if steep_db::is_network_error(e) => ErrorKind::Unavailable,
            InitError::Postgres(_) => ErrorKind::Internal,
            InitError::AlreadyInFlight(_) => ErrorKind::AlreadyExists,
            InitError::WrongState { .. } | InitError::VersionTooOld { .. } => {
                ErrorKind::FailedPrecondition
            }
            InitError::UnknownNode(_) | InitError::NoActiveInit(_) => ErrorKind::NotFound,
            InitError::MissingConninfo | InitError::MissingSnapshotDir => {
                ErrorKind::InvalidArgument
            }
            InitError::Cancelled => ErrorKind::Canceled,
        }
    }
}
