//! Two-phase snapshot pipeline.
//!
//! The generator exports every user table from a source node into
//! checksummed files under a snapshot directory, capturing a replication
//! slot LSN for later catch-up; the applier verifies, truncates, imports,
//! and restores sequences on the target. The manifest is written last and
//! atomically: its presence declares the snapshot complete.
//!
//! ```text
//! <output_dir>/
//!   manifest.json
//!   data/<schema>.<table>.csv[.<codec>]
//! ```

mod applier;
mod codec;
mod generator;
mod manifest;

pub use applier::{ApplyOptions, ApplyOutcome, apply_snapshot};
pub use codec::{DecodingReader, EncodingWriter, Sha256Writer};
pub use generator::{GenerateOptions, GenerateOutcome, generate_snapshot, snapshot_slot_name};
pub use manifest::{
    MANIFEST_FILE, SCHEMA_VERSION, SequenceEntry, SnapshotManifest, TableEntry,
};

use steep_types::ErrorKind;

/// Errors from snapshot generation and application.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Db(#[from] steep_db::DbError),

    #[error(transparent)]
    Replication(#[from] steep_replication::ReplicationError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no snapshot manifest at {0}")]
    ManifestNotFound(String),

    #[error("malformed manifest: {0}")]
    ManifestInvalid(String),

    #[error("unrecognized snapshot schema version {found} (supported: {supported})")]
    SchemaVersionUnsupported { found: u32, supported: u32 },

    #[error("checksum mismatch for {file}: manifest {expected}, computed {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("snapshot generation cancelled")]
    Cancelled,
}

impl SnapshotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SnapshotError::Db(e) => e.kind(),
            SnapshotError::Replication(e) => e.kind(),
            SnapshotError::Postgres(e) if steep_db::is_network_error(e) => ErrorKind::Unavailable,
            SnapshotError::Postgres(_) | SnapshotError::Io { .. } => ErrorKind::Internal,
            SnapshotError::ManifestNotFound(_) => ErrorKind::NotFound,
            SnapshotError::ManifestInvalid(_) | SnapshotError::SchemaVersionUnsupported { .. } => {
                ErrorKind::InvalidArgument
            }
            SnapshotError::ChecksumMismatch { .. } => ErrorKind::DataLoss,
            SnapshotError::Cancelled => ErrorKind::Canceled,
        }
    }
}

pub(crate) fn io_error(path: &std::path::Path, source: std::io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.display().to_string(),
        source,
    }
}
