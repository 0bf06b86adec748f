//! Database layer errors.

use steep_types::ErrorKind;

/// Errors surfaced by the database access layer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database pool unavailable: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("could not connect after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: tokio_postgres::Error,
    },

    #[error("work queue entry {0} not found")]
    WorkEntryNotFound(i64),

    #[error("malformed row in {table}: {detail}")]
    MalformedRow { table: &'static str, detail: String },
}

impl DbError {
    /// Maps onto the control-plane status taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DbError::Pool(_) | DbError::RetriesExhausted { .. } => ErrorKind::Unavailable,
            DbError::Postgres(e) if crate::is_network_error(e) => ErrorKind::Unavailable,
            DbError::WorkEntryNotFound(_) => ErrorKind::NotFound,
            DbError::Postgres(_) | DbError::MalformedRow { .. } => ErrorKind::Internal,
        }
    }
}
