//! Connection pool construction and backoff-governed direct connects.

use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::{debug, warn};

use crate::DbError;

/// Backoff schedule for connection attempts: 1s base, doubled, capped at
/// 30s, at most 5 attempts. Only network-class failures are retried.
const RETRY_BASE: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(30);
const RETRY_MAX_ATTEMPTS: u32 = 5;

/// Pool sizing and lifetime settings.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub max_size: usize,
    pub connection_lifetime: Duration,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 16,
            connection_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(1800),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Shared handle to the daemon's connection pool.
///
/// The daemon that opened the pool owns it exclusively; everything else
/// borrows connections through [`Db::get`].
#[derive(Clone)]
pub struct Db {
    pool: Pool,
    conninfo: String,
}

impl Db {
    /// Builds a pool from a libpq-style conninfo string.
    pub fn open(conninfo: &str, options: &PoolOptions) -> Result<Self, DbError> {
        let pg_config: PgConfig = conninfo.parse()?;
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(pg_config, NoTls, manager_config);
        let pool = Pool::builder(manager)
            .max_size(options.max_size)
            .create_timeout(Some(RETRY_CAP))
            .recycle_timeout(Some(options.health_check_interval))
            .wait_timeout(Some(RETRY_CAP))
            .runtime(Runtime::Tokio1)
            .build()
            .expect("pool builder only fails on a zero max_size");
        Ok(Self {
            pool,
            conninfo: conninfo.to_string(),
        })
    }

    /// Borrows a pooled connection, blocking until one is available.
    pub async fn get(&self) -> Result<deadpool_postgres::Object, DbError> {
        Ok(self.pool.get().await?)
    }

    /// The conninfo string this pool was opened with.
    pub fn conninfo(&self) -> &str {
        &self.conninfo
    }

    /// Pool status for health reporting.
    pub fn status(&self) -> deadpool_postgres::Status {
        self.pool.status()
    }

    /// Tears the pool down; outstanding connections are dropped on return.
    pub fn close(&self) {
        self.pool.close();
    }
}

/// Classifies an error as network-class: refused, reset, aborted, timed
/// out, or name resolution. Server-reported errors are never retried.
pub fn is_network_error(error: &tokio_postgres::Error) -> bool {
    if error.as_db_error().is_some() {
        return false;
    }
    if error.is_closed() {
        return true;
    }
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
            ) || io.kind() == std::io::ErrorKind::Other;
        }
        source = inner.source();
    }
    // Timeouts raised by tokio-postgres itself carry no io source.
    error.to_string().contains("timed out")
}

/// Opens one dedicated (non-pooled) connection with exponential backoff.
///
/// Used for replication connections and LISTEN sessions, which cannot be
/// pooled. The spawned connection task drives the socket until the client
/// is dropped.
pub async fn connect_with_retry(conninfo: &str) -> Result<Client, DbError> {
    let mut delay = RETRY_BASE;
    let mut last_error: Option<tokio_postgres::Error> = None;

    for attempt in 1..=RETRY_MAX_ATTEMPTS {
        match tokio_postgres::connect(conninfo, NoTls).await {
            Ok((client, connection)) => {
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!(error = %e, "postgres connection task ended");
                    }
                });
                return Ok(client);
            }
            Err(e) if is_network_error(&e) && attempt < RETRY_MAX_ATTEMPTS => {
                warn!(attempt, delay_secs = delay.as_secs(), error = %e, "connect failed, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_CAP);
                last_error = Some(e);
            }
            Err(e) => {
                return Err(if is_network_error(&e) {
                    DbError::RetriesExhausted {
                        attempts: attempt,
                        last: e,
                    }
                } else {
                    DbError::Postgres(e)
                });
            }
        }
    }

    Err(DbError::RetriesExhausted {
        attempts: RETRY_MAX_ATTEMPTS,
        last: last_error.expect("loop always records an error before falling through"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_options_match_resource_model() {
        let options = PoolOptions::default();
        assert_eq!(options.connection_lifetime, Duration::from_secs(3600));
        assert_eq!(options.idle_timeout, Duration::from_secs(1800));
        assert_eq!(options.health_check_interval, Duration::from_secs(30));
    }

    #[test]
    fn open_rejects_malformed_conninfo() {
        let result = Db::open("host=localhost port=not-a-number", &PoolOptions::default());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connect_with_retry_gives_up_on_bad_config() {
        // A parse failure is not network-class, so no retries happen.
        let result = connect_with_retry("definitely not conninfo").await;
        assert!(matches!(result, Err(DbError::Postgres(_))));
    }
}
