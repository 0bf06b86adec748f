//! Catch-up and bulk-copy observation on the target node.

use tokio_postgres::GenericClient;

use steep_types::Lsn;

use crate::ReplicationError;

/// One table's server-side COPY progress during initial sync, from
/// `pg_stat_progress_copy` joined to `pg_subscription_rel`.
#[derive(Debug, Clone)]
pub struct CopyTableProgress {
    pub schema_name: String,
    pub table_name: String,
    pub tuples_processed: i64,
    pub bytes_processed: i64,
    /// Planner estimate for the relation, for percent derivation.
    pub estimated_tuples: i64,
}

/// Read-only views over subscription state.
pub struct SubscriptionMonitor;

impl SubscriptionMonitor {
    /// Per-table COPY progress for a subscription's initial sync workers.
    pub async fn copy_progress<C: GenericClient>(
        client: &C,
        subscription: &str,
    ) -> Result<Vec<CopyTableProgress>, ReplicationError> {
        let rows = client
            .query(
                "SELECT n.nspname AS schema_name,
                        c.relname AS table_name,
                        p.tuples_processed,
                        p.bytes_processed,
                        GREATEST(c.reltuples::int8, 0) AS estimated_tuples
                 FROM pg_stat_progress_copy p
                 JOIN pg_class c ON c.oid = p.relid
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 JOIN pg_subscription_rel sr ON sr.srrelid = p.relid
                 JOIN pg_subscription s ON s.oid = sr.srsubid
                 WHERE s.subname = $1",
                &[&subscription],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| CopyTableProgress {
                schema_name: row.get("schema_name"),
                table_name: row.get("table_name"),
                tuples_processed: row.get("tuples_processed"),
                bytes_processed: row.get("bytes_processed"),
                estimated_tuples: row.get("estimated_tuples"),
            })
            .collect())
    }

    /// Counts of (total, ready) tables in the subscription.
    pub async fn table_sync_state<C: GenericClient>(
        client: &C,
        subscription: &str,
    ) -> Result<(i64, i64), ReplicationError> {
        let row = client
            .query_one(
                "SELECT count(*) AS total,
                        count(*) FILTER (WHERE sr.srsubstate = 'r') AS ready
                 FROM pg_subscription_rel sr
                 JOIN pg_subscription s ON s.oid = sr.srsubid
                 WHERE s.subname = $1",
                &[&subscription],
            )
            .await?;
        Ok((row.get("total"), row.get("ready")))
    }

    /// The latest WAL position the apply worker has received.
    pub async fn received_lsn<C: GenericClient>(
        client: &C,
        subscription: &str,
    ) -> Result<Option<Lsn>, ReplicationError> {
        let row = client
            .query_opt(
                "SELECT latest_end_lsn::text AS lsn
                 FROM pg_stat_subscription
                 WHERE subname = $1 AND latest_end_lsn IS NOT NULL",
                &[&subscription],
            )
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let text: String = row.get("lsn");
                let lsn = text
                    .parse()
                    .map_err(|_| ReplicationError::MalformedLsn(text))?;
                Ok(Some(lsn))
            }
        }
    }

    /// Current WAL write position on a source node.
    pub async fn current_wal_lsn<C: GenericClient>(client: &C) -> Result<Lsn, ReplicationError> {
        let row = client
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await?;
        let text: String = row.get(0);
        text.parse()
            .map_err(|_| ReplicationError::MalformedLsn(text))
    }

    /// Estimated total tuples across every user table, for copy percent.
    pub async fn estimated_total_tuples<C: GenericClient>(
        client: &C,
    ) -> Result<i64, ReplicationError> {
        let row = client
            .query_one(
                "SELECT COALESCE(sum(GREATEST(c.reltuples::int8, 0)), 0)::int8
                 FROM pg_class c
                 JOIN pg_namespace n ON n.oid = c.relnamespace
                 WHERE c.relkind = 'r'
                   AND n.nspname NOT IN ('pg_catalog', 'information_schema', 'steep_repl')",
                &[],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Server version check: the control plane requires PostgreSQL 18.
    pub async fn server_version_num<C: GenericClient>(client: &C) -> Result<i32, ReplicationError> {
        let row = client
            .query_one("SELECT current_setting('server_version_num')::int4", &[])
            .await?;
        Ok(row.get(0))
    }
}
