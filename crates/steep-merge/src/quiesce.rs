//! Write quiescing for the merge window.
//!
//! Writes are blocked on both nodes by statement-level reject triggers
//! installed for the merge duration, plus an advisory lock serializing
//! merges. Merge sessions are exempted through a pid registry: the local
//! merge connection registers its own backend pid, and the peer registers
//! the pid of the fdw connection (read through a foreign view), so the
//! engine's own writes pass while every other session is refused.

use tokio_postgres::GenericClient;
use tracing::{info, warn};

use crate::{MergeError, MergeTable, quote_ident};

/// Advisory lock key serializing merges per database.
/// `fnv1a_64(b"steep_repl_merge")`.
pub const MERGE_LOCK_KEY: i64 = 4514367905377678243;

const QUIESCE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS steep_repl.merge_writers (
    pid integer PRIMARY KEY,
    registered_at timestamptz NOT NULL DEFAULT now()
);

CREATE OR REPLACE FUNCTION steep_repl.reject_writes() RETURNS trigger AS $$
BEGIN
    IF EXISTS (SELECT 1 FROM steep_repl.merge_writers WHERE pid = pg_backend_pid()) THEN
        RETURN NULL;
    END IF;
    RAISE EXCEPTION 'writes are quiesced for a steep-repl merge'
        USING ERRCODE = 'read_only_sql_transaction';
END;
$$ LANGUAGE plpgsql;

CREATE OR REPLACE VIEW steep_repl.merge_backend_pid AS SELECT pg_backend_pid() AS pid;
";

/// Installs the quiesce support objects (writer registry, reject trigger
/// function, backend-pid view) on one node. Idempotent; runs before the
/// fdw import so the pid view can be mirrored.
pub async fn install_support<C: GenericClient>(client: &C) -> Result<(), MergeError> {
    client.batch_execute(QUIESCE_SQL).await?;
    Ok(())
}

/// Holds the quiesce state on one node; dropped state is restored by
/// [`QuiesceGuard::release`], which cleanup paths call unconditionally.
pub struct QuiesceGuard {
    tables: Vec<(String, String)>,
}

impl QuiesceGuard {
    /// Quiesces writes on one node within `timeout_ms`.
    ///
    /// Trigger installation needs a short-lived exclusive lock per table;
    /// `lock_timeout` bounds the wait so a long-running writer fails the
    /// quiesce instead of stalling it, and the advisory lock refuses
    /// concurrent merges outright.
    pub async fn acquire<C: GenericClient>(
        client: &C,
        tables: &[MergeTable],
        exempt_pids: &[i32],
        timeout_ms: u64,
    ) -> Result<Self, MergeError> {
        let locked: bool = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&MERGE_LOCK_KEY])
            .await?
            .get(0);
        if !locked {
            return Err(MergeError::QuiesceTimeout { timeout_ms });
        }

        client
            .execute("DELETE FROM steep_repl.merge_writers", &[])
            .await?;
        for pid in exempt_pids {
            client
                .execute(
                    "INSERT INTO steep_repl.merge_writers (pid) VALUES ($1)
                     ON CONFLICT (pid) DO NOTHING",
                    &[pid],
                )
                .await?;
        }

        client
            .batch_execute(&format!("SET lock_timeout = {timeout_ms}"))
            .await?;
        let mut installed = Vec::new();
        for table in tables {
            let result = client
                .batch_execute(&format!(
                    "CREATE TRIGGER steep_quiesce BEFORE INSERT OR UPDATE OR DELETE
                     ON {schema}.{table} FOR EACH STATEMENT
                     EXECUTE FUNCTION steep_repl.reject_writes()",
                    schema = quote_ident(&table.schema),
                    table = quote_ident(&table.name),
                ))
                .await;
            match result {
                Ok(()) => installed.push((table.schema.clone(), table.name.clone())),
                Err(e) => {
                    warn!(table = %table.qualified_key(), error = %e, "quiesce trigger install failed");
                    let guard = Self { tables: installed };
                    guard.release(client).await;
                    return Err(MergeError::QuiesceTimeout { timeout_ms });
                }
            }
        }
        client.batch_execute("SET lock_timeout = 0").await?;
        info!(tables = tables.len(), "writes quiesced");
        Ok(Self { tables: installed })
    }

    /// Removes the reject triggers, clears the writer registry, and
    /// releases the advisory lock. Best-effort: failures are logged, not
    /// propagated, so every cleanup path can call it.
    pub async fn release<C: GenericClient>(&self, client: &C) {
        for (schema, table) in &self.tables {
            let statement = format!(
                "DROP TRIGGER IF EXISTS steep_quiesce ON {}.{}",
                quote_ident(schema),
                quote_ident(table)
            );
            if let Err(e) = client.batch_execute(&statement).await {
                warn!(table = %format!("{schema}.{table}"), error = %e, "failed to drop quiesce trigger");
            }
        }
        if let Err(e) = client
            .execute("DELETE FROM steep_repl.merge_writers", &[])
            .await
        {
            warn!(error = %e, "failed to clear merge writer registry");
        }
        if let Err(e) = client
            .execute("SELECT pg_advisory_unlock($1)", &[&MERGE_LOCK_KEY])
            .await
        {
            warn!(error = %e, "failed to release merge advisory lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fnv1a_64;

    #[test]
    fn lock_key_is_the_documented_hash() {
        assert_eq!(fnv1a_64(b"steep_repl_merge"), MERGE_LOCK_KEY);
    }
}
