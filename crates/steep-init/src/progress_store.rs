//! Durable init progress rows, mirrored from the progress bus.

use tokio_postgres::GenericClient;

use steep_types::{NodeId, ProgressUpdate};

use crate::InitError;

/// SQL access to `steep_repl.init_progress`. Rows are created on
/// Preparing entry, mutated by the executing pipeline, and destroyed on
/// reset to Uninitialized.
pub struct InitProgressStore;

impl InitProgressStore {
    /// Creates (or resets) the row for a starting init.
    pub async fn create<C: GenericClient>(
        client: &C,
        node_id: &NodeId,
        parallel_workers: i32,
    ) -> Result<(), InitError> {
        client
            .execute(
                "INSERT INTO steep_repl.init_progress (node_id, phase, parallel_workers)
                 VALUES ($1, 'preparing', $2)
                 ON CONFLICT (node_id) DO UPDATE SET
                     phase = 'preparing',
                     overall_percent = 0,
                     tables_total = 0,
                     tables_completed = 0,
                     current_table = NULL,
                     current_table_percent = 0,
                     rows_copied = 0,
                     bytes_copied = 0,
                     throughput_rows_sec = 0,
                     started_at = now(),
                     eta_seconds = NULL,
                     updated_at = now(),
                     parallel_workers = EXCLUDED.parallel_workers,
                     error_message = NULL",
                &[&node_id.as_str(), &parallel_workers],
            )
            .await
            .map_err(steep_db::DbError::from)?;
        Ok(())
    }

    /// Mirrors one bus update into the durable row.
    pub async fn record<C: GenericClient>(
        client: &C,
        update: &ProgressUpdate,
    ) -> Result<(), InitError> {
        client
            .execute(
                "UPDATE steep_repl.init_progress SET
                     phase = $2,
                     overall_percent = $3,
                     tables_total = $4,
                     tables_completed = $5,
                     current_table = $6,
                     current_table_percent = $7,
                     rows_copied = $8,
                     bytes_copied = $9,
                     throughput_rows_sec = $10,
                     eta_seconds = $11,
                     parallel_workers = $12,
                     error_message = $13,
                     updated_at = now()
                 WHERE node_id = $1",
                &[
                    &update.node_id.as_str(),
                    &update.phase.as_str(),
                    &update.overall_percent,
                    &update.tables_total,
                    &update.tables_completed,
                    &update.current_table,
                    &update.current_table_percent,
                    &update.rows_copied,
                    &update.bytes_copied,
                    &update.throughput_rows_sec,
                    &update.eta_seconds,
                    &update.parallel_workers,
                    &update.error_message,
                ],
            )
            .await
            .map_err(steep_db::DbError::from)?;
        Ok(())
    }

    /// Removes the row (reset to Uninitialized).
    pub async fn delete<C: GenericClient>(client: &C, node_id: &NodeId) -> Result<(), InitError> {
        client
            .execute(
                "DELETE FROM steep_repl.init_progress WHERE node_id = $1",
                &[&node_id.as_str()],
            )
            .await
            .map_err(steep_db::DbError::from)?;
        Ok(())
    }

    /// Marks every non-terminal row Failed. Runs once on daemon start: a
    /// live row without an in-memory operation means the daemon died
    /// mid-init.
    pub async fn fail_orphans<C: GenericClient>(client: &C) -> Result<u64, InitError> {
        let changed = client
            .execute(
                "UPDATE steep_repl.init_progress
                 SET phase = 'failed',
                     error_message = 'daemon restarted during init',
                     updated_at = now()
                 WHERE phase NOT IN ('complete', 'failed')",
                &[],
            )
            .await
            .map_err(steep_db::DbError::from)?;
        if changed > 0 {
            client
                .execute(
                    "UPDATE steep_repl.nodes
                     SET init_state = 'failed'
                     WHERE init_state NOT IN
                         ('uninitialized', 'synchronized', 'failed', 'diverged')",
                    &[],
                )
                .await
                .map_err(steep_db::DbError::from)?;
        }
        Ok(changed)
    }
}
