//! Logical replication slot lifecycle on the source node.

use chrono::{DateTime, Utc};
use tokio_postgres::GenericClient;
use tracing::info;

use steep_types::{Lsn, NodeId};

use crate::{ReplicationError, is_duplicate_object};

/// Output plugin used for every slot.
const OUTPUT_PLUGIN: &str = "pgoutput";

/// A slot created on the source, with the consistent-point LSN returned
/// at creation. The LSN strictly precedes any WAL received through the
/// associated subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSlot {
    pub slot_name: String,
    pub lsn: Lsn,
}

/// Slot operations, executed against the node that will serve the WAL.
pub struct SlotManager;

impl SlotManager {
    /// Creates a logical slot, returning its name and consistent point.
    ///
    /// `slot_name` defaults to the target node's `steep_init_*` name.
    pub async fn create<C: GenericClient>(
        client: &C,
        for_node: &NodeId,
        slot_name: Option<&str>,
    ) -> Result<PreparedSlot, ReplicationError> {
        let name = slot_name
            .map(str::to_string)
            .unwrap_or_else(|| for_node.init_slot_name());
        let row = client
            .query_one(
                "SELECT lsn::text FROM pg_create_logical_replication_slot($1, $2)",
                &[&name, &OUTPUT_PLUGIN],
            )
            .await
            .map_err(|e| {
                if is_duplicate_object(&e) {
                    ReplicationError::SlotExists(name.clone())
                } else {
                    ReplicationError::Postgres(e)
                }
            })?;
        let lsn_text: String = row.get(0);
        let lsn = lsn_text
            .parse()
            .map_err(|_| ReplicationError::MalformedLsn(lsn_text))?;
        info!(slot = %name, %lsn, "created replication slot");
        Ok(PreparedSlot {
            slot_name: name,
            lsn,
        })
    }

    /// Drops a slot if it exists. Dropping an absent slot is not an error:
    /// cleanup paths run unconditionally.
    pub async fn drop_if_exists<C: GenericClient>(
        client: &C,
        slot_name: &str,
    ) -> Result<bool, ReplicationError> {
        // Active slots must lose their walsender first or the drop blocks.
        client
            .execute(
                "SELECT pg_terminate_backend(active_pid)
                 FROM pg_replication_slots
                 WHERE slot_name = $1 AND active_pid IS NOT NULL",
                &[&slot_name],
            )
            .await?;
        let dropped = client
            .execute(
                "SELECT pg_drop_replication_slot(slot_name)
                 FROM pg_replication_slots
                 WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?;
        if dropped > 0 {
            info!(slot = %slot_name, "dropped replication slot");
        }
        Ok(dropped > 0)
    }

    /// Whether a slot exists on this node.
    pub async fn exists<C: GenericClient>(
        client: &C,
        slot_name: &str,
    ) -> Result<bool, ReplicationError> {
        let row = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
                &[&slot_name],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Records a prepared slot for the manual init workflow, with expiry.
    pub async fn record_init_slot<C: GenericClient>(
        client: &C,
        slot: &PreparedSlot,
        source_node: &NodeId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), ReplicationError> {
        client
            .execute(
                "INSERT INTO steep_repl.init_slots (slot_name, node_id, lsn, expires_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (slot_name) DO UPDATE SET
                     lsn = EXCLUDED.lsn,
                     created_at = now(),
                     expires_at = EXCLUDED.expires_at,
                     used_by_node = NULL,
                     used_at = NULL",
                &[
                    &slot.slot_name,
                    &source_node.as_str(),
                    &slot.lsn.to_string(),
                    &expires_at,
                ],
            )
            .await?;
        Ok(())
    }

    /// Looks up a recorded init slot and marks it consumed by `target`.
    /// A slot is consumed exactly once.
    pub async fn consume_init_slot<C: GenericClient>(
        client: &C,
        slot_name: &str,
        target: &NodeId,
    ) -> Result<PreparedSlot, ReplicationError> {
        let row = client
            .query_opt(
                "UPDATE steep_repl.init_slots
                 SET used_by_node = $2, used_at = now()
                 WHERE slot_name = $1 AND used_at IS NULL
                 RETURNING lsn",
                &[&slot_name, &target.as_str()],
            )
            .await?
            .ok_or_else(|| ReplicationError::SlotNotFound(slot_name.to_string()))?;
        let lsn_text: String = row.get(0);
        let lsn = lsn_text
            .parse()
            .map_err(|_| ReplicationError::MalformedLsn(lsn_text))?;
        Ok(PreparedSlot {
            slot_name: slot_name.to_string(),
            lsn,
        })
    }

    /// Removes the registry row for a slot (after the slot itself is gone).
    pub async fn forget_init_slot<C: GenericClient>(
        client: &C,
        slot_name: &str,
    ) -> Result<(), ReplicationError> {
        client
            .execute(
                "DELETE FROM steep_repl.init_slots WHERE slot_name = $1",
                &[&slot_name],
            )
            .await?;
        Ok(())
    }
}
