//! Subscription lifecycle on the target node.

use tokio_postgres::GenericClient;
use tracing::{info, warn};

use steep_types::{NodeId, OriginPolicy};

use crate::{
    PUBLICATION, ReplicationError, is_duplicate_object, is_undefined_object, quote_literal,
};

/// Subscription name on a target replicating from `source`.
///
/// Same sanitization rules as slot names, under the `steep_sub_` prefix.
pub fn subscription_name(source: &NodeId) -> String {
    let slot = source.init_slot_name();
    let sanitized = slot.trim_start_matches("steep_init_");
    let mut name = format!("steep_sub_{sanitized}");
    name.truncate(63);
    name
}

/// Subscription operations, executed against the target node.
pub struct SubscriptionManager;

impl SubscriptionManager {
    /// Ensures the standing publication exists on a source node.
    pub async fn ensure_publication<C: GenericClient>(client: &C) -> Result<(), ReplicationError> {
        let result = client
            .batch_execute(&format!("CREATE PUBLICATION {PUBLICATION} FOR ALL TABLES"))
            .await;
        match result {
            Ok(()) => {
                info!(publication = PUBLICATION, "created publication");
                Ok(())
            }
            Err(e) if is_duplicate_object(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Creates a subscription consuming an already-prepared slot.
    ///
    /// `create_slot = false` keeps slot ownership with this daemon: the
    /// caller created the slot and remains responsible for dropping it.
    pub async fn create<C: GenericClient>(
        client: &C,
        source: &NodeId,
        source_conninfo: &str,
        slot_name: &str,
        origin: OriginPolicy,
    ) -> Result<String, ReplicationError> {
        let name = subscription_name(source);
        let statement = format!(
            "CREATE SUBSCRIPTION {name} CONNECTION {conninfo} PUBLICATION {PUBLICATION} \
             WITH (create_slot = false, slot_name = {slot}, copy_data = {copy_data}, \
                   origin = {origin}, enabled = true)",
            conninfo = quote_literal(source_conninfo),
            slot = quote_literal(slot_name),
            copy_data = origin.copy_data(),
            origin = quote_literal(origin.origin_option()),
        );
        client.batch_execute(&statement).await.map_err(|e| {
            if is_duplicate_object(&e) {
                ReplicationError::SubscriptionExists(name.clone())
            } else {
                ReplicationError::Postgres(e)
            }
        })?;
        info!(subscription = %name, slot = %slot_name, origin = origin.origin_option(), "created subscription");
        Ok(name)
    }

    /// Drops a subscription without touching the source slot.
    ///
    /// The slot is detached first (`slot_name = NONE`) because DROP
    /// SUBSCRIPTION would otherwise try to drop it on the source; the slot
    /// belongs to this daemon's cleanup path. Absent subscriptions are
    /// ignored so cancellation can run unconditionally.
    pub async fn drop_if_exists<C: GenericClient>(
        client: &C,
        subscription: &str,
    ) -> Result<bool, ReplicationError> {
        for statement in [
            format!("ALTER SUBSCRIPTION {subscription} DISABLE"),
            format!("ALTER SUBSCRIPTION {subscription} SET (slot_name = NONE)"),
            format!("DROP SUBSCRIPTION {subscription}"),
        ] {
            match client.batch_execute(&statement).await {
                Ok(()) => {}
                Err(e) if is_undefined_object(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        info!(subscription = %subscription, "dropped subscription");
        Ok(true)
    }

    /// Whether a subscription exists on this node.
    pub async fn exists<C: GenericClient>(
        client: &C,
        subscription: &str,
    ) -> Result<bool, ReplicationError> {
        let row = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_subscription WHERE subname = $1)",
                &[&subscription],
            )
            .await?;
        Ok(row.get(0))
    }

    /// Re-copies a table subset: the named tables are dropped from and
    /// re-added to the source publication, then the subscription refreshes
    /// with `copy_data = true`. Used by partial reinit.
    pub async fn refresh_tables<Src, Tgt>(
        source_client: &Src,
        target_client: &Tgt,
        subscription: &str,
        tables: &[String],
    ) -> Result<(), ReplicationError>
    where
        Src: GenericClient,
        Tgt: GenericClient,
    {
        for table in tables {
            // A table absent from the publication is fine; FOR ALL TABLES
            // publications reject per-table DROP anyway.
            let drop = format!("ALTER PUBLICATION {PUBLICATION} DROP TABLE {table}");
            let _ = source_client.batch_execute(&drop).await;
            source_client
                .batch_execute(&format!("ALTER PUBLICATION {PUBLICATION} ADD TABLE {table}"))
                .await?;
        }
        target_client
            .batch_execute(&format!(
                "ALTER SUBSCRIPTION {subscription} REFRESH PUBLICATION WITH (copy_data = true)"
            ))
            .await?;
        warn!(subscription = %subscription, tables = tables.len(), "re-copying table subset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_name_mirrors_slot_sanitization() {
        assert_eq!(
            subscription_name(&NodeId::new("node-a")),
            "steep_sub_node_a"
        );
        assert_eq!(
            subscription_name(&NodeId::new("Node.West:1")),
            "steep_sub_node_west_1"
        );
    }

    #[test]
    fn subscription_name_fits_identifier_limit() {
        let name = subscription_name(&NodeId::new("y".repeat(200)));
        assert!(name.len() <= 63);
    }
}
