//! The postgres_fdw bridge to the peer.
//!
//! The local node carries a foreign server named after the peer, a user
//! mapping, full foreign mirrors of the participating tables (for
//! transfers), and foreign tables over peer-side hash views (for overlap
//! analysis, so only primary keys and 8-byte hashes cross the wire).

use tokio_postgres::GenericClient;
use tracing::info;

use steep_types::{ConflictStrategy, NodeId};

use crate::{
    MergeError, MergeTable, PeerEndpoint, quote_ident, row_hash::encoded_row_expr,
    sanitize_identifier,
};

/// Local schema holding full foreign mirrors for one remote schema.
pub fn mirror_schema_name(remote_schema: &str) -> String {
    format!("steep_fdw_{}", sanitize_identifier(remote_schema))
}

/// Local schema holding the imported hash views.
pub const HASH_SCHEMA: &str = "steep_fdw_hash";

/// Foreign server named after the peer.
pub fn foreign_server_name(peer: &NodeId) -> String {
    let mut name = format!("steep_peer_{}", sanitize_identifier(peer.as_str()));
    name.truncate(63);
    name
}

/// Peer-side hash view for one table.
pub fn hash_view_name(table: &MergeTable) -> String {
    let mut name = format!(
        "merge_h_{}_{}",
        sanitize_identifier(&table.schema),
        sanitize_identifier(&table.name)
    );
    name.truncate(63);
    name
}

/// Sets up and tears down the fdw plumbing for one merge.
pub struct FdwBridge {
    pub server: String,
}

impl FdwBridge {
    /// Creates (or recreates, if stale) the foreign server and user
    /// mapping on the local node.
    pub async fn create<C: GenericClient>(
        local: &C,
        peer_id: &NodeId,
        endpoint: &PeerEndpoint,
    ) -> Result<Self, MergeError> {
        let server = foreign_server_name(peer_id);
        local
            .batch_execute("CREATE EXTENSION IF NOT EXISTS postgres_fdw")
            .await?;
        // Drop-and-recreate keeps stale endpoints from lingering.
        local
            .batch_execute(&format!("DROP SERVER IF EXISTS {server} CASCADE"))
            .await?;
        local
            .batch_execute(&format!(
                "CREATE SERVER {server} FOREIGN DATA WRAPPER postgres_fdw
                 OPTIONS (host {host}, port {port}, dbname {dbname})",
                host = literal(&endpoint.host),
                port = literal(&endpoint.port.to_string()),
                dbname = literal(&endpoint.dbname),
            ))
            .await?;
        let mut mapping_options = format!("user {}", literal(&endpoint.user));
        if let Some(password) = &endpoint.password {
            mapping_options.push_str(&format!(", password {}", literal(password)));
        }
        local
            .batch_execute(&format!(
                "CREATE USER MAPPING FOR CURRENT_USER SERVER {server} OPTIONS ({mapping_options})"
            ))
            .await?;
        info!(server = %server, "created foreign server for peer");
        Ok(Self { server })
    }

    /// Installs the hash function and per-table hash views on the peer,
    /// then imports mirrors and hash views locally.
    pub async fn prepare_tables<L, P>(
        &self,
        local: &L,
        peer: &P,
        tables: &[MergeTable],
        strategy: ConflictStrategy,
    ) -> Result<(), MergeError>
    where
        L: GenericClient,
        P: GenericClient,
    {
        peer.batch_execute(crate::FNV1A_64_SQL).await?;
        local.batch_execute(crate::FNV1A_64_SQL).await?;

        // Peer-side hash views: pk columns + row hash (+ commit timestamp
        // when the strategy needs it; the column errors if the setting is
        // off, which pre-flight has already ruled out).
        for table in tables {
            let pk_list: Vec<String> = table
                .primary_key
                .iter()
                .map(|c| format!("t.{}", quote_ident(c)))
                .collect();
            let committed = if strategy == ConflictStrategy::LastModified {
                ", pg_xact_commit_timestamp(t.xmin) AS committed_at"
            } else {
                ", NULL::timestamptz AS committed_at"
            };
            peer.batch_execute(&format!(
                "CREATE OR REPLACE VIEW steep_repl.{view} AS
                 SELECT {pks}, steep_repl.fnv1a_64({expr}) AS row_hash{committed}
                 FROM {schema}.{table} t",
                view = hash_view_name(table),
                pks = pk_list.join(", "),
                expr = encoded_row_expr(&table.columns, &table.primary_key, "t"),
                schema = quote_ident(&table.schema),
                table = quote_ident(&table.name),
            ))
            .await?;
        }

        // Import hash views into one local schema, plus the peer's
        // backend-pid view so quiescing can exempt the fdw session.
        let mut view_list: Vec<String> = tables.iter().map(|t| hash_view_name(t)).collect();
        view_list.push("merge_backend_pid".to_string());
        local
            .batch_execute(&format!(
                "DROP SCHEMA IF EXISTS {HASH_SCHEMA} CASCADE;
                 CREATE SCHEMA {HASH_SCHEMA};
                 IMPORT FOREIGN SCHEMA steep_repl LIMIT TO ({views})
                 FROM SERVER {server} INTO {HASH_SCHEMA}",
                views = view_list.join(", "),
                server = self.server,
            ))
            .await?;

        // Import full mirrors per remote schema for the transfer phase.
        let mut schemas: Vec<&str> = tables.iter().map(|t| t.schema.as_str()).collect();
        schemas.sort_unstable();
        schemas.dedup();
        for schema in schemas {
            let mirror = mirror_schema_name(schema);
            let table_list: Vec<String> = tables
                .iter()
                .filter(|t| t.schema == schema)
                .map(|t| quote_ident(&t.name))
                .collect();
            local
                .batch_execute(&format!(
                    "DROP SCHEMA IF EXISTS {mirror} CASCADE;
                     CREATE SCHEMA {mirror};
                     IMPORT FOREIGN SCHEMA {remote} LIMIT TO ({list})
                     FROM SERVER {server} INTO {mirror}",
                    remote = quote_ident(schema),
                    list = table_list.join(", "),
                    server = self.server,
                ))
                .await?;
        }
        Ok(())
    }

    /// Drops everything the bridge created, on both sides.
    pub async fn teardown<L, P>(
        &self,
        local: &L,
        peer: &P,
        tables: &[MergeTable],
    ) -> Result<(), MergeError>
    where
        L: GenericClient,
        P: GenericClient,
    {
        for table in tables {
            peer.batch_execute(&format!(
                "DROP VIEW IF EXISTS steep_repl.{}",
                hash_view_name(table)
            ))
            .await?;
        }
        let mut statements = vec![format!("DROP SCHEMA IF EXISTS {HASH_SCHEMA} CASCADE")];
        let mut schemas: Vec<&str> = tables.iter().map(|t| t.schema.as_str()).collect();
        schemas.sort_unstable();
        schemas.dedup();
        for schema in schemas {
            statements.push(format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                mirror_schema_name(schema)
            ));
        }
        statements.push(format!("DROP SERVER IF EXISTS {} CASCADE", self.server));
        local.batch_execute(&statements.join(";\n")).await?;
        Ok(())
    }
}

fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_and_view_names_sanitized() {
        assert_eq!(
            foreign_server_name(&NodeId::new("Node.B")),
            "steep_peer_node_b"
        );
        let table = MergeTable {
            schema: "public".to_string(),
            name: "Order-Items".to_string(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            references: Vec::new(),
        };
        assert_eq!(hash_view_name(&table), "merge_h_public_order_items");
    }

    #[test]
    fn mirror_schema_per_remote_schema() {
        assert_eq!(mirror_schema_name("public"), "steep_fdw_public");
        assert_eq!(mirror_schema_name("Sales"), "steep_fdw_sales");
    }
}
