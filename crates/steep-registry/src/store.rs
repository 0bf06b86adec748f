//! SQL-backed registry over `steep_repl.nodes`.

use chrono::{DateTime, Utc};
use tokio_postgres::GenericClient;
use tracing::info;

use steep_types::{ErrorKind, InitState, NodeId, NodeStatus};

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Db(#[from] steep_db::DbError),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("invalid priority {0}: must be within 1..=100")]
    InvalidPriority(i32),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Db(e) => e.kind(),
            RegistryError::Postgres(_) => ErrorKind::Internal,
            RegistryError::UnknownNode(_) => ErrorKind::NotFound,
            RegistryError::InvalidPriority(_) => ErrorKind::InvalidArgument,
        }
    }
}

/// One registry row.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: NodeId,
    pub node_name: String,
    pub host: String,
    pub port: u16,
    pub rpc_host: Option<String>,
    pub rpc_port: Option<u16>,
    pub priority: i32,
    pub is_coordinator: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub status: NodeStatus,
    pub init_state: InitState,
    pub init_source_node: Option<NodeId>,
    pub init_started_at: Option<DateTime<Utc>>,
    pub init_completed_at: Option<DateTime<Utc>>,
}

impl Node {
    fn from_row(row: &tokio_postgres::Row) -> Result<Self, RegistryError> {
        let status_raw: String = row.get("status");
        let init_state_raw: String = row.get("init_state");
        let status = NodeStatus::parse(&status_raw).ok_or_else(|| steep_db::DbError::MalformedRow {
            table: "nodes",
            detail: format!("unknown status {status_raw:?}"),
        })?;
        let init_state =
            InitState::parse(&init_state_raw).ok_or_else(|| steep_db::DbError::MalformedRow {
                table: "nodes",
                detail: format!("unknown init_state {init_state_raw:?}"),
            })?;
        Ok(Self {
            node_id: NodeId::new(row.get::<_, String>("node_id")),
            node_name: row.get("node_name"),
            host: row.get("host"),
            port: row.get::<_, i32>("port") as u16,
            rpc_host: row.get("rpc_host"),
            rpc_port: row.get::<_, Option<i32>>("rpc_port").map(|p| p as u16),
            priority: row.get("priority"),
            is_coordinator: row.get("is_coordinator"),
            last_seen: row.get("last_seen"),
            status,
            init_state,
            init_source_node: row
                .get::<_, Option<String>>("init_source_node")
                .map(NodeId::new),
            init_started_at: row.get("init_started_at"),
            init_completed_at: row.get("init_completed_at"),
        })
    }
}

/// Operations over the registry table.
pub struct RegistryStore;

impl RegistryStore {
    /// Registers or updates a node. Upserts by `node_id`; a NULL host on
    /// update preserves the existing value.
    pub async fn register<C: GenericClient>(
        client: &C,
        node_id: &NodeId,
        node_name: &str,
        host: &str,
        port: u16,
        priority: i32,
    ) -> Result<Node, RegistryError> {
        if !(1..=100).contains(&priority) {
            return Err(RegistryError::InvalidPriority(priority));
        }
        let row = client
            .query_one(
                "INSERT INTO steep_repl.nodes (node_id, node_name, host, port, priority, last_seen)
                 VALUES ($1, $2, $3, $4, $5, now())
                 ON CONFLICT (node_id) DO UPDATE SET
                     node_name = EXCLUDED.node_name,
                     host = COALESCE(NULLIF(EXCLUDED.host, ''), steep_repl.nodes.host),
                     port = EXCLUDED.port,
                     priority = EXCLUDED.priority,
                     last_seen = now()
                 RETURNING *",
                &[
                    &node_id.as_str(),
                    &node_name,
                    &host,
                    &i32::from(port),
                    &priority,
                ],
            )
            .await?;
        info!(node = %node_id, "registered node");
        Node::from_row(&row)
    }

    /// Records a heartbeat: refreshes `last_seen` and restores healthy
    /// status. Returns the current coordinator, if any.
    pub async fn heartbeat<C: GenericClient>(
        client: &C,
        node_id: &NodeId,
    ) -> Result<Option<NodeId>, RegistryError> {
        let updated = client
            .execute(
                "UPDATE steep_repl.nodes
                 SET last_seen = now(), status = 'healthy'
                 WHERE node_id = $1",
                &[&node_id.as_str()],
            )
            .await?;
        if updated == 0 {
            return Err(RegistryError::UnknownNode(node_id.clone()));
        }
        let coordinator = client
            .query_opt(
                "SELECT node_id FROM steep_repl.nodes WHERE is_coordinator LIMIT 1",
                &[],
            )
            .await?;
        Ok(coordinator.map(|row| NodeId::new(row.get::<_, String>("node_id"))))
    }

    /// Lists nodes, optionally filtered by status.
    pub async fn get_nodes<C: GenericClient>(
        client: &C,
        status_filter: Option<NodeStatus>,
    ) -> Result<Vec<Node>, RegistryError> {
        let filter = status_filter.map(NodeStatus::as_str);
        let rows = client
            .query(
                "SELECT * FROM steep_repl.nodes
                 WHERE $1::text IS NULL OR status = $1
                 ORDER BY node_id",
                &[&filter],
            )
            .await?;
        rows.iter().map(Node::from_row).collect()
    }

    /// Fetches one node.
    pub async fn get<C: GenericClient>(
        client: &C,
        node_id: &NodeId,
    ) -> Result<Option<Node>, RegistryError> {
        let row = client
            .query_opt(
                "SELECT * FROM steep_repl.nodes WHERE node_id = $1",
                &[&node_id.as_str()],
            )
            .await?;
        row.as_ref().map(Node::from_row).transpose()
    }

    /// COALESCE-merges a full peer record into the local mirror, letting
    /// this daemon learn init-state transitions that happened elsewhere.
    /// Empty strings and NULLs in the pushed record preserve local values.
    pub async fn sync_metadata<C: GenericClient>(
        client: &C,
        node: &Node,
    ) -> Result<(), RegistryError> {
        client
            .execute(
                "INSERT INTO steep_repl.nodes
                     (node_id, node_name, host, port, priority, last_seen, status,
                      init_state, init_source_node, init_started_at, init_completed_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 ON CONFLICT (node_id) DO UPDATE SET
                     node_name = COALESCE(NULLIF(EXCLUDED.node_name, ''), steep_repl.nodes.node_name),
                     host = COALESCE(NULLIF(EXCLUDED.host, ''), steep_repl.nodes.host),
                     port = EXCLUDED.port,
                     priority = EXCLUDED.priority,
                     last_seen = GREATEST(EXCLUDED.last_seen, steep_repl.nodes.last_seen),
                     status = EXCLUDED.status,
                     init_state = EXCLUDED.init_state,
                     init_source_node = COALESCE(EXCLUDED.init_source_node, steep_repl.nodes.init_source_node),
                     init_started_at = COALESCE(EXCLUDED.init_started_at, steep_repl.nodes.init_started_at),
                     init_completed_at = COALESCE(EXCLUDED.init_completed_at, steep_repl.nodes.init_completed_at)",
                &[
                    &node.node_id.as_str(),
                    &node.node_name,
                    &node.host,
                    &i32::from(node.port),
                    &node.priority,
                    &node.last_seen,
                    &node.status.as_str(),
                    &node.init_state.as_str(),
                    &node.init_source_node.as_ref().map(NodeId::as_str),
                    &node.init_started_at,
                    &node.init_completed_at,
                ],
            )
            .await?;
        Ok(())
    }

    /// Updates a node's init state and bookkeeping columns.
    pub async fn set_init_state<C: GenericClient>(
        client: &C,
        node_id: &NodeId,
        state: InitState,
        source: Option<&NodeId>,
    ) -> Result<(), RegistryError> {
        let updated = client
            .execute(
                "UPDATE steep_repl.nodes SET
                     init_state = $2,
                     init_source_node = COALESCE($3, init_source_node),
                     init_started_at = CASE WHEN $2 = 'preparing' THEN now() ELSE init_started_at END,
                     init_completed_at = CASE WHEN $2 = 'synchronized' THEN now() ELSE init_completed_at END
                 WHERE node_id = $1",
                &[
                    &node_id.as_str(),
                    &state.as_str(),
                    &source.map(NodeId::as_str),
                ],
            )
            .await?;
        if updated == 0 {
            return Err(RegistryError::UnknownNode(node_id.clone()));
        }
        Ok(())
    }

    /// Persists the EWMA throughput of a completed sync for ETA seeding.
    pub async fn record_sync_throughput<C: GenericClient>(
        client: &C,
        node_id: &NodeId,
        bytes_per_sec: f32,
    ) -> Result<(), RegistryError> {
        client
            .execute(
                "UPDATE steep_repl.nodes
                 SET last_sync_throughput_bytes_sec = $2, last_sync_at = now()
                 WHERE node_id = $1",
                &[&node_id.as_str(), &bytes_per_sec],
            )
            .await?;
        Ok(())
    }

    /// Marks nodes stale or unreachable by heartbeat recency.
    pub async fn sweep_liveness<C: GenericClient>(
        client: &C,
        stale_after_secs: i64,
        unreachable_after_secs: i64,
    ) -> Result<u64, RegistryError> {
        let changed = client
            .execute(
                "UPDATE steep_repl.nodes
                 SET status = CASE
                     WHEN last_seen IS NULL OR last_seen < now() - make_interval(secs => $2::float8)
                         THEN 'unreachable'
                     WHEN last_seen < now() - make_interval(secs => $1::float8)
                         THEN 'stale'
                     ELSE status
                 END
                 WHERE status <> CASE
                     WHEN last_seen IS NULL OR last_seen < now() - make_interval(secs => $2::float8)
                         THEN 'unreachable'
                     WHEN last_seen < now() - make_interval(secs => $1::float8)
                         THEN 'stale'
                     ELSE status
                 END",
                &[&(stale_after_secs as f64), &(unreachable_after_secs as f64)],
            )
            .await?;
        Ok(changed)
    }

    /// Computes the election winner: the healthy node with the highest
    /// priority, ties broken by lexicographic node id.
    pub async fn election_winner<C: GenericClient>(
        client: &C,
    ) -> Result<Option<NodeId>, RegistryError> {
        let row = client
            .query_opt(
                "SELECT node_id FROM steep_repl.nodes
                 WHERE status = 'healthy'
                 ORDER BY priority DESC, node_id ASC
                 LIMIT 1",
                &[],
            )
            .await?;
        Ok(row.map(|r| NodeId::new(r.get::<_, String>("node_id"))))
    }

    /// Claims coordinatorship for `node_id` and clears every other claim.
    /// Only the winning node calls this for itself, keeping the invariant
    /// of at most one coordinator row.
    pub async fn claim_coordinator<C: GenericClient>(
        client: &C,
        node_id: &NodeId,
    ) -> Result<(), RegistryError> {
        client
            .execute(
                "UPDATE steep_repl.nodes
                 SET is_coordinator = (node_id = $1)
                 WHERE is_coordinator <> (node_id = $1)",
                &[&node_id.as_str()],
            )
            .await?;
        Ok(())
    }
}
