//! Shared daemon state handed to every connection.

use std::sync::Arc;

use steep_config::ReplConfig;
use steep_db::Db;
use steep_init::InitMachine;
use steep_progress::ProgressFabric;
use steep_registry::Node;
use steep_types::NodeId;

/// Everything a request handler needs. Components are wired once at
/// startup; none of them holds a back-reference to another.
#[derive(Clone)]
pub struct DaemonState {
    pub config: Arc<ReplConfig>,
    pub db: Db,
    pub fabric: ProgressFabric,
    pub machine: Arc<InitMachine>,
    pub local_node: NodeId,
}

impl DaemonState {
    /// Connection string for a peer node's database, using the registry's
    /// host and port with this daemon's database credentials. Clusters
    /// share database name and replication role by convention.
    pub fn conninfo_for(&self, node: &Node) -> String {
        let mut section = self.config.database.clone();
        section.host = node.host.clone();
        section.port = node.port;
        section.conninfo()
    }
}
