//! Daemon assembly: opens the pool, bootstraps the control schema, wires
//! the components, supervises background tasks, and runs the listener.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use steep_config::ReplConfig;
use steep_db::{Db, PoolOptions, bootstrap_control_schema};
use steep_init::InitMachine;
use steep_progress::ProgressFabric;
use steep_registry::{HeartbeatTask, LivenessThresholds, RegistryStore, SweeperTask};
use steep_types::NodeId;

use crate::{DaemonState, Server, ServerError, ServerOptions, TlsSettings};

/// A running steep-repl daemon.
pub struct Daemon {
    state: DaemonState,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Builds the daemon: pool, schema bootstrap, component wiring, and
    /// restart recovery. No background task runs until [`Daemon::run`].
    pub async fn bootstrap(config: ReplConfig) -> Result<Self, ServerError> {
        let local_node = NodeId::new(config.node.node_id.clone());
        let pool_options = PoolOptions {
            max_size: config.database.pool_max_size,
            connection_lifetime: Duration::from_secs(config.database.connection_lifetime_secs),
            idle_timeout: Duration::from_secs(config.database.idle_timeout_secs),
            health_check_interval: Duration::from_secs(config.database.health_check_interval_secs),
        };
        let conninfo = config.database.conninfo();
        let db = Db::open(&conninfo, &pool_options)?;

        {
            let client = db.get().await?;
            bootstrap_control_schema(&**client).await?;
            if let Err(e) = RegistryStore::register(
                &**client,
                &local_node,
                &config.node.node_name,
                &config.database.host,
                config.database.port,
                config.node.priority,
            )
            .await
            {
                warn!(error = %e, "self-registration failed; the heartbeat task will retry");
            }
        }

        let fabric = ProgressFabric::new();
        let machine = InitMachine::new(db.clone(), fabric.clone(), conninfo);
        if let Err(e) = machine.recover().await {
            warn!(error = %e, "restart recovery failed; continuing");
        }

        Ok(Self {
            state: DaemonState {
                config: Arc::new(config),
                db,
                fabric,
                machine,
                local_node,
            },
            shutdown: CancellationToken::new(),
        })
    }

    /// Handle for stopping the daemon from another task or a signal
    /// handler.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawns the background tasks and serves RPC until shutdown.
    pub async fn run(self) -> Result<(), ServerError> {
        let config = &self.state.config;
        let heartbeat_interval = Duration::from_secs(config.heartbeat.interval_secs);
        let thresholds = LivenessThresholds::from_interval(
            heartbeat_interval,
            config.heartbeat.stale_multiplier,
            config.heartbeat.unreachable_multiplier,
        );

        tokio::spawn(
            HeartbeatTask {
                db: self.state.db.clone(),
                node_id: self.state.local_node.clone(),
                interval: heartbeat_interval,
            }
            .run(self.shutdown.clone()),
        );
        tokio::spawn(
            SweeperTask {
                db: self.state.db.clone(),
                node_id: self.state.local_node.clone(),
                interval: heartbeat_interval,
                thresholds,
            }
            .run(self.shutdown.clone()),
        );
        tokio::spawn(steep_progress::run_notify_forwarder(
            self.state.fabric.clone(),
            self.state.db.clone(),
        ));

        let tls = match (&config.rpc.tls_cert_path, &config.rpc.tls_key_path) {
            (Some(cert), Some(key)) => Some(TlsSettings {
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
                ca_path: config.rpc.tls_ca_path.as_ref().map(PathBuf::from),
            }),
            _ => None,
        };
        let options = ServerOptions {
            bind_address: config.rpc.bind_address.clone(),
            tls,
        };

        info!(node = %self.state.local_node, "daemon up");
        let result = Server::new(options, self.state.clone())
            .run(self.shutdown.clone())
            .await;
        self.state.db.close();
        result
    }
}
