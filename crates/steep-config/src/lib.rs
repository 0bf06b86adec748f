//! Configuration for the steep-repl daemon.
//!
//! Sources are merged in precedence order: built-in defaults, the config
//! file (`steep-repl.toml`), `STEEP_*` environment variables, and finally
//! the standard `PG*` variables, which override the file's database
//! section when set.

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    pub node: NodeSection,
    pub database: DatabaseSection,
    pub rpc: RpcSection,
    pub heartbeat: HeartbeatSection,
    pub snapshot: SnapshotSection,
    pub merge: MergeSection,
}

/// Identity of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub node_id: String,
    pub node_name: String,
    /// Coordinator election priority, 1-100, higher preferred.
    pub priority: i32,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            node_name: String::new(),
            priority: 50,
        }
    }
}

/// Connection settings for the local PostgreSQL instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub sslmode: String,
    /// Pool sizing and lifetimes.
    pub pool_max_size: usize,
    pub connection_lifetime_secs: u64,
    pub idle_timeout_secs: u64,
    pub health_check_interval_secs: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "postgres".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            sslmode: "prefer".to_string(),
            pool_max_size: 16,
            connection_lifetime_secs: 3600,
            idle_timeout_secs: 1800,
            health_check_interval_secs: 30,
        }
    }
}

impl DatabaseSection {
    /// Renders a libpq-style conninfo string for this section.
    pub fn conninfo(&self) -> String {
        let mut parts = vec![
            format!("host={}", self.host),
            format!("port={}", self.port),
            format!("dbname={}", self.dbname),
            format!("user={}", self.user),
        ];
        if !self.password.is_empty() {
            parts.push(format!("password={}", self.password));
        }
        parts.push(format!("sslmode={}", self.sslmode));
        parts.join(" ")
    }
}

/// RPC listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSection {
    pub bind_address: String,
    /// PEM certificate/key for the daemon. TLS 1.3 minimum when set.
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    /// CA bundle; when present, client certificates are required and
    /// verified.
    pub tls_ca_path: Option<String>,
    /// Explicit opt-in to plaintext RPC.
    pub allow_insecure: bool,
    pub control_deadline_secs: u64,
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7433".to_string(),
            tls_cert_path: None,
            tls_key_path: None,
            tls_ca_path: None,
            allow_insecure: false,
            control_deadline_secs: 30,
        }
    }
}

/// Heartbeat cadence and liveness thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    pub interval_secs: u64,
    /// A node unseen for `interval * stale_multiplier` becomes stale.
    pub stale_multiplier: u32,
    /// Unseen for `interval * unreachable_multiplier` becomes unreachable.
    pub unreachable_multiplier: u32,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            stale_multiplier: 3,
            unreachable_multiplier: 10,
        }
    }
}

/// Two-phase snapshot defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub output_dir: String,
    pub codec: String,
    pub parallel_workers: u8,
    pub deadline_hours: u64,
    /// Generated snapshots expire after this many hours.
    pub retention_hours: u64,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            output_dir: "/var/lib/steep/snapshots".to_string(),
            codec: "zstd".to_string(),
            parallel_workers: 4,
            deadline_hours: 24,
            retention_hours: 72,
        }
    }
}

/// Merge engine defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSection {
    pub quiesce_timeout_ms: u64,
    pub deadline_mins: u64,
}

impl Default for MergeSection {
    fn default() -> Self {
        Self {
            quiesce_timeout_ms: 30_000,
            deadline_mins: 30,
        }
    }
}

impl ReplConfig {
    /// Validates invariants the type system cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.node.node_id.is_empty(), "node.node_id must be set");
        anyhow::ensure!(
            (1..=100).contains(&self.node.priority),
            "node.priority must be within 1..=100"
        );
        anyhow::ensure!(
            (1..=16).contains(&self.snapshot.parallel_workers),
            "snapshot.parallel_workers must be within 1..=16"
        );
        anyhow::ensure!(
            self.heartbeat.interval_secs > 0,
            "heartbeat.interval_secs must be positive"
        );
        if self.rpc.tls_cert_path.is_some() != self.rpc.tls_key_path.is_some() {
            anyhow::bail!("rpc.tls_cert_path and rpc.tls_key_path must be set together");
        }
        if self.rpc.tls_cert_path.is_none() && !self.rpc.allow_insecure {
            anyhow::bail!(
                "no TLS certificate configured; set rpc.allow_insecure = true to opt in to plaintext RPC"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ReplConfig {
        let mut config = ReplConfig::default();
        config.node.node_id = "node-a".to_string();
        config.rpc.allow_insecure = true;
        config
    }

    #[test]
    fn defaults_are_sane() {
        let config = ReplConfig::default();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.pool_max_size, 16);
        assert_eq!(config.heartbeat.stale_multiplier, 3);
        assert_eq!(config.heartbeat.unreachable_multiplier, 10);
        assert_eq!(config.snapshot.parallel_workers, 4);
    }

    #[test]
    fn validate_requires_node_id() {
        let mut config = valid_config();
        config.node.node_id.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_plaintext_without_opt_in() {
        let mut config = valid_config();
        config.rpc.allow_insecure = false;
        assert!(config.validate().is_err());

        config.rpc.tls_cert_path = Some("/etc/steep/server.crt".to_string());
        config.rpc.tls_key_path = Some("/etc/steep/server.key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_half_configured_tls() {
        let mut config = valid_config();
        config.rpc.tls_cert_path = Some("/etc/steep/server.crt".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn conninfo_renders_without_empty_password() {
        let mut section = DatabaseSection::default();
        section.host = "db1".to_string();
        assert_eq!(
            section.conninfo(),
            "host=db1 port=5432 dbname=postgres user=postgres sslmode=prefer"
        );
        section.password = "secret".to_string();
        assert!(section.conninfo().contains("password=secret"));
    }

    #[test]
    fn validate_bounds_parallel_workers() {
        let mut config = valid_config();
        config.snapshot.parallel_workers = 0;
        assert!(config.validate().is_err());
        config.snapshot.parallel_workers = 17;
        assert!(config.validate().is_err());
        config.snapshot.parallel_workers = 16;
        assert!(config.validate().is_ok());
    }
}
