//! Configuration loader with multi-source merging.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::ReplConfig;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "steep-repl.toml";

/// `PG*` variables that override the `[database]` section when set.
const PG_ENV_VARS: [(&str, &str); 6] = [
    ("PGHOST", "host"),
    ("PGPORT", "port"),
    ("PGDATABASE", "dbname"),
    ("PGUSER", "user"),
    ("PGPASSWORD", "password"),
    ("PGSSLMODE", "sslmode"),
];

/// Builder-style loader merging defaults, file, and environment.
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_prefix: "STEEP".to_string(),
        }
    }

    /// Use an explicit config file instead of `./steep-repl.toml`.
    pub fn with_config_path(mut self, path: impl AsRef<Path>) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration from all sources with proper precedence.
    pub fn load(self) -> Result<ReplConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = ReplConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. Config file (explicit path is required to exist; the default
        //    lookup is best-effort)
        match &self.config_path {
            Some(path) => {
                builder = builder.add_source(
                    config::File::from(path.clone())
                        .required(true)
                        .format(config::FileFormat::Toml),
                );
            }
            None => {
                builder = builder.add_source(
                    config::File::with_name(CONFIG_FILE)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        // 3. STEEP_* environment variables (STEEP_DATABASE_HOST etc.)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder.build().context("failed to build configuration")?;
        let mut repl_config: ReplConfig = merged
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        // 4. Standard PG* variables win over everything for the database
        //    section.
        apply_pg_env(&mut repl_config)?;

        Ok(repl_config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_pg_env(config: &mut ReplConfig) -> Result<()> {
    apply_pg_overrides(config, |var| env::var(var).ok())
}

fn apply_pg_overrides(
    config: &mut ReplConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    for (var, field) in PG_ENV_VARS {
        let Some(value) = lookup(var) else { continue };
        if value.is_empty() {
            continue;
        }
        match field {
            "host" => config.database.host = value,
            "port" => {
                config.database.port = value
                    .parse()
                    .with_context(|| format!("{var} is not a valid port: {value:?}"))?;
            }
            "dbname" => config.database.dbname = value,
            "user" => config.database.user = value,
            "password" => config.database.password = value,
            "sslmode" => config.database.sslmode = value,
            _ => unreachable!(),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_defaults_without_file() {
        let config = ConfigLoader::new().load().expect("load defaults");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.heartbeat.interval_secs, 10);
    }

    #[test]
    fn load_explicit_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("steep-repl.toml");
        fs::write(
            &path,
            r#"
[node]
node_id = "node-a"
node_name = "primary"
priority = 80

[database]
host = "db-a.internal"
port = 5433

[rpc]
bind_address = "0.0.0.0:7433"
allow_insecure = true
"#,
        )
        .expect("write config");

        let config = ConfigLoader::new()
            .with_config_path(&path)
            .load()
            .expect("load config");

        assert_eq!(config.node.node_id, "node-a");
        assert_eq!(config.node.priority, 80);
        assert_eq!(config.database.host, "db-a.internal");
        assert_eq!(config.database.port, 5433);
        assert_eq!(config.rpc.bind_address, "0.0.0.0:7433");
        // Untouched sections keep defaults.
        assert_eq!(config.snapshot.parallel_workers, 4);
        config.validate().expect("config validates");
    }

    #[test]
    fn missing_explicit_file_errors() {
        let result = ConfigLoader::new()
            .with_config_path("/nonexistent/steep-repl.toml")
            .load();
        assert!(result.is_err());
    }

    // PG* overrides are applied after file merging; exercised with an
    // injected lookup since the config crate reads the real environment.
    #[test]
    fn pg_overrides_win_over_file_values() {
        let mut config = ReplConfig::default();
        config.database.host = "from-file".to_string();
        apply_pg_overrides(&mut config, |var| match var {
            "PGHOST" => Some("pg-env-host".to_string()),
            "PGPORT" => Some("6432".to_string()),
            _ => None,
        })
        .expect("apply overrides");
        assert_eq!(config.database.host, "pg-env-host");
        assert_eq!(config.database.port, 6432);
        // Unset variables leave the section alone.
        assert_eq!(config.database.dbname, "postgres");
    }

    #[test]
    fn pg_override_rejects_bad_port() {
        let mut config = ReplConfig::default();
        let result = apply_pg_overrides(&mut config, |var| {
            (var == "PGPORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn empty_pg_values_are_ignored() {
        let mut config = ReplConfig::default();
        apply_pg_overrides(&mut config, |_| Some(String::new())).expect("apply overrides");
        assert_eq!(config.database.host, "localhost");
    }
}
