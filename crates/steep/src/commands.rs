//! Command implementations over the RPC client.

use std::path::PathBuf;

use clap::Subcommand;
use tracing::error;

use steep_client::{Client, ClientError, ClientTls};
use steep_config::ConfigLoader;
use steep_server::Daemon;
use steep_types::{
    CompressionCodec, ConflictStrategy, InitMethod, NodeId, NodeStatus, ProgressUpdate,
    ReinitScope, SchemaSyncMode,
};
use steep_wire::{InitOptions, RequestPayload, ResponsePayload};

use crate::exit::ExitCode;

/// Connection flags shared by every client command.
pub struct ConnectArgs {
    pub server: String,
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub tls_server_name: String,
}

impl ConnectArgs {
    fn tls(&self) -> Option<ClientTls> {
        self.ca.as_ref().map(|ca| ClientTls {
            ca_path: PathBuf::from(ca),
            cert_path: self.cert.as_ref().map(PathBuf::from),
            key_path: self.key.as_ref().map(PathBuf::from),
            server_name: self.tls_server_name.clone(),
        })
    }

    async fn connect(&self) -> Result<Client, ClientError> {
        Client::connect(&self.server, self.tls().as_ref()).await
    }
}

#[derive(Subcommand)]
pub enum InitCommands {
    /// Start initializing a target node from a source.
    Start {
        #[arg(long)]
        target: String,
        #[arg(long)]
        source: String,
        /// snapshot, manual, two_phase, or direct.
        #[arg(long, default_value = "snapshot")]
        method: String,
        /// strict, auto, or manual.
        #[arg(long, default_value = "strict")]
        schema_sync: String,
        /// Side-channel conninfo for the direct method.
        #[arg(long)]
        conninfo: Option<String>,
        /// Output directory for the two_phase method.
        #[arg(long)]
        snapshot_dir: Option<String>,
    },
    /// Cancel an in-flight init and restore the pre-init state.
    Cancel {
        #[arg(long)]
        node: String,
    },
    /// Prepare a source-side slot for the manual workflow.
    Prepare {
        #[arg(long)]
        node: String,
        #[arg(long)]
        slot: Option<String>,
    },
    /// Complete a manual init after the backup restore.
    Complete {
        #[arg(long)]
        target: String,
        #[arg(long)]
        source: String,
        #[arg(long)]
        slot: String,
        #[arg(long)]
        lsn: String,
        #[arg(long, default_value = "strict")]
        schema_sync: String,
    },
    /// Reinitialize a node (full) or a table subset.
    Reinit {
        #[arg(long)]
        node: String,
        /// full, or omit to use --tables / --schema.
        #[arg(long)]
        full: bool,
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        #[arg(long)]
        schema: Option<String>,
    },
    /// Show or follow init progress.
    Progress {
        #[arg(long)]
        node: String,
        /// Stream updates until the operation terminates.
        #[arg(long)]
        follow: bool,
    },
}

#[derive(Subcommand)]
pub enum SchemaCommands {
    /// Compare local schema fingerprints with a peer.
    Compare {
        #[arg(long)]
        peer: String,
    },
    /// Capture fingerprints for local user tables.
    Capture {
        #[arg(long, value_delimiter = ',')]
        schemas: Vec<String>,
    },
    /// List stored fingerprints.
    List,
    /// Column-level diff of one table against a peer.
    Diff {
        #[arg(long)]
        peer: String,
        #[arg(long)]
        table: String,
    },
}

#[derive(Subcommand)]
pub enum SnapshotCommands {
    /// Generate a two-phase snapshot from this node.
    Generate {
        #[arg(long)]
        output_dir: String,
        /// none, gzip, lz4, or zstd.
        #[arg(long, default_value = "zstd")]
        codec: String,
        #[arg(long)]
        workers: Option<u8>,
    },
    /// Apply a generated snapshot on this node.
    Apply {
        #[arg(long)]
        snapshot_dir: String,
        /// Skip checksum verification before loading.
        #[arg(long)]
        no_verify: bool,
        /// Catch up against this source after loading.
        #[arg(long)]
        source: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum MergeCommands {
    /// Start a bidirectional merge with a peer.
    Start {
        #[arg(long)]
        peer: String,
        /// prefer_local, prefer_remote, last_modified, or manual.
        #[arg(long, default_value = "manual")]
        strategy: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long, default_value_t = 30_000)]
        quiesce_timeout_ms: u64,
    },
}

pub async fn start_daemon(config_path: Option<&str>) -> ExitCode {
    let loader = match config_path {
        Some(path) => ConfigLoader::new().with_config_path(path),
        None => ConfigLoader::new(),
    };
    let config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration load failed");
            return ExitCode::ConfigError;
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration invalid");
        return ExitCode::ConfigError;
    }

    let daemon = match Daemon::bootstrap(config).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "daemon bootstrap failed");
            return ExitCode::StartFailed;
        }
    };
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });
    match daemon.run().await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            error!(error = %e, "daemon exited with error");
            ExitCode::StartFailed
        }
    }
}

pub async fn status(connect: &ConnectArgs) -> ExitCode {
    let mut client = match connect.connect().await {
        Ok(client) => client,
        Err(_) => {
            println!("daemon: stopped");
            return ExitCode::Stopped;
        }
    };
    match client.call(RequestPayload::HealthCheck).await {
        Ok(ResponsePayload::Health {
            status,
            pg_connected,
            pg_version,
            active_operations,
        }) => {
            println!("daemon: running ({})", client.remote_node);
            println!("status: {status}");
            println!("postgres: {}", if pg_connected { "connected" } else { "disconnected" });
            if let Some(version) = pg_version {
                println!("postgres version: {version}");
            }
            println!("active operations: {active_operations}");
            ExitCode::Success
        }
        Ok(other) => fail(&format!("unexpected reply: {other:?}")),
        Err(e) => fail(&e.to_string()),
    }
}

pub async fn nodes(connect: &ConnectArgs, status_filter: Option<&str>) -> ExitCode {
    let filter = match status_filter {
        None => None,
        Some(raw) => match NodeStatus::parse(raw) {
            Some(status) => Some(status),
            None => return fail(&format!("unknown status {raw:?}")),
        },
    };
    match call(connect, RequestPayload::GetNodes { status_filter: filter }).await {
        Ok(ResponsePayload::Nodes(nodes)) => {
            println!(
                "{:<16} {:<20} {:<12} {:<14} {:>8} {:>5}",
                "NODE", "HOST", "STATUS", "INIT STATE", "PRIORITY", "COORD"
            );
            for node in nodes {
                println!(
                    "{:<16} {:<20} {:<12} {:<14} {:>8} {:>5}",
                    node.node_id.as_str(),
                    format!("{}:{}", node.host, node.port),
                    node.status.as_str(),
                    node.init_state.as_str(),
                    node.priority,
                    if node.is_coordinator { "*" } else { "" }
                );
            }
            ExitCode::Success
        }
        Ok(other) => fail(&format!("unexpected reply: {other:?}")),
        Err(code) => code,
    }
}

pub async fn init(connect: &ConnectArgs, command: InitCommands) -> ExitCode {
    match command {
        InitCommands::Start {
            target,
            source,
            method,
            schema_sync,
            conninfo,
            snapshot_dir,
        } => {
            let Some(method) = InitMethod::parse(&method) else {
                return fail(&format!("unknown method {method:?}"));
            };
            let Some(schema_sync) = SchemaSyncMode::parse(&schema_sync) else {
                return fail(&format!("unknown schema sync mode {schema_sync:?}"));
            };
            let payload = RequestPayload::StartInit {
                target: NodeId::new(target),
                source: NodeId::new(source),
                method,
                options: InitOptions {
                    schema_sync,
                    direct_conninfo: conninfo,
                    snapshot_dir,
                    ..InitOptions::default()
                },
            };
            expect_operation(connect, payload).await
        }
        InitCommands::Cancel { node } => {
            match call(connect, RequestPayload::CancelInit { node_id: NodeId::new(node) }).await {
                Ok(ResponsePayload::InitCancelled) => {
                    println!("init cancelled");
                    ExitCode::Success
                }
                Ok(other) => fail(&format!("unexpected reply: {other:?}")),
                Err(code) => code,
            }
        }
        InitCommands::Prepare { node, slot } => {
            let payload = RequestPayload::PrepareInit {
                node_id: NodeId::new(node),
                slot_name: slot,
            };
            match call(connect, payload).await {
                Ok(ResponsePayload::SlotPrepared { slot_name, lsn }) => {
                    println!("slot: {slot_name}");
                    println!("lsn: {lsn}");
                    ExitCode::Success
                }
                Ok(other) => fail(&format!("unexpected reply: {other:?}")),
                Err(code) => code,
            }
        }
        InitCommands::Complete {
            target,
            source,
            slot,
            lsn,
            schema_sync,
        } => {
            let Ok(lsn) = lsn.parse() else {
                return fail(&format!("malformed LSN {lsn:?}"));
            };
            let Some(schema_sync) = SchemaSyncMode::parse(&schema_sync) else {
                return fail(&format!("unknown schema sync mode {schema_sync:?}"));
            };
            let payload = RequestPayload::CompleteInit {
                target: NodeId::new(target),
                source: NodeId::new(source),
                slot_name: slot,
                lsn,
                schema_sync,
            };
            expect_operation(connect, payload).await
        }
        InitCommands::Reinit {
            node,
            full,
            tables,
            schema,
        } => {
            let scope = if full {
                ReinitScope::Full
            } else if let Some(schema) = schema {
                ReinitScope::Schema { schema }
            } else if !tables.is_empty() {
                ReinitScope::Tables { tables }
            } else {
                return fail("reinit needs --full, --tables, or --schema");
            };
            let payload = RequestPayload::StartReinit {
                node_id: NodeId::new(node),
                scope,
            };
            expect_operation(connect, payload).await
        }
        InitCommands::Progress { node, follow } => {
            if follow {
                let payload = RequestPayload::StreamProgress {
                    operation_id: None,
                    node_id: Some(NodeId::new(node)),
                };
                match stream(connect, payload).await {
                    Ok(()) => ExitCode::Success,
                    Err(code) => code,
                }
            } else {
                match call(connect, RequestPayload::GetProgress { node_id: NodeId::new(node) }).await
                {
                    Ok(ResponsePayload::ProgressSnapshot(Some(update))) => {
                        print_progress(&update);
                        ExitCode::Success
                    }
                    Ok(ResponsePayload::ProgressSnapshot(None)) => {
                        println!("no progress recorded");
                        ExitCode::Success
                    }
                    Ok(other) => fail(&format!("unexpected reply: {other:?}")),
                    Err(code) => code,
                }
            }
        }
    }
}

pub async fn schema(connect: &ConnectArgs, command: SchemaCommands) -> ExitCode {
    match command {
        SchemaCommands::Compare { peer } => {
            let payload = RequestPayload::CompareSchemas {
                local: NodeId::new(""),
                remote: NodeId::new(peer),
                mode: SchemaSyncMode::Strict,
            };
            match call(connect, payload).await {
                Ok(ResponsePayload::SchemaComparison(report)) => {
                    println!(
                        "match: {}  mismatch: {}  local-only: {}  remote-only: {}",
                        report.matches, report.mismatches, report.local_only, report.remote_only
                    );
                    if report.blocking {
                        println!("BLOCKING differences present");
                    }
                    for table in report.tables.iter().filter(|t| !t.column_diffs.is_empty()) {
                        for diff in &table.column_diffs {
                            println!(
                                "  {}.{}.{}: {}{}",
                                table.schema_name,
                                table.table_name,
                                diff.column_name,
                                diff.difference,
                                if diff.blocking { " (blocking)" } else { "" }
                            );
                        }
                    }
                    ExitCode::Success
                }
                Ok(other) => fail(&format!("unexpected reply: {other:?}")),
                Err(code) => code,
            }
        }
        SchemaCommands::Capture { schemas } => {
            let payload = RequestPayload::CaptureFingerprints {
                node_id: NodeId::new(""),
                schemas: (!schemas.is_empty()).then_some(schemas),
            };
            match call(connect, payload).await {
                Ok(ResponsePayload::FingerprintsCaptured { tables }) => {
                    println!("captured {tables} table(s)");
                    ExitCode::Success
                }
                Ok(other) => fail(&format!("unexpected reply: {other:?}")),
                Err(code) => code,
            }
        }
        SchemaCommands::List => {
            match call(connect, RequestPayload::GetSchemaFingerprints { node_id: NodeId::new("") })
                .await
            {
                Ok(ResponsePayload::Fingerprints(fingerprints)) => {
                    for fp in fingerprints {
                        println!(
                            "{}.{}  {}  ({} columns, {})",
                            fp.schema_name,
                            fp.table_name,
                            &fp.fingerprint[..16.min(fp.fingerprint.len())],
                            fp.column_count,
                            fp.captured_at
                        );
                    }
                    ExitCode::Success
                }
                Ok(other) => fail(&format!("unexpected reply: {other:?}")),
                Err(code) => code,
            }
        }
        SchemaCommands::Diff { peer, table } => {
            let Some((schema_name, table_name)) = table.split_once('.') else {
                return fail("table must be schema-qualified, e.g. public.users");
            };
            let payload = RequestPayload::GetColumnDiff {
                peer: NodeId::new(peer),
                schema_name: schema_name.to_string(),
                table_name: table_name.to_string(),
            };
            match call(connect, payload).await {
                Ok(ResponsePayload::ColumnDiff(diffs)) => {
                    if diffs.is_empty() {
                        println!("no differences");
                    }
                    for diff in diffs {
                        println!(
                            "{}: {}{}\n  local:  {}\n  remote: {}",
                            diff.column_name,
                            diff.difference,
                            if diff.blocking { " (blocking)" } else { "" },
                            diff.local_definition.as_deref().unwrap_or("-"),
                            diff.remote_definition.as_deref().unwrap_or("-"),
                        );
                    }
                    ExitCode::Success
                }
                Ok(other) => fail(&format!("unexpected reply: {other:?}")),
                Err(code) => code,
            }
        }
    }
}

pub async fn snapshot(connect: &ConnectArgs, command: SnapshotCommands) -> ExitCode {
    match command {
        SnapshotCommands::Generate {
            output_dir,
            codec,
            workers,
        } => {
            let Some(codec) = CompressionCodec::parse(&codec) else {
                return fail(&format!("unknown codec {codec:?}"));
            };
            let payload = RequestPayload::GenerateSnapshot {
                source: NodeId::new(""),
                output_dir,
                codec,
                parallel_workers: workers,
            };
            match stream_result(connect, payload).await {
                Ok(ResponsePayload::SnapshotGenerated {
                    snapshot_id,
                    lsn,
                    tables,
                    bytes,
                }) => {
                    println!("snapshot {snapshot_id} complete: {tables} table(s), {bytes} bytes, lsn {lsn}");
                    ExitCode::Success
                }
                Ok(other) => fail(&format!("unexpected reply: {other:?}")),
                Err(code) => code,
            }
        }
        SnapshotCommands::Apply {
            snapshot_dir,
            no_verify,
            source,
        } => {
            let payload = RequestPayload::ApplySnapshot {
                target: NodeId::new(""),
                snapshot_dir,
                verify_checksums: !no_verify,
                source_node: source.map(NodeId::new),
            };
            match stream_result(connect, payload).await {
                Ok(ResponsePayload::SnapshotApplied { snapshot_id, rows }) => {
                    println!("snapshot {snapshot_id} applied: {rows} row(s)");
                    ExitCode::Success
                }
                Ok(other) => fail(&format!("unexpected reply: {other:?}")),
                Err(code) => code,
            }
        }
    }
}

pub async fn merge(connect: &ConnectArgs, command: MergeCommands) -> ExitCode {
    match command {
        MergeCommands::Start {
            peer,
            strategy,
            dry_run,
            quiesce_timeout_ms,
        } => {
            let Some(strategy) = ConflictStrategy::parse(&strategy) else {
                return fail(&format!("unknown strategy {strategy:?}"));
            };
            let payload = RequestPayload::StartBidirectionalMerge {
                local: NodeId::new(""),
                peer: NodeId::new(peer),
                strategy,
                dry_run,
                quiesce_timeout_ms,
            };
            expect_operation(connect, payload).await
        }
    }
}

// ----------------------------------------------------------------------
// Plumbing
// ----------------------------------------------------------------------

async fn call(connect: &ConnectArgs, payload: RequestPayload) -> Result<ResponsePayload, ExitCode> {
    let mut client = connect.connect().await.map_err(|e| fail(&e.to_string()))?;
    client.call(payload).await.map_err(|e| fail(&e.to_string()))
}

async fn stream(connect: &ConnectArgs, payload: RequestPayload) -> Result<(), ExitCode> {
    stream_result(connect, payload).await.map(|_| ())
}

async fn stream_result(
    connect: &ConnectArgs,
    payload: RequestPayload,
) -> Result<ResponsePayload, ExitCode> {
    let mut client = connect.connect().await.map_err(|e| fail(&e.to_string()))?;
    client
        .call_streaming(payload, print_progress_ref)
        .await
        .map_err(|e| fail(&e.to_string()))
}

fn print_progress_ref(update: ProgressUpdate) {
    print_progress(&update);
}

fn print_progress(update: &ProgressUpdate) {
    let table = update
        .current_table
        .as_deref()
        .map(|t| format!("  {t}"))
        .unwrap_or_default();
    let eta = update
        .eta_seconds
        .map(|s| format!("  eta {s}s"))
        .unwrap_or_default();
    println!(
        "[{}] {:>5.1}%  {}/{} tables{}{}",
        update.phase, update.overall_percent, update.tables_completed, update.tables_total, table, eta
    );
    if let Some(error) = &update.error_message {
        println!("error: {error}");
    }
}

async fn expect_operation(connect: &ConnectArgs, payload: RequestPayload) -> ExitCode {
    match call(connect, payload).await {
        Ok(
            ResponsePayload::InitStarted { operation_id }
            | ResponsePayload::InitCompleted { operation_id }
            | ResponsePayload::ReinitStarted { operation_id }
            | ResponsePayload::MergeStarted { operation_id },
        ) => {
            println!("operation: {operation_id}");
            ExitCode::Success
        }
        Ok(other) => fail(&format!("unexpected reply: {other:?}")),
        Err(code) => code,
    }
}

fn fail(message: &str) -> ExitCode {
    eprintln!("error: {message}");
    ExitCode::ConfigError
}
