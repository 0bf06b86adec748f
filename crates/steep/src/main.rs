//! steep-repl unified CLI.
//!
//! Runs the daemon and drives it from the command line over the same RPC
//! surface peer daemons use.
//!
//! ```bash
//! # Start the daemon for this node
//! steep-repl start --config /etc/steep/steep-repl.toml
//!
//! # Initialize node-b from node-a (new terminal, on node-b's daemon)
//! steep-repl init start --target node-b --source node-a --method snapshot
//!
//! # Watch it
//! steep-repl init progress --node node-b --follow
//! ```

mod commands;
mod exit;

use clap::{Parser, Subcommand};

use exit::ExitCode;

/// steep-repl - control plane for bidirectional PostgreSQL replication.
#[derive(Parser)]
#[command(name = "steep-repl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Daemon RPC address for client commands.
    #[arg(short = 's', long, global = true, default_value = "127.0.0.1:7433")]
    server: String,

    /// CA bundle for TLS connections to the daemon.
    #[arg(long, global = true)]
    ca: Option<String>,

    /// Client certificate (mutual TLS).
    #[arg(long, global = true)]
    cert: Option<String>,

    /// Client private key (mutual TLS).
    #[arg(long, global = true)]
    key: Option<String>,

    /// Server name on the daemon certificate.
    #[arg(long, global = true, default_value = "localhost")]
    tls_server_name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon for this node.
    Start {
        /// Path to steep-repl.toml.
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Daemon health and cluster status.
    Status,

    /// List registered nodes.
    Nodes {
        /// Filter by status (healthy, stale, unreachable).
        #[arg(long)]
        status: Option<String>,
    },

    /// Node initialization operations.
    #[command(subcommand)]
    Init(commands::InitCommands),

    /// Schema fingerprint operations.
    #[command(subcommand)]
    Schema(commands::SchemaCommands),

    /// Two-phase snapshot operations.
    #[command(subcommand)]
    Snapshot(commands::SnapshotCommands),

    /// Bidirectional merge operations.
    #[command(subcommand)]
    Merge(commands::MergeCommands),
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::StartFailed.into();
        }
    };

    let connect = commands::ConnectArgs {
        server: cli.server,
        ca: cli.ca,
        cert: cli.cert,
        key: cli.key,
        tls_server_name: cli.tls_server_name,
    };

    let code = runtime.block_on(async {
        match cli.command {
            Commands::Start { config } => commands::start_daemon(config.as_deref()).await,
            Commands::Status => commands::status(&connect).await,
            Commands::Nodes { status } => commands::nodes(&connect, status.as_deref()).await,
            Commands::Init(command) => commands::init(&connect, command).await,
            Commands::Schema(command) => commands::schema(&connect, command).await,
            Commands::Snapshot(command) => commands::snapshot(&connect, command).await,
            Commands::Merge(command) => commands::merge(&connect, command).await,
        }
    });
    code.into()
}
