//! # steep-server: the steep-repl daemon
//!
//! One long-lived daemon per database node. Exposes the typed RPC surface
//! over a single framed TCP port (mutual TLS when certificates are
//! configured), supervises the background tasks (heartbeat emitter,
//! stale-node sweeper, progress forwarder, work-queue recovery), and
//! wires the init, snapshot, and merge machinery together at startup.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       steep-server                        │
//! │  ┌──────────┐   ┌─────────────┐   ┌────────────────────┐  │
//! │  │ Listener │ → │ Connections │ → │   RequestHandler   │  │
//! │  │ (TCP/TLS)│   │  (framed)   │   │ (→ init/merge/...) │  │
//! │  └──────────┘   └─────────────┘   └────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod daemon;
mod handler;
mod server;
mod state;
mod tls;

pub use daemon::Daemon;
pub use handler::RequestHandler;
pub use server::{Server, ServerOptions};
pub use state::DaemonState;
pub use tls::TlsSettings;

use steep_types::ErrorKind;

/// Server-side failures (transport level; operation errors travel back to
/// clients as status codes).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] steep_wire::WireError),

    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error("handshake required before any other request")]
    HandshakeRequired,

    #[error("protocol version {client} is not supported (server speaks {server})")]
    ProtocolMismatch { client: u16, server: u16 },

    #[error(transparent)]
    Db(#[from] steep_db::DbError),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Io(_) | ServerError::Tls(_) => ErrorKind::Internal,
            ServerError::Wire(_) => ErrorKind::InvalidArgument,
            ServerError::HandshakeRequired | ServerError::ProtocolMismatch { .. } => {
                ErrorKind::FailedPrecondition
            }
            ServerError::Db(e) => e.kind(),
        }
    }
}
