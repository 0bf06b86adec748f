//! The framed TCP listener.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use steep_wire::{Request, decode_frame};

use crate::{DaemonState, RequestHandler, ServerError, TlsSettings};

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind_address: String,
    /// TLS 1.3 settings; `None` requires the explicit plaintext opt-in.
    pub tls: Option<TlsSettings>,
}

/// The RPC server. One accept loop; one task per connection; requests on
/// a connection are processed in order.
pub struct Server {
    options: ServerOptions,
    state: DaemonState,
}

impl Server {
    pub fn new(options: ServerOptions, state: DaemonState) -> Self {
        Self { options, state }
    }

    /// Runs until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let acceptor = match &self.options.tls {
            Some(settings) => Some(settings.build_acceptor()?),
            None => {
                warn!("RPC listener running without TLS (explicit insecure opt-in)");
                None
            }
        };
        let listener = TcpListener::bind(&self.options.bind_address).await?;
        info!(address = %self.options.bind_address, tls = acceptor.is_some(), "RPC listener up");

        loop {
            let (socket, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            debug!(%peer, "connection accepted");
            let state = self.state.clone();
            let acceptor = acceptor.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(socket, acceptor, state, shutdown).await {
                    debug!(%peer, error = %e, "connection closed");
                }
            });
        }
        info!("RPC listener stopped");
        Ok(())
    }
}

async fn serve_connection(
    socket: TcpStream,
    acceptor: Option<TlsAcceptor>,
    state: DaemonState,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    match acceptor {
        Some(acceptor) => {
            let stream = acceptor.accept(socket).await?;
            connection_loop(stream, state, shutdown).await
        }
        None => connection_loop(socket, state, shutdown).await,
    }
}

async fn connection_loop<S>(
    mut stream: S,
    state: DaemonState,
    shutdown: CancellationToken,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut handler = RequestHandler::new(state);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        while let Some(request) = decode_frame::<Request>(&mut buf)? {
            handler.handle(request, &mut stream).await?;
        }
        let read = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            read = stream.read_buf(&mut buf) => read?,
        };
        if read == 0 {
            return Ok(()); // clean EOF
        }
    }
}
