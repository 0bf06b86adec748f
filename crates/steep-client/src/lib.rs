//! Typed client for the steep-repl RPC surface.
//!
//! The same shape serves operator tools and peer daemons: connect (TLS
//! with a client certificate, or plaintext by explicit opt-in), handshake,
//! then issue requests. Streaming calls yield progress frames until the
//! server sends the terminal payload.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use steep_types::{NodeId, ProgressUpdate};
use steep_wire::{
    PROTOCOL_VERSION, Request, RequestId, RequestPayload, Response, ResponsePayload, WireError,
    decode_frame, encode_frame,
};

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error("connection closed mid-call")]
    ConnectionClosed,

    #[error("server replied to request {expected:?} with id {got:?}")]
    IdMismatch { expected: u64, got: u64 },

    #[error("daemon returned {code:?}: {message}")]
    Remote {
        code: steep_wire::ErrorCode,
        message: String,
    },
}

/// TLS material for mutual authentication.
#[derive(Debug, Clone)]
pub struct ClientTls {
    pub ca_path: PathBuf,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Name on the daemon's certificate.
    pub server_name: String,
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    async fn write_all_flush(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            Transport::Tls(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
        }
    }

    async fn read_into(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read_buf(buf).await,
            Transport::Tls(s) => s.read_buf(buf).await,
        }
    }
}

/// A connected, handshaken client.
pub struct Client {
    transport: Transport,
    read_buf: BytesMut,
    next_id: u64,
    /// The daemon's node id, learned from the handshake.
    pub remote_node: NodeId,
}

impl Client {
    /// Connects and handshakes. `tls = None` is the plaintext opt-in.
    pub async fn connect(address: &str, tls: Option<&ClientTls>) -> Result<Self, ClientError> {
        let socket = TcpStream::connect(address).await?;
        let transport = match tls {
            None => Transport::Plain(socket),
            Some(settings) => {
                let connector = build_connector(settings)?;
                let server_name = ServerName::try_from(settings.server_name.clone())
                    .map_err(|e| ClientError::Tls(format!("bad server name: {e}")))?;
                let stream = connector.connect(server_name, socket).await?;
                Transport::Tls(Box::new(stream))
            }
        };

        let mut client = Self {
            transport,
            read_buf: BytesMut::with_capacity(8 * 1024),
            next_id: 0,
            remote_node: NodeId::new(""),
        };
        let response = client
            .call(RequestPayload::Handshake {
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;
        match response {
            ResponsePayload::HandshakeAck { node_id, .. } => {
                client.remote_node = node_id;
                debug!(node = %client.remote_node, "handshake complete");
                Ok(client)
            }
            other => Err(ClientError::Remote {
                code: steep_wire::ErrorCode::Internal,
                message: format!("unexpected handshake reply: {other:?}"),
            }),
        }
    }

    /// One request, one response. Error payloads become `ClientError::Remote`.
    pub async fn call(&mut self, payload: RequestPayload) -> Result<ResponsePayload, ClientError> {
        let id = self.send(payload).await?;
        let response = self.read_response(id).await?;
        match response.payload {
            ResponsePayload::Error { code, message } => Err(ClientError::Remote { code, message }),
            payload => Ok(payload),
        }
    }

    /// A server-streaming call: `on_progress` sees every progress frame;
    /// the final non-progress payload is returned.
    pub async fn call_streaming(
        &mut self,
        payload: RequestPayload,
        mut on_progress: impl FnMut(ProgressUpdate),
    ) -> Result<ResponsePayload, ClientError> {
        let id = self.send(payload).await?;
        loop {
            let response = self.read_response(id).await?;
            match response.payload {
                ResponsePayload::Progress(update) => on_progress(update),
                ResponsePayload::Error { code, message } => {
                    return Err(ClientError::Remote { code, message });
                }
                payload => return Ok(payload),
            }
        }
    }

    async fn send(&mut self, payload: RequestPayload) -> Result<RequestId, ClientError> {
        self.next_id += 1;
        let id = RequestId(self.next_id);
        let mut buf = BytesMut::new();
        encode_frame(&Request::new(id, payload), &mut buf)?;
        self.transport.write_all_flush(&buf).await?;
        Ok(id)
    }

    async fn read_response(&mut self, expected: RequestId) -> Result<Response, ClientError> {
        loop {
            if let Some(response) = decode_frame::<Response>(&mut self.read_buf)? {
                if response.id != expected {
                    return Err(ClientError::IdMismatch {
                        expected: expected.0,
                        got: response.id.0,
                    });
                }
                return Ok(response);
            }
            let read = self.transport.read_into(&mut self.read_buf).await?;
            if read == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }
}

fn build_connector(settings: &ClientTls) -> Result<TlsConnector, ClientError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(&settings.ca_path)? {
        roots
            .add(cert)
            .map_err(|e| ClientError::Tls(format!("bad CA certificate: {e}")))?;
    }
    let builder = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_root_certificates(roots);
    let config = match (&settings.cert_path, &settings.key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = rustls_pemfile::private_key(
                &mut std::fs::read(key_path)
                    .map_err(|e| ClientError::Tls(format!("read {}: {e}", key_path.display())))?
                    .as_slice(),
            )
            .map_err(|e| ClientError::Tls(format!("parse {}: {e}", key_path.display())))?
            .ok_or_else(|| ClientError::Tls(format!("no private key in {}", key_path.display())))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::Tls(e.to_string()))?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ClientError> {
    let pem = std::fs::read(path)
        .map_err(|e| ClientError::Tls(format!("read {}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| ClientError::Tls(format!("parse {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ca_is_a_tls_error() {
        let settings = ClientTls {
            ca_path: PathBuf::from("/nonexistent/ca.pem"),
            cert_path: None,
            key_path: None,
            server_name: "node-a.steep.internal".to_string(),
        };
        assert!(matches!(build_connector(&settings), Err(ClientError::Tls(_))));
    }
}
