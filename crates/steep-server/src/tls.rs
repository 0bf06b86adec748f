//! TLS configuration: TLS 1.3 minimum, client certificates required and
//! verified whenever a CA bundle is supplied.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tokio_rustls::TlsAcceptor;

use crate::ServerError;

/// File-based TLS settings for the daemon listener.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// When present, clients must present a certificate this CA signed.
    pub ca_path: Option<PathBuf>,
}

impl TlsSettings {
    /// Builds the acceptor. TLS 1.3 only: the control plane has no legacy
    /// peers to accommodate.
    pub fn build_acceptor(&self) -> Result<TlsAcceptor, ServerError> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let builder = rustls::ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
        ]);
        let config = match &self.ca_path {
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots
                        .add(cert)
                        .map_err(|e| ServerError::Tls(format!("bad CA certificate: {e}")))?;
                }
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| ServerError::Tls(format!("client verifier: {e}")))?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key),
        }
        .map_err(|e| ServerError::Tls(e.to_string()))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    let pem = std::fs::read(path)
        .map_err(|e| ServerError::Tls(format!("read {}: {e}", path.display())))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Tls(format!("parse {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ServerError> {
    let pem = std::fs::read(path)
        .map_err(|e| ServerError::Tls(format!("read {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| ServerError::Tls(format!("parse {}: {e}", path.display())))?
        .ok_or_else(|| ServerError::Tls(format!("no private key in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_cert_file_is_a_tls_error() {
        let settings = TlsSettings {
            cert_path: PathBuf::from("/nonexistent/server.crt"),
            key_path: PathBuf::from("/nonexistent/server.key"),
            ca_path: None,
        };
        assert!(matches!(
            settings.build_acceptor(),
            Err(ServerError::Tls(_))
        ));
    }
}
