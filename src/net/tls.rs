//! TLS termination and upstream dialing material.
//!
//! Certificates and keys are loaded once per listener build; a reload
//! constructs a whole new acceptor rather than mutating a live one.

use crate::config::TlsConfig;
use crate::error::TlsError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)
        .map_err(|e| TlsError::CertLoad(format!("{}: {e}", path.display())))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::CertLoad(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TlsError::CertLoad(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)
        .map_err(|e| TlsError::KeyLoad(format!("{}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsError::KeyLoad(format!("{}: {e}", path.display())))?
        .ok_or_else(|| TlsError::KeyLoad(format!("{}: no private key found", path.display())))
}

/// Acceptor for terminating inbound TLS, with the configured ALPN set.
pub fn build_acceptor(cfg: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&cfg.cert_path)?;
    let key = load_key(&cfg.key_path)?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::InvalidCert(e.to_string()))?;
    server_config.alpn_protocols = cfg
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Connector for dialing the upstream over TLS, trusting only the
/// configured CA.
pub fn build_connector(cfg: &TlsConfig) -> Result<TlsConnector, TlsError> {
    let ca_path = cfg
        .ca_path
        .as_ref()
        .ok_or_else(|| TlsError::CertLoad("upstream TLS requires a CA path".into()))?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        roots
            .add(cert)
            .map_err(|e| TlsError::InvalidCert(e.to_string()))?;
    }

    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(client_config)))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| TlsError::Handshake(format!("invalid upstream name '{host}': {e}")))
}
