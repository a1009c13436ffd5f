use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Listener error: {0}")]
    Listener(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid pattern '{pattern}': {reason}")]
    Pattern { pattern: String, reason: String },
}

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to load certificate: {0}")]
    CertLoad(String),

    #[error("Failed to load private key: {0}")]
    KeyLoad(String),

    #[error("Invalid certificate: {0}")]
    InvalidCert(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Failed to open capture file: {0}")]
    Open(String),

    #[error("Failed to write packet: {0}")]
    Write(String),

    #[error("Failed to rotate capture file: {0}")]
    Rotate(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Filter '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ProxyError>;
