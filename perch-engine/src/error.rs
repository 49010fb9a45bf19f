//! Engine error type.

use std::io;
use std::path::PathBuf;

/// Errors surfaced by the engine.
///
/// Connect-time variants are returned from [`crate::Engine::connect`] (and
/// reported as a status event). `Malformed` is produced by dispatch handlers
/// and only ever reported per line; it never ends a session.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("connect to {addr} timed out after {secs}s")]
    ConnectTimeout { addr: String, secs: u64 },

    #[error("TCP connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),

    #[error("TLS handshake with {addr} failed: {source}")]
    TlsHandshake {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),

    #[error("can't load client certificate {}: {reason}", path.display())]
    ClientCert { path: PathBuf, reason: String },

    #[error("malformed {command}: {reason}")]
    Malformed {
        command: String,
        reason: &'static str,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EngineError {
    pub(crate) fn malformed(command: &str, reason: &'static str) -> Self {
        EngineError::Malformed {
            command: command.to_string(),
            reason,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
