//! TCP/TLS connection setup.
//!
//! Everything up to a ready byte stream: connect with a timeout, optional
//! keepalive tuning, and the rustls handshake (webpki roots, optional client
//! certificate).

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};

use crate::config::{EngineConfig, KeepaliveConfig, TlsConfig};
use crate::error::{EngineError, Result};
use crate::event::{Event, EventSink};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Any byte stream the reader and writer halves can be split from.
pub trait IrcStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> IrcStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A connection that has completed TCP (and optionally TLS) but hasn't
/// started IRC registration yet.
pub enum EstablishedConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl EstablishedConnection {
    pub fn is_tls(&self) -> bool {
        matches!(self, EstablishedConnection::Tls(_))
    }

    pub fn into_stream(self) -> Box<dyn IrcStream> {
        match self {
            EstablishedConnection::Plain(tcp) => Box::new(tcp),
            EstablishedConnection::Tls(tls) => Box::new(*tls),
        }
    }
}

/// Open a TCP connection to `host:port`, wrapping it in TLS when asked.
///
/// Keepalive tuning and client-certificate loading are best-effort: their
/// failures are reported through `sink` and the connection goes ahead.
pub async fn establish(
    host: &str,
    port: u16,
    use_tls: bool,
    config: &EngineConfig,
    sink: &dyn EventSink,
) -> Result<EstablishedConnection> {
    let addr = format!("{host}:{port}");
    tracing::debug!(%addr, tls = use_tls, "connecting");

    let tcp = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await
    {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(source)) => return Err(EngineError::Connect { addr, source }),
        Err(_) => {
            return Err(EngineError::ConnectTimeout {
                addr,
                secs: CONNECT_TIMEOUT.as_secs(),
            });
        }
    };
    tracing::debug!(%addr, "TCP connected");

    if config.keepalive.enabled {
        match apply_keepalive(&tcp, &config.keepalive) {
            Ok(()) => sink.emit(Event::status("TCP keepalive enabled")),
            Err(e) => tracing::warn!("failed to enable TCP keepalive: {e}"),
        }
    }

    if !use_tls {
        return Ok(EstablishedConnection::Plain(tcp));
    }

    let connector = TlsConnector::from(Arc::new(client_config(&config.tls, sink)));
    let tls = tls_handshake(&connector, host, tcp, addr, CONNECT_TIMEOUT).await?;
    Ok(EstablishedConnection::Tls(Box::new(tls)))
}

/// The rustls handshake, bounded by `limit` so a peer that never answers
/// the ClientHello can't stall `connect`.
async fn tls_handshake(
    connector: &TlsConnector,
    host: &str,
    tcp: TcpStream,
    addr: String,
    limit: Duration,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| EngineError::InvalidServerName(host.to_string()))?;
    match tokio::time::timeout(limit, connector.connect(server_name, tcp)).await {
        Ok(Ok(tls)) => {
            tracing::debug!(%addr, "TLS handshake complete");
            Ok(tls)
        }
        Ok(Err(source)) => Err(EngineError::TlsHandshake { addr, source }),
        Err(_) => Err(EngineError::ConnectTimeout {
            addr,
            secs: limit.as_secs(),
        }),
    }
}

fn apply_keepalive(tcp: &TcpStream, tuning: &KeepaliveConfig) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(tuning.idle_secs.max(1)));
    #[cfg(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "freebsd",
        target_os = "windows"
    ))]
    let keepalive = keepalive.with_interval(Duration::from_secs(tuning.interval_secs.max(1)));
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "freebsd"))]
    let keepalive = keepalive.with_retries(tuning.count.max(1));

    SockRef::from(tcp).set_tcp_keepalive(&keepalive)
}

fn install_crypto_provider() {
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

/// Verifying client config. A configured client certificate that can't be
/// loaded is reported and left out.
fn client_config(tls: &TlsConfig, sink: &dyn EventSink) -> rustls::ClientConfig {
    install_crypto_provider();

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let builder = || rustls::ClientConfig::builder().with_root_certificates(root_store.clone());

    let Some(cert_path) = tls.client_certfile.as_deref() else {
        return builder().with_no_client_auth();
    };
    let key_path = tls.client_keyfile.as_deref().unwrap_or(cert_path);

    let loaded = load_client_cert(cert_path, key_path).and_then(|(certs, key)| {
        builder()
            .with_client_auth_cert(certs, key)
            .map_err(EngineError::from)
    });
    match loaded {
        Ok(config) => config,
        Err(e) => {
            sink.emit(Event::status(format!("TLS client cert load failed: {e}")));
            builder().with_no_client_auth()
        }
    }
}

/// Certificate chain from `cert_path` and the first private key in `key_path`
/// (which may be the same PEM file).
fn load_client_cert(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_error = |path: &Path, reason: String| EngineError::ClientCert {
        path: path.to_path_buf(),
        reason,
    };

    let cert_pem = std::fs::read(cert_path).map_err(|e| cert_error(cert_path, e.to_string()))?;
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| cert_error(cert_path, e.to_string()))?;
    if certs.is_empty() {
        return Err(cert_error(cert_path, "no certificates found".into()));
    }

    let key_pem = std::fs::read(key_path).map_err(|e| cert_error(key_path, e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| cert_error(key_path, e.to_string()))?
        .ok_or_else(|| cert_error(key_path, "no private key found".into()))?;

    Ok((certs, key))
}
