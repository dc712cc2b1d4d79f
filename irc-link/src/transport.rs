//! Socket establishment.
//!
//! Applies the protocol default port, resolves the address, dials TCP and,
//! when TLS is enabled, runs the rustls handshake on top. There is no retry
//! here; a failed attempt is reported to the caller as a [`ConnectionError`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;

use crate::client::ClientConfig;

/// Default port for plaintext connections.
pub const DEFAULT_PORT: u16 = 6667;
/// Default port for TLS connections.
pub const DEFAULT_TLS_PORT: u16 = 6697;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid server address {0:?}")]
    InvalidAddress(String),
    #[error("could not resolve {addr}: {source}")]
    Resolve { addr: String, source: io::Error },
    #[error("TCP connect to {addr} failed: {source}")]
    Dial { addr: String, source: io::Error },
    #[error("connecting to {addr} timed out")]
    Timeout { addr: String },
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),
    #[error("TLS handshake with {addr} failed: {source}")]
    Handshake { addr: String, source: io::Error },
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("client has been shut down")]
    Closed,
}

/// A socket that has completed TCP (and optionally TLS) setup.
pub enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Result of a successful [`connect`].
pub struct EstablishedConnection {
    /// Host part of the address, without port.
    pub host: String,
    /// `host:port` with the default port applied.
    pub server_addr: String,
    pub socket: Socket,
}

/// Split `address` into its host and a `host:port` server address, applying
/// the default port when none is given.
///
/// Accepts `host`, `host:port`, `[v6]`, `[v6]:port` and bare IPv6 literals.
pub fn split_address(address: &str, tls: bool) -> Result<(String, String), ConnectionError> {
    let address = address.trim();
    let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT };
    let invalid = || ConnectionError::InvalidAddress(address.to_string());

    if let Some(bracketed) = address.strip_prefix('[') {
        let end = bracketed.find(']').ok_or_else(invalid)?;
        let host = &bracketed[..end];
        if host.is_empty() {
            return Err(invalid());
        }
        return match &bracketed[end + 1..] {
            "" => Ok((host.to_string(), format!("[{host}]:{default_port}"))),
            rest => match rest.strip_prefix(':') {
                Some(port) if port.parse::<u16>().is_ok() => {
                    Ok((host.to_string(), address.to_string()))
                }
                _ => Err(invalid()),
            },
        };
    }

    match address.matches(':').count() {
        0 if !address.is_empty() => {
            Ok((address.to_string(), format!("{address}:{default_port}")))
        }
        1 => {
            let (host, port) = address.split_once(':').ok_or_else(invalid)?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(invalid());
            }
            Ok((host.to_string(), address.to_string()))
        }
        // Unbracketed IPv6 literal; there is no way to tell a port apart.
        n if n > 1 => Ok((address.to_string(), format!("[{address}]:{default_port}"))),
        _ => Err(invalid()),
    }
}

/// Open a socket to `address` using the TLS and timeout settings in `config`.
pub async fn connect(
    config: &ClientConfig,
    address: &str,
) -> Result<EstablishedConnection, ConnectionError> {
    let (host, server_addr) = split_address(address, config.tls)?;
    let mode = if config.tls { "TLS" } else { "plain" };

    tracing::debug!(server = %server_addr, "Resolving");
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&server_addr)
        .await
        .map_err(|source| ConnectionError::Resolve {
            addr: server_addr.clone(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectionError::Resolve {
            addr: server_addr,
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
        });
    }

    let tcp = dial(&addrs, &server_addr, config.connect_timeout).await?;
    tracing::info!(server = %server_addr, "TCP connected ({mode})");

    let socket = if config.tls {
        let tls = handshake(config, &host, &server_addr, tcp).await?;
        tracing::info!(server = %server_addr, "TLS handshake complete");
        Socket::Tls(Box::new(tls))
    } else {
        Socket::Plain(tcp)
    };

    Ok(EstablishedConnection {
        host,
        server_addr,
        socket,
    })
}

/// Try each resolved address in turn, returning the first that accepts.
async fn dial(
    addrs: &[SocketAddr],
    server_addr: &str,
    limit: Option<Duration>,
) -> Result<TcpStream, ConnectionError> {
    let mut last_err = None;
    for addr in addrs {
        let attempt = TcpStream::connect(addr);
        let result = match limit {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(%addr, "Connect timed out");
                    last_err = Some(ConnectionError::Timeout {
                        addr: server_addr.to_string(),
                    });
                    continue;
                }
            },
            None => attempt.await,
        };
        match result {
            Ok(tcp) => return Ok(tcp),
            Err(source) => {
                tracing::debug!(%addr, "Connect failed: {source}");
                last_err = Some(ConnectionError::Dial {
                    addr: server_addr.to_string(),
                    source,
                });
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ConnectionError::InvalidAddress(server_addr.to_string())))
}

async fn handshake(
    config: &ClientConfig,
    host: &str,
    server_addr: &str,
    tcp: TcpStream,
) -> Result<TlsStream<TcpStream>, ConnectionError> {
    let connector = TlsConnector::from(tls_client_config(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| ConnectionError::InvalidServerName(host.to_string()))?;

    let attempt = connector.connect(server_name, tcp);
    let result = match config.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, attempt)
            .await
            .map_err(|_| ConnectionError::Timeout {
                addr: server_addr.to_string(),
            })?,
        None => attempt.await,
    };
    result.map_err(|source| ConnectionError::Handshake {
        addr: server_addr.to_string(),
        source,
    })
}

/// Pick the rustls configuration: an explicit one wins, then insecure mode,
/// then the webpki root store.
fn tls_client_config(config: &ClientConfig) -> Arc<rustls::ClientConfig> {
    if let Some(ref custom) = config.tls_config {
        return Arc::clone(custom);
    }
    if config.tls_insecure {
        tracing::warn!("TLS: insecure mode (skipping cert verification)");
        Arc::new(rustls_insecure_config())
    } else {
        Arc::new(rustls_default_config())
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn rustls_insecure_config() -> rustls::ClientConfig {
    let _ = rustls::crypto::ring::default_provider().install_default();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth()
}

/// Accepts any server certificate. Only for self-signed test deployments.
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
