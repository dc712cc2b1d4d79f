use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use irc_link::ClientConfig;
use tokio_rustls::rustls;

/// Watch an IRC server, printing chat lines and reconnecting on loss.
#[derive(Parser, Debug, Clone)]
#[command(name = "irc-watch", version, about)]
pub struct CliConfig {
    /// Server address. Port defaults to 6667, or 6697 with --tls.
    pub server: String,

    /// Connect with TLS.
    #[arg(long)]
    pub tls: bool,

    /// Skip TLS certificate verification (for self-signed certs).
    #[arg(long)]
    pub tls_insecure: bool,

    /// PEM file of CA certificates to trust instead of the bundled roots.
    #[arg(long)]
    pub tls_ca: Option<String>,

    /// Nickname to register with.
    #[arg(long, default_value = "irclink")]
    pub nick: String,

    /// Real name sent in USER.
    #[arg(long, default_value = "irc-link watcher")]
    pub realname: String,

    /// Channels to join after registration. Can be specified multiple times.
    #[arg(long = "channel")]
    pub channels: Vec<String>,

    /// Seconds allowed for DNS, TCP and TLS setup.
    #[arg(long, default_value = "10")]
    pub connect_timeout_secs: u64,

    /// Drop the connection after this many silent seconds. 0 = never.
    #[arg(long, default_value = "300")]
    pub read_timeout_secs: u64,

    /// Upper bound on the delay between reconnect attempts.
    #[arg(long, default_value = "30")]
    pub max_backoff_secs: u64,

    /// Print every inbound line, not just chat messages.
    #[arg(long)]
    pub raw: bool,
}

impl CliConfig {
    pub fn client_config(&self) -> Result<ClientConfig> {
        let tls_config = match self.tls_ca {
            Some(ref path) => Some(load_ca_bundle(path)?),
            None => None,
        };
        Ok(ClientConfig {
            tls: self.tls,
            tls_insecure: self.tls_insecure,
            tls_config,
            connect_timeout: Some(Duration::from_secs(self.connect_timeout_secs)),
            read_timeout: (self.read_timeout_secs > 0)
                .then(|| Duration::from_secs(self.read_timeout_secs)),
            ..Default::default()
        })
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs.max(1))
    }
}

fn load_ca_bundle(path: &str) -> Result<Arc<rustls::ClientConfig>> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let pem = std::fs::read(path).with_context(|| format!("Failed to read CA bundle: {path}"))?;
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        let cert = cert.context("Failed to parse CA certificate")?;
        roots.add(cert).context("Invalid CA certificate")?;
    }
    if roots.is_empty() {
        anyhow::bail!("No certificates found in {path}");
    }

    Ok(Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}
