//! Transport to the server: TLS over TCP, or plain TCP when `client.tls = false`

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::{ClientConfig as TlsConfig, RootCertStore, ServerName};
use sib_core::config::{expand_tilde, ClientConfig};
use sib_protocol::Transport;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

pub async fn open(config: &ClientConfig) -> Result<Box<dyn Transport>> {
    let tcp = TcpStream::connect(&config.server)
        .await
        .with_context(|| format!("connecting to {}", config.server))?;
    tcp.set_nodelay(true).ok();

    if !config.tls {
        warn!("TLS disabled: traffic to {} is only protected by the protocol layer", config.server);
        return Ok(Box::new(tcp));
    }

    let name = config
        .server_name
        .clone()
        .unwrap_or_else(|| host_of(&config.server).to_string());
    let server_name = ServerName::try_from(name.as_str())
        .with_context(|| format!("invalid server name '{name}'"))?;

    let tls = TlsConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots(config.ca_cert.as_deref())?)
        .with_no_client_auth();
    let stream = TlsConnector::from(Arc::new(tls))
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {name}"))?;
    debug!(server = %config.server, "TLS established");
    Ok(Box::new(stream))
}

/// Native roots, plus `ca_cert` when configured.
fn roots(ca_cert: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let der: Vec<Vec<u8>> = certs.into_iter().map(|c| c.0).collect();
            let (added, ignored) = roots.add_parsable_certificates(&der);
            debug!(added, ignored, "native root certificates");
        }
        Err(e) => warn!("could not load native root certificates: {e}"),
    }

    if let Some(path) = ca_cert {
        let path = expand_tilde(path);
        let mut reader = BufReader::new(
            File::open(&path).with_context(|| format!("opening {}", path.display()))?,
        );
        let der = rustls_pemfile::certs(&mut reader)
            .with_context(|| format!("parsing {}", path.display()))?;
        let (added, _) = roots.add_parsable_certificates(&der);
        if added == 0 {
            bail!("no usable certificate in {}", path.display());
        }
    }

    if roots.is_empty() {
        bail!("no trusted root certificates; set client.ca_cert");
    }
    Ok(roots)
}

/// Host part of `host:port`, brackets stripped for IPv6 literals.
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
