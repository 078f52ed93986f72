//! TLS listener setup

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::{Certificate, PrivateKey, ServerConfig as TlsConfig};
use sib_core::config::{expand_tilde, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

/// Build the acceptor from `server.tls_cert` / `server.tls_key`.
///
/// Returns `None` for a plaintext listener, which is refused when
/// `server.enforce_tls` is set.
pub fn acceptor(config: &ServerConfig) -> Result<Option<TlsAcceptor>> {
    let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) else {
        if config.enforce_tls {
            bail!("server.enforce_tls is set but no tls_cert/tls_key configured");
        }
        warn!("TLS disabled: vault traffic is only protected by the protocol layer");
        return Ok(None);
    };

    let cert = expand_tilde(cert);
    let key = expand_tilde(key);
    let tls = TlsConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(load_certs(&cert)?, load_key(&key)?)
        .context("building TLS server config")?;
    info!(cert = %cert.display(), "TLS enabled");
    Ok(Some(TlsAcceptor::from(Arc::new(tls))))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening {}", path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .with_context(|| format!("parsing {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificate found in {}", path.display());
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let read = |parse: fn(&mut dyn std::io::BufRead) -> std::io::Result<Vec<Vec<u8>>>| {
        let mut reader = BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        );
        parse(&mut reader).with_context(|| format!("parsing {}", path.display()))
    };

    let mut keys = read(rustls_pemfile::pkcs8_private_keys)?;
    if keys.is_empty() {
        keys = read(rustls_pemfile::rsa_private_keys)?;
    }
    match keys.into_iter().next() {
        Some(key) => Ok(PrivateKey(key)),
        None => bail!("no private key found in {}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_allowed_unless_enforced() {
        let mut config = ServerConfig::default();
        assert!(acceptor(&config).unwrap().is_none());

        config.enforce_tls = true;
        assert!(acceptor(&config).is_err());
    }

    #[test]
    fn test_missing_pem_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pem");
        std::fs::write(&empty, "").unwrap();

        let config = ServerConfig {
            tls_cert: Some(empty.clone()),
            tls_key: Some(empty),
            ..ServerConfig::default()
        };
        let err = acceptor(&config).err().expect("expected an error");
        assert!(err.to_string().contains("no certificate"));
    }
}
