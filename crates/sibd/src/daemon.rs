//! Daemon lifecycle: store, shield, TLS, metrics, accept loop, shutdown

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use sib_core::config::{expand_tilde, SibConfig};
use sib_protocol::{serve_connection, ServerConnection, ServerSettings, Shield};
use sib_store::{AccountStore, JsonFileStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::metrics::{self, ServerMetrics};
use crate::shield::SuspectTracker;
use crate::tls;

/// Grace period for in-flight connections after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(config: SibConfig) -> Result<()> {
    let store_dir = expand_tilde(&config.server.store_dir);
    let store: Arc<dyn AccountStore> = Arc::new(
        JsonFileStore::open(&store_dir)
            .with_context(|| format!("opening account store {}", store_dir.display()))?,
    );
    info!(dir = %store_dir.display(), "account store ready");

    let shield = Arc::new(SuspectTracker::new(&config.shield));
    let tls = tls::acceptor(&config.server)?;

    let mut registry = Registry::default();
    let metrics = ServerMetrics::new(&mut registry);
    if let Some(addr) = config.server.metrics_addr.clone() {
        let registry = Arc::new(registry);
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, registry).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    let settings = ServerSettings {
        stream_pacing: Duration::from_millis(config.server.stream_pacing_ms),
        mailbox: config.server.mailbox,
        observer: Arc::new(metrics.clone()),
    };

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    let workers = config.server.effective_workers();
    let semaphore = Arc::new(Semaphore::new(workers));
    info!(addr = %config.server.listen, workers, tls = tls.is_some(), "listening");

    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone())?;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (tcp, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                if shield.is_banned(addr.ip()) {
                    metrics.connection("banned");
                    debug!(peer = %addr, "dropping banned peer");
                    continue;
                }

                // Every worker busy: wait for a slot, but not past shutdown
                let Some(permit) = admit(&semaphore, &shutdown).await? else {
                    break;
                };
                metrics.connection("accepted");

                let conn = ServerConnection::new(store.clone(), shield.clone(), addr.ip());
                let span = info_span!("conn", id = %uuid::Uuid::new_v4(), peer = %addr);
                let tls = tls.clone();
                let settings = settings.clone();
                tokio::spawn(
                    async move {
                        let _permit = permit; // released when the connection ends
                        handle(tcp, tls, conn, settings).await;
                    }
                    .instrument(span),
                );
            }
        }
    }

    info!("draining in-flight connections");
    match tokio::time::timeout(DRAIN_TIMEOUT, semaphore.acquire_many(workers as u32)).await {
        Ok(_) => info!("all connections closed"),
        Err(_) => warn!("drain timed out, exiting with connections still open"),
    }
    info!("sibd exiting cleanly");
    Ok(())
}

/// Cancel `shutdown` on the first SIGTERM or SIGINT.
fn watch_signals(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        shutdown.cancel();
    });
    Ok(())
}

/// A connection slot, or None once shutdown has begun.
async fn admit(
    semaphore: &Arc<Semaphore>,
    shutdown: &CancellationToken,
) -> Result<Option<OwnedSemaphorePermit>> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Ok(None),
        permit = semaphore.clone().acquire_owned() => {
            Ok(Some(permit.context("connection semaphore closed")?))
        }
    }
}

async fn handle(
    tcp: TcpStream,
    tls: Option<TlsAcceptor>,
    conn: ServerConnection,
    settings: ServerSettings,
) {
    debug!("connection accepted");
    match tls {
        Some(acceptor) => match acceptor.accept(tcp).await {
            Ok(stream) => serve(stream, conn, settings).await,
            Err(e) => warn!("TLS handshake failed: {e}"),
        },
        None => serve(tcp, conn, settings).await,
    }
}

async fn serve<S>(io: S, conn: ServerConnection, settings: ServerSettings)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    match serve_connection(io, conn, settings).await {
        Ok(()) => debug!("connection closed"),
        Err(e) => info!(error = %e, "connection closed on error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admit_gives_up_on_shutdown() {
        let semaphore = Arc::new(Semaphore::new(1));
        let shutdown = CancellationToken::new();
        let held = admit(&semaphore, &shutdown).await.unwrap().unwrap();

        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let waiting = tokio::time::timeout(Duration::from_secs(5), admit(&semaphore, &shutdown))
            .await
            .expect("shutdown must end the wait for a slot");
        assert!(waiting.unwrap().is_none());
        drop(held);
    }

    #[tokio::test]
    async fn test_admit_prefers_shutdown_over_free_slot() {
        let semaphore = Arc::new(Semaphore::new(1));
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(admit(&semaphore, &shutdown).await.unwrap().is_none());
        assert_eq!(semaphore.available_permits(), 1);
    }
}
