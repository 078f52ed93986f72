//! Per-connection I/O driver
//!
//! A reader task pushes raw chunks into a bounded mailbox; the processing
//! loop owns the [`ServerConnection`], the frame buffer and the write half,
//! so exactly one transition is in flight and messages are handled in arrival
//! order.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Reply, ServerConnection};
use crate::error::{ProtocolError, ProtocolResult, GENERIC_ERROR};
use crate::stream::{encode_header, StreamRecord};
use crate::wire::{ClientMessage, Command, Frame, FrameBuffer, ServerMessage};

const READ_CHUNK: usize = 8 * 1024;

/// Hooks for connection-level accounting (metrics).
pub trait ConnectionObserver: Send + Sync {
    fn on_handshake(&self, _ok: bool) {}
    fn on_operation(&self, _command: Command, _ok: bool) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}

#[derive(Clone)]
pub struct ServerSettings {
    /// Pause between two streamed records
    pub stream_pacing: Duration,
    /// Inbound chunks buffered before the reader waits
    pub mailbox: usize,
    pub observer: Arc<dyn ConnectionObserver>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            stream_pacing: Duration::from_millis(5),
            mailbox: 32,
            observer: Arc::new(NoopObserver),
        }
    }
}

impl std::fmt::Debug for ServerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSettings")
            .field("stream_pacing", &self.stream_pacing)
            .field("mailbox", &self.mailbox)
            .finish_non_exhaustive()
    }
}

/// Run one connection to completion.
///
/// Returns `Ok(())` when the peer hangs up or the account was deleted. On a
/// fatal error the peer gets the generic `ERROR` line (best effort) before the
/// transport is shut down, and the error is returned for logging.
pub async fn serve_connection<S>(
    io: S,
    mut conn: ServerConnection,
    settings: ServerSettings,
) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(io);
    let (tx, mut rx) = mpsc::channel::<std::io::Result<Bytes>>(settings.mailbox.max(1));

    let reader = tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        loop {
            buf.reserve(READ_CHUNK);
            match rd.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(Ok(buf.split().freeze())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });

    let result = process(&mut wr, &mut rx, &mut conn, &settings).await;
    reader.abort();

    if let Err(e) = &result {
        warn!(error = %e, state = ?conn.state(), "closing connection");
        if !matches!(e, ProtocolError::Transport(_)) {
            let _ = send(&mut wr, &ServerMessage::Error(GENERIC_ERROR.into())).await;
        }
    }
    let _ = wr.shutdown().await;
    result
}

async fn process<S: AsyncWrite>(
    wr: &mut WriteHalf<S>,
    rx: &mut mpsc::Receiver<std::io::Result<Bytes>>,
    conn: &mut ServerConnection,
    settings: &ServerSettings,
) -> ProtocolResult<()> {
    let hello = conn.start()?;
    send(wr, &hello).await?;

    let mut frames = FrameBuffer::new();
    loop {
        while let Some(msg) = frames.next_frame::<ClientMessage>()? {
            let was_established = conn.is_established();
            let command = match &msg {
                ClientMessage::Operation { request, .. } => Some(request.command()),
                _ => None,
            };
            let result = conn.handle(msg).await;

            if !was_established && (conn.is_established() || result.is_err()) {
                settings.observer.on_handshake(result.is_ok());
            }
            if let (Some(command), true) = (command, was_established) {
                settings.observer.on_operation(command, result.is_ok());
            }

            match result {
                Ok(Reply::Send(reply)) => send(wr, &reply).await?,
                Ok(Reply::Stream(records)) => stream(wr, &records, settings.stream_pacing).await?,
                Ok(Reply::SendAndClose(reply)) => {
                    send(wr, &reply).await?;
                    debug!("closing after final reply");
                    return Ok(());
                }
                Err(e) if !e.is_fatal() => {
                    warn!(error = %e, "request rejected");
                    send(wr, &ServerMessage::Error(GENERIC_ERROR.into())).await?;
                }
                Err(e) => return Err(e),
            }
        }

        match rx.recv().await {
            Some(Ok(chunk)) => frames.extend(&chunk),
            Some(Err(e)) => return Err(e.into()),
            None => {
                if !frames.is_empty() {
                    debug!(pending = frames.len(), "peer closed mid-message");
                }
                return Ok(());
            }
        }
    }
}

async fn send<S: AsyncWrite>(wr: &mut WriteHalf<S>, msg: &ServerMessage) -> ProtocolResult<()> {
    wr.write_all(&msg.to_bytes()).await?;
    wr.flush().await?;
    Ok(())
}

async fn stream<S: AsyncWrite>(
    wr: &mut WriteHalf<S>,
    records: &[StreamRecord],
    pacing: Duration,
) -> ProtocolResult<()> {
    send(wr, &encode_header(records.len())).await?;
    for record in records {
        if !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
        wr.write_all(&record.to_bytes()).await?;
        wr.flush().await?;
    }
    Ok(())
}
