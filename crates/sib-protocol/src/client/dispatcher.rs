//! FIFO command dispatcher
//!
//! Front ends submit [`VaultCommand`]s; a single worker task executes them one
//! at a time against the [`ClientSession`] and reports through a
//! [`Notifier`]. `disconnect()` cancels the command in flight, drops whatever
//! it had accumulated and closes the transport.

use std::path::PathBuf;
use std::sync::Arc;

use sib_core::SearchMode;
use sib_crypto::{export_clear, export_encrypted, import, CipherSuite, ExportFile, SecretRecord};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ClientSession, Transport};
use crate::error::{ProtocolError, ProtocolResult};
use crate::notify::{ClearRecord, ClientEvent, Notifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Clear,
    Encrypted,
}

#[derive(Debug, Clone)]
pub enum VaultCommand {
    /// Decrypt and list every record
    Export,
    /// Produce an export file; `destination` comes back in the event so the
    /// front end knows where to write it
    ExportFile {
        format: ExportFormat,
        destination: PathBuf,
    },
    /// Add every record of an export file
    Import { file: ExportFile },
    Search { pattern: String, mode: SearchMode },
    Add { values: Vec<String> },
    Update { index: u64, values: Vec<String> },
    Delete { index: u64 },
    Configure { suite: CipherSuite },
    DeleteAccount,
}

impl VaultCommand {
    fn name(&self) -> &'static str {
        match self {
            VaultCommand::Export => "export",
            VaultCommand::ExportFile { .. } => "export-file",
            VaultCommand::Import { .. } => "import",
            VaultCommand::Search { .. } => "search",
            VaultCommand::Add { .. } => "add",
            VaultCommand::Update { .. } => "update",
            VaultCommand::Delete { .. } => "delete",
            VaultCommand::Configure { .. } => "configure",
            VaultCommand::DeleteAccount => "delete-account",
        }
    }
}

pub struct Dispatcher {
    tx: mpsc::UnboundedSender<VaultCommand>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl Dispatcher {
    /// Start the worker. The session must be logged in and configured.
    pub fn spawn<S>(session: ClientSession<S>, notifier: Arc<dyn Notifier>) -> Self
    where
        S: Transport + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(run(session, rx, notifier, cancel.clone()));
        Self { tx, cancel, worker }
    }

    /// Queue a command behind the ones already submitted.
    pub fn submit(&self, command: VaultCommand) -> ProtocolResult<()> {
        self.tx.send(command).map_err(|_| ProtocolError::Cancelled)
    }

    /// Let every queued command run, then close the session.
    pub async fn finish(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            warn!("dispatcher worker ended abnormally: {e}");
        }
    }

    /// Cancel the command in flight, drop the queue and close the session.
    pub async fn disconnect(self) {
        self.cancel.cancel();
        drop(self.tx);
        if let Err(e) = self.worker.await {
            warn!("dispatcher worker ended abnormally: {e}");
        }
    }
}

async fn run<S: Transport>(
    mut session: ClientSession<S>,
    mut rx: mpsc::UnboundedReceiver<VaultCommand>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
) {
    // Shared by every command; always empty between two commands
    let mut accumulated: Vec<ClearRecord> = Vec::new();

    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(command) => command,
                None => break,
            },
        };
        let name = command.name();
        debug!(command = name, "dispatching");
        let account_deleted = matches!(command, VaultCommand::DeleteAccount);

        accumulated.clear();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
            result = execute(&mut session, command, &mut accumulated) => result,
        };
        if outcome.is_err() {
            accumulated.clear();
        }

        match outcome {
            Ok(event) => {
                notifier.notify(event);
                if account_deleted {
                    notifier.notify(ClientEvent::Disconnected);
                    return;
                }
            }
            Err(ProtocolError::Cancelled) => {
                debug!(command = name, "cancelled");
                break;
            }
            Err(e) if !e.is_fatal() => {
                warn!(command = name, error = %e, "command failed");
                notifier.notify(ClientEvent::Status(e.status()));
            }
            Err(e) => {
                warn!(command = name, error = %e, "session lost");
                notifier.notify(ClientEvent::Failed(e.status()));
                notifier.notify(ClientEvent::Disconnected);
                return;
            }
        }
    }

    if let Err(e) = session.close().await {
        debug!(error = %e, "close failed");
    }
    notifier.notify(ClientEvent::Disconnected);
}

async fn execute<S: Transport>(
    session: &mut ClientSession<S>,
    command: VaultCommand,
    accumulated: &mut Vec<ClearRecord>,
) -> ProtocolResult<ClientEvent> {
    match command {
        VaultCommand::Export => {
            let records = session.export().await?;
            collect(session, records, accumulated)?;
            Ok(ClientEvent::Records(std::mem::take(accumulated)))
        }
        VaultCommand::Search { pattern, mode } => {
            let records = session.search(&pattern, mode).await?;
            collect(session, records, accumulated)?;
            Ok(ClientEvent::Records(std::mem::take(accumulated)))
        }
        VaultCommand::ExportFile {
            format,
            destination,
        } => {
            let records: Vec<SecretRecord> =
                session.export().await?.into_iter().map(|(_, r)| r).collect();
            let kh = session.key_handler()?;
            let file = match format {
                ExportFormat::Clear => export_clear(kh, &records)?,
                ExportFormat::Encrypted => export_encrypted(kh, &records)?,
            };
            Ok(ClientEvent::Exported { destination, file })
        }
        VaultCommand::Import { file } => {
            let records = import(session.master_secret(), session.key_handler()?, &file)?;
            for record in &records {
                session.add(record).await?;
            }
            Ok(ClientEvent::Status(format!("imported {} records", records.len())))
        }
        VaultCommand::Add { values } => {
            let record = SecretRecord::encrypt(session.key_handler()?, &values)?;
            Ok(ClientEvent::Added(session.add(&record).await?))
        }
        VaultCommand::Update { index, values } => {
            let record = SecretRecord::encrypt(session.key_handler()?, &values)?;
            session.update(index, &record).await?;
            Ok(ClientEvent::Updated(index))
        }
        VaultCommand::Delete { index } => {
            session.delete(index).await?;
            Ok(ClientEvent::Deleted(index))
        }
        VaultCommand::Configure { suite } => {
            Ok(ClientEvent::Configured(session.configure(suite).await?))
        }
        VaultCommand::DeleteAccount => {
            session.delete_account().await?;
            Ok(ClientEvent::AccountDeleted)
        }
    }
}

fn collect<S: Transport>(
    session: &ClientSession<S>,
    records: Vec<(u64, SecretRecord)>,
    accumulated: &mut Vec<ClearRecord>,
) -> ProtocolResult<()> {
    let kh = session.key_handler()?;
    for (index, record) in records {
        let fields = record
            .decrypt_all(kh)?
            .into_iter()
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .collect();
        accumulated.push(ClearRecord { index, fields });
    }
    Ok(())
}
