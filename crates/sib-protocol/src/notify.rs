//! Client-side notification sink
//!
//! The dispatcher reports every outcome through a [`Notifier`]; a terminal or
//! graphical front end only has to consume [`ClientEvent`]s.

use std::path::PathBuf;

use sib_core::ConfigOutcome;
use sib_crypto::ExportFile;
use tokio::sync::mpsc;

/// One decrypted record as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearRecord {
    pub index: u64,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Human-readable progress or error text
    Status(String),
    /// Result of an export or a search
    Records(Vec<ClearRecord>),
    /// Export file ready to be written to `destination`
    Exported {
        destination: PathBuf,
        file: ExportFile,
    },
    Added(u64),
    Updated(u64),
    Deleted(u64),
    Configured(ConfigOutcome),
    AccountDeleted,
    Disconnected,
    /// The session hit a fatal error and is gone
    Failed(String),
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: ClientEvent);
}

impl Notifier for mpsc::UnboundedSender<ClientEvent> {
    fn notify(&self, event: ClientEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.send(event);
    }
}
