//! sib-protocol: the SIBVault wire protocol
//!
//! Layers, bottom up:
//!   - [`wire`] / [`stream`]: incremental decoding of the `;`-delimited,
//!     length-prefixed messages and of streamed records
//!   - [`handshake`]: ephemeral key sharing, master secret and session number
//!     exchange, session challenge
//!   - [`server`]: per-connection command state machine and its I/O driver
//!   - [`client`]: typed session over any byte stream, plus a FIFO dispatcher
//!     reporting to a [`Notifier`]
//!
//! Every post-handshake message carries a fresh challenge
//! `ECIES(HMAC-SHA256(ms, session || label))` whose label names the command,
//! see [`labels`].

pub mod client;
pub mod error;
pub mod handshake;
pub mod labels;
pub mod notify;
pub mod server;
pub mod shield;
pub mod stream;
pub mod wire;

pub use client::{ClientSession, Credentials, Dispatcher, ExportFormat, Transport, VaultCommand};
pub use error::{ProtocolError, ProtocolResult, GENERIC_ERROR};
pub use handshake::HandshakeState;
pub use notify::{ClearRecord, ClientEvent, Notifier};
pub use server::{
    serve_connection, ConnectionObserver, ConnectionState, NoopObserver, Reply, ServerConnection,
    ServerSettings,
};
pub use shield::{NoShield, Shield};
pub use wire::{ClientMessage, Command, Frame, FrameBuffer, Request, ServerMessage};
