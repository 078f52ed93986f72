//! Client side of a connection
//!
//! [`ClientSession::connect`] runs the handshake over any async byte stream
//! (TCP, TLS, an in-memory duplex in tests); the typed operations then map
//! one-to-one onto the wire commands. Every network step is bounded by the
//! session timeout.

pub mod dispatcher;

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use secrecy::SecretString;
use sib_core::{ConfigOutcome, SearchMode};
use sib_crypto::{
    client_identity, derive_master_secret, CipherSuite, KeyHandler, MasterSecret, Pbkdf2Params,
    SecretRecord, UnverifiedRecord,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::error::{ProtocolError, ProtocolResult};
use crate::handshake::{ClientHandshake, ClientKeys, HandshakeState};
use crate::stream::{parse_header, StreamAssembler};
use crate::wire::{ClientMessage, Command, Frame, FrameBuffer, Request, ServerMessage};

pub use dispatcher::{Dispatcher, ExportFormat, VaultCommand};

const READ_CHUNK: usize = 8 * 1024;

/// Any byte stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Login plus the master secret derived from the password.
pub struct Credentials {
    login: String,
    ms: MasterSecret,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Run PBKDF2 off the async runtime.
    pub async fn derive(
        login: impl Into<String>,
        password: SecretString,
        params: Pbkdf2Params,
    ) -> ProtocolResult<Self> {
        let login = login.into();
        let salt = login.clone();
        let ms = tokio::task::spawn_blocking(move || {
            derive_master_secret(&password, &salt, &params)
        })
        .await
        .map_err(|e| ProtocolError::Resource(format!("key derivation task failed: {e}")))??;
        Ok(Self { login, ms })
    }

    pub fn from_master_secret(login: impl Into<String>, ms: MasterSecret) -> Self {
        Self {
            login: login.into(),
            ms,
        }
    }

    pub fn login(&self) -> &str {
        &self.login
    }
}

/// Framed reads and writes over the transport.
struct Channel<S> {
    io: S,
    frames: FrameBuffer,
}

impl<S: Transport> Channel<S> {
    async fn send(&mut self, msg: &ClientMessage) -> ProtocolResult<()> {
        self.io.write_all(&msg.to_bytes()).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Read more bytes into the frame buffer; EOF is a transport error.
    async fn fill(&mut self) -> ProtocolResult<()> {
        let mut chunk = BytesMut::with_capacity(READ_CHUNK);
        if self.io.read_buf(&mut chunk).await? == 0 {
            return Err(ProtocolError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the connection",
            )));
        }
        self.frames.extend(&chunk);
        Ok(())
    }

    async fn recv<T: Frame>(&mut self) -> ProtocolResult<T> {
        loop {
            if let Some(frame) = self.frames.next_frame::<T>()? {
                return Ok(frame);
            }
            self.fill().await?;
        }
    }
}

async fn within<T>(
    limit: Duration,
    fut: impl Future<Output = ProtocolResult<T>>,
) -> ProtocolResult<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ProtocolError::Timeout(limit))?
}

fn expect_ok(reply: ServerMessage) -> ProtocolResult<Option<String>> {
    match reply {
        ServerMessage::Ok(payload) => Ok(payload),
        ServerMessage::Error(message) => Err(ProtocolError::Rejected(message)),
        other => Err(ProtocolError::Framing(format!("unexpected reply {other:?}"))),
    }
}

pub struct ClientSession<S> {
    channel: Channel<S>,
    keys: ClientKeys,
    login: String,
    handler: Option<KeyHandler>,
    timeout: Duration,
}

impl<S> std::fmt::Debug for ClientSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("login", &self.login)
            .field("configured", &self.handler.is_some())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<S: Transport> ClientSession<S> {
    /// Run the handshake over `io`.
    pub async fn connect(io: S, creds: Credentials, timeout: Duration) -> ProtocolResult<Self> {
        let mut channel = Channel {
            io,
            frames: FrameBuffer::new(),
        };
        let Credentials { login, ms } = creds;
        let keys = within(timeout, handshake(&mut channel, ms)).await?;
        debug!("session established");
        Ok(Self {
            channel,
            keys,
            login,
            handler: None,
            timeout,
        })
    }

    pub fn login_name(&self) -> &str {
        &self.login
    }

    pub fn master_secret(&self) -> &MasterSecret {
        self.keys.master_secret()
    }

    /// Key handler of the configured suite.
    pub fn key_handler(&self) -> ProtocolResult<&KeyHandler> {
        self.handler
            .as_ref()
            .ok_or_else(|| ProtocolError::Configuration("no cipher suite configured".into()))
    }

    pub async fn login(&mut self) -> ProtocolResult<()> {
        within(self.timeout, self.account_request(Command::Login)).await?;
        info!("logged in");
        Ok(())
    }

    pub async fn create_account(&mut self) -> ProtocolResult<()> {
        within(self.timeout, self.account_request(Command::Creation)).await?;
        info!("account created");
        Ok(())
    }

    /// Delete the account. The server closes the connection afterwards.
    pub async fn delete_account(&mut self) -> ProtocolResult<()> {
        within(self.timeout, self.account_request(Command::Deletion)).await?;
        self.handler = None;
        info!("account deleted");
        Ok(())
    }

    /// Install `suite` for the account, migrating stored records if needed.
    pub async fn configure(&mut self, suite: CipherSuite) -> ProtocolResult<ConfigOutcome> {
        let enc_config = self.keys.seal(suite.to_string().as_bytes())?;
        let payload = within(
            self.timeout,
            self.request(Request::Configuration { enc_config }),
        )
        .await?;
        let outcome = payload
            .as_deref()
            .and_then(ConfigOutcome::from_code)
            .ok_or_else(|| ProtocolError::Framing(format!("bad configuration code {payload:?}")))?;
        self.handler = Some(KeyHandler::new(self.keys.master_secret(), suite)?);
        Ok(outcome)
    }

    /// Every record of the vault, verified under the configured suite.
    pub async fn export(&mut self) -> ProtocolResult<Vec<(u64, SecretRecord)>> {
        self.key_handler()?;
        within(self.timeout, self.streamed(Request::Exportation)).await
    }

    pub async fn search(
        &mut self,
        pattern: &str,
        mode: SearchMode,
    ) -> ProtocolResult<Vec<(u64, SecretRecord)>> {
        self.key_handler()?;
        let enc_pattern = self.keys.seal(format!("{mode};{pattern}").as_bytes())?;
        within(self.timeout, self.streamed(Request::SearchData { enc_pattern })).await
    }

    /// Store a sealed record; returns its index.
    pub async fn add(&mut self, record: &SecretRecord) -> ProtocolResult<u64> {
        let record = record.to_bytes()?;
        let payload = within(self.timeout, self.request(Request::AddData { record })).await?;
        payload
            .as_deref()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| ProtocolError::Framing(format!("bad index {payload:?}")))
    }

    pub async fn update(&mut self, index: u64, record: &SecretRecord) -> ProtocolResult<()> {
        let record = record.to_bytes()?;
        within(
            self.timeout,
            self.request(Request::UpdateData { index, record }),
        )
        .await?;
        Ok(())
    }

    pub async fn delete(&mut self, index: u64) -> ProtocolResult<()> {
        within(self.timeout, self.request(Request::DeleteData { index })).await?;
        Ok(())
    }

    pub async fn close(mut self) -> ProtocolResult<()> {
        self.channel.io.shutdown().await?;
        Ok(())
    }

    async fn account_request(&mut self, command: Command) -> ProtocolResult<()> {
        let id = client_identity(self.keys.master_secret(), &self.login)?;
        let enc_id = self.keys.seal(&id)?;
        let enc_login = self.keys.seal(self.login.as_bytes())?;
        let request = match command {
            Command::Login => Request::Login { enc_id, enc_login },
            Command::Creation => Request::Creation { enc_id, enc_login },
            _ => Request::Deletion { enc_id, enc_login },
        };
        self.request(request).await?;
        Ok(())
    }

    async fn request(&mut self, request: Request) -> ProtocolResult<Option<String>> {
        let msg = ClientMessage::Operation {
            enc_challenge: self.keys.challenge(request.command().label())?,
            request,
        };
        self.channel.send(&msg).await?;
        expect_ok(self.channel.recv::<ServerMessage>().await?)
    }

    async fn streamed(&mut self, request: Request) -> ProtocolResult<Vec<(u64, SecretRecord)>> {
        let header = self.request(request).await?;
        let mut assembler = StreamAssembler::new(parse_header(header.as_deref())?);
        while !assembler.feed(&mut self.channel.frames)? {
            self.channel.fill().await?;
        }

        let kh = self.key_handler()?;
        assembler
            .into_records()
            .into_iter()
            .map(|r| -> ProtocolResult<(u64, SecretRecord)> {
                let record = UnverifiedRecord::from_bytes(&r.data)?.verify(kh)?;
                Ok((r.index, record))
            })
            .collect()
    }
}

async fn handshake<S: Transport>(
    channel: &mut Channel<S>,
    ms: MasterSecret,
) -> ProtocolResult<ClientKeys> {
    let mut hs = ClientHandshake::new(ms);
    while hs.state() != HandshakeState::Established {
        let msg = channel.recv::<ServerMessage>().await?;
        if let Some(reply) = hs.handle(&msg)? {
            channel.send(&reply).await?;
        }
    }
    hs.finish()
}
