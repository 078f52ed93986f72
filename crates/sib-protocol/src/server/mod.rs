//! Server side of a connection
//!
//! [`ServerConnection`] is the per-connection state machine: it owns the
//! handshake, the established session, the logged-in account and its
//! `KeyHandler`. It consumes one decoded [`ClientMessage`] at a time and
//! returns a [`Reply`]; the I/O lives in [`driver`].
//!
//! ```text
//! Handshake(..) ──OK──▶ AwaitingCommand ──LOGIN/CREATION──▶ Configuration
//!                        ▲      │                              │
//!                        │      └─ DELETION ──▶ Closed          │ CONFIGURATION
//!                        └────── EXPORTATION .. DELETEDATA ◀───┘
//! ```

pub mod driver;

use std::net::IpAddr;
use std::sync::Arc;

use sib_core::{ConfigOutcome, SearchMode};
use sib_crypto::{
    account_filename, client_identity, identities_match, CipherSuite, KeyHandler, MasterSecret,
    UnverifiedRecord,
};
use sib_store::{AccountName, AccountStore, VaultData};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, ProtocolResult};
use crate::handshake::{HandshakeState, ServerHandshake, SessionKeys};
use crate::shield::Shield;
use crate::stream::StreamRecord;
use crate::wire::{ClientMessage, Command, Request, ServerMessage};

pub use driver::{serve_connection, ConnectionObserver, NoopObserver, ServerSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshake(HandshakeState),
    /// Session established, waiting for the next command
    AwaitingCommand,
    /// Logged in or created, waiting for the account's cipher suite
    Configuration,
    /// One command being executed
    Operation(Command),
    Closed,
}

/// What the driver must do with the outcome of one message.
#[derive(Debug, PartialEq, Eq)]
pub enum Reply {
    Send(ServerMessage),
    /// `OK;<count>` followed by the records
    Stream(Vec<StreamRecord>),
    /// Send, then close the transport
    SendAndClose(ServerMessage),
}

struct Account {
    name: AccountName,
    keys: Option<KeyHandler>,
}

pub struct ServerConnection {
    state: ConnectionState,
    handshake: ServerHandshake,
    session: Option<SessionKeys>,
    account: Option<Account>,
    store: Arc<dyn AccountStore>,
    shield: Arc<dyn Shield>,
    peer: IpAddr,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("account", &self.account.as_ref().map(|a| a.name.to_string()))
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    pub fn new(store: Arc<dyn AccountStore>, shield: Arc<dyn Shield>, peer: IpAddr) -> Self {
        Self {
            state: ConnectionState::Handshake(HandshakeState::KeySharing),
            handshake: ServerHandshake::new(),
            session: None,
            account: None,
            store,
            shield,
            peer,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.session.is_some()
    }

    /// The `KEYSHARING` message opening the connection.
    pub fn start(&mut self) -> ProtocolResult<ServerMessage> {
        let msg = self.handshake.start();
        self.state = ConnectionState::Handshake(self.handshake.state());
        msg
    }

    /// Process one message. A fatal error leaves the connection `Closed`; the
    /// caller is expected to send the generic error and drop the transport.
    pub async fn handle(&mut self, msg: ClientMessage) -> ProtocolResult<Reply> {
        let result = self.dispatch(msg).await;
        match &result {
            Err(e) if e.is_fatal() => self.state = ConnectionState::Closed,
            Err(_) => self.state = ConnectionState::AwaitingCommand,
            Ok(_) => {}
        }
        result
    }

    async fn dispatch(&mut self, msg: ClientMessage) -> ProtocolResult<Reply> {
        match self.state {
            ConnectionState::Handshake(_) => self.on_handshake(msg),
            ConnectionState::AwaitingCommand | ConnectionState::Configuration => {
                let (enc_challenge, request) = match msg {
                    ClientMessage::Operation {
                        enc_challenge,
                        request,
                    } => (enc_challenge, request),
                    other => {
                        return Err(ProtocolError::Framing(format!(
                            "{} after the handshake",
                            other.name()
                        )))
                    }
                };
                let command = request.command();
                self.check_allowed(command)?;
                self.session()?.verify(&enc_challenge, command.label())?;
                self.state = ConnectionState::Operation(command);
                debug!(%command, "executing");
                let reply = self.execute(request).await?;
                if let ConnectionState::Operation(_) = self.state {
                    self.state = ConnectionState::AwaitingCommand;
                }
                Ok(reply)
            }
            ConnectionState::Operation(command) => Err(ProtocolError::Framing(format!(
                "{} while {command} is in flight",
                msg.name()
            ))),
            ConnectionState::Closed => Err(ProtocolError::Framing("connection closed".into())),
        }
    }

    fn on_handshake(&mut self, msg: ClientMessage) -> ProtocolResult<Reply> {
        let outcome = self.handshake.handle(&msg);
        self.state = ConnectionState::Handshake(self.handshake.state());
        let (reply, established) = outcome?;
        if let Some(session) = established {
            debug!(peer = %self.peer, "session established");
            self.session = Some(session);
            self.state = ConnectionState::AwaitingCommand;
        }
        Ok(Reply::Send(reply))
    }

    fn check_allowed(&self, command: Command) -> ProtocolResult<()> {
        let logged_in = self.account.is_some();
        let configured = self.account.as_ref().is_some_and(|a| a.keys.is_some());
        let allowed = match (self.state, command) {
            (ConnectionState::Configuration, Command::Configuration) => true,
            (ConnectionState::Configuration, _) => false,
            (_, Command::Login | Command::Creation) => !logged_in,
            (_, Command::Deletion) => true,
            (_, Command::Configuration) => logged_in,
            _ => configured,
        };
        if allowed {
            Ok(())
        } else {
            Err(ProtocolError::Framing(format!(
                "{command} not allowed in state {:?}",
                self.state
            )))
        }
    }

    async fn execute(&mut self, request: Request) -> ProtocolResult<Reply> {
        match request {
            Request::Login { enc_id, enc_login } => self.login(&enc_id, &enc_login).await,
            Request::Creation { enc_id, enc_login } => self.create_account(&enc_id, &enc_login),
            Request::Deletion { enc_id, enc_login } => {
                self.delete_account(&enc_id, &enc_login).await
            }
            Request::Configuration { enc_config } => self.configure(&enc_config).await,
            Request::Exportation => self.export(),
            Request::SearchData { enc_pattern } => self.search(&enc_pattern),
            Request::AddData { record } => self.add(&record).await,
            Request::UpdateData { index, record } => self.update(index, &record).await,
            Request::DeleteData { index } => self.delete(index).await,
        }
    }

    // ── Accounts ─────────────────────────────────────────────────────────────

    /// Decrypt login and claimed identity, recompute the identity and derive
    /// the account key. Mismatches count as a strike.
    fn identify(&self, enc_id: &[u8], enc_login: &[u8]) -> ProtocolResult<AccountName> {
        let session = self.session()?;
        let claimed = session.open(enc_id)?;
        let login = String::from_utf8(session.open(enc_login)?)
            .map_err(|_| ProtocolError::Framing("login is not UTF-8".into()))?;
        let ms = session.master_secret();

        let id = client_identity(ms, &login)?;
        if !identities_match(&id, &claimed) {
            self.shield.add_suspect_ip(self.peer);
            return Err(ProtocolError::Authentication("identity mismatch".into()));
        }
        Ok(AccountName::new(account_filename(ms, &login)?)?)
    }

    /// Exclusive access to `name`'s vault until the guard is dropped.
    async fn lock_account(&self, name: &AccountName) -> OwnedMutexGuard<()> {
        self.store.account_lock(name).lock_owned().await
    }

    async fn login(&mut self, enc_id: &[u8], enc_login: &[u8]) -> ProtocolResult<Reply> {
        let name = self.identify(enc_id, enc_login)?;
        if !self.store.exists(&name)? {
            self.shield.add_suspect_ip(self.peer);
            return Err(ProtocolError::Resource("account does not exist".into()));
        }

        let guard = self.lock_account(&name).await;
        let mut vault = self.store.load(&name)?;
        if let Some(pending) = vault.pending_suite.take() {
            warn!(account = %name, %pending, "rolling back unfinished suite migration");
            self.store.save(&name, &vault)?;
        }
        drop(guard);

        info!(account = %name, "logged in");
        self.account = Some(Account { name, keys: None });
        self.state = ConnectionState::Configuration;
        Ok(Reply::Send(ServerMessage::Ok(None)))
    }

    fn create_account(&mut self, enc_id: &[u8], enc_login: &[u8]) -> ProtocolResult<Reply> {
        let name = self.identify(enc_id, enc_login)?;
        if !self.store.create(&name)? {
            self.shield.add_suspect_ip(self.peer);
            return Err(ProtocolError::Resource("account already exists".into()));
        }

        info!(account = %name, "account created");
        self.account = Some(Account { name, keys: None });
        self.state = ConnectionState::Configuration;
        Ok(Reply::Send(ServerMessage::Ok(None)))
    }

    async fn delete_account(&mut self, enc_id: &[u8], enc_login: &[u8]) -> ProtocolResult<Reply> {
        let name = self.identify(enc_id, enc_login)?;
        let _guard = self.lock_account(&name).await;
        if !self.store.delete(&name)? {
            return Err(ProtocolError::Resource("account does not exist".into()));
        }

        info!(account = %name, "account deleted");
        self.account = None;
        self.state = ConnectionState::Closed;
        Ok(Reply::SendAndClose(ServerMessage::Ok(None)))
    }

    // ── Configuration ────────────────────────────────────────────────────────

    async fn configure(&mut self, enc_config: &[u8]) -> ProtocolResult<Reply> {
        let text = String::from_utf8(self.session()?.open(enc_config)?)
            .map_err(|_| ProtocolError::Configuration("suite is not UTF-8".into()))?;
        let suite: CipherSuite = text.parse()?;
        let canonical = suite.to_string();
        let ms = self.session()?.master_secret().clone();
        let name = self.account()?.name.clone();

        let guard = self.lock_account(&name).await;
        let mut vault = self.store.load(&name)?;
        let stored = vault.suite.clone();
        let outcome = match stored.as_deref() {
            Some(current) if current == canonical => ConfigOutcome::Unchanged,
            Some(current) if !vault.is_empty() => {
                let old: CipherSuite = current.parse()?;
                self.migrate(&name, &mut vault, &ms, old, suite.clone()).await?;
                ConfigOutcome::Installed
            }
            _ => {
                vault.suite = Some(canonical.clone());
                self.store.save(&name, &vault)?;
                ConfigOutcome::Installed
            }
        };
        drop(guard);

        let keys = KeyHandler::new(&ms, suite)?;
        if let Some(account) = self.account.as_mut() {
            account.keys = Some(keys);
        }
        info!(account = %name, suite = %canonical, code = outcome.code(), "configured");
        Ok(Reply::Send(ServerMessage::Ok(Some(outcome.code().to_string()))))
    }

    /// Re-encrypt every record from `old` to `new`. The new records are built
    /// in a copy of the vault which replaces the stored one only once every
    /// record made it; any failure clears the pending marker and leaves the
    /// stored records untouched.
    async fn migrate(
        &self,
        name: &AccountName,
        vault: &mut VaultData,
        ms: &MasterSecret,
        old: CipherSuite,
        new: CipherSuite,
    ) -> ProtocolResult<()> {
        let target = new.to_string();
        vault.pending_suite = Some(target.clone());
        self.store.save(name, vault)?;

        let records = vault.list()?;
        let count = records.len();
        let ms = ms.clone();
        let migrated = tokio::task::spawn_blocking(move || reencrypt_all(&ms, old, new, records))
            .await
            .map_err(|e| ProtocolError::Configuration(format!("migration task failed: {e}")))
            .and_then(|r| r);

        match migrated {
            Ok(records) => {
                let mut next = vault.clone();
                for (index, bytes) in &records {
                    next.put(*index, bytes);
                }
                next.suite = Some(target);
                next.pending_suite = None;
                self.store.save(name, &next)?;
                *vault = next;
                info!(account = %name, count, "records migrated");
                Ok(())
            }
            Err(e) => {
                warn!(account = %name, error = %e, "migration failed, rolling back");
                vault.pending_suite = None;
                self.store.save(name, vault)?;
                Err(e)
            }
        }
    }

    // ── Records ──────────────────────────────────────────────────────────────

    fn export(&self) -> ProtocolResult<Reply> {
        let vault = self.store.load(&self.account()?.name)?;
        let records = vault
            .list()?
            .into_iter()
            .map(|(index, data)| StreamRecord { index, data })
            .collect::<Vec<_>>();
        debug!(count = records.len(), "exporting");
        Ok(Reply::Stream(records))
    }

    fn search(&self, enc_pattern: &[u8]) -> ProtocolResult<Reply> {
        let payload = String::from_utf8(self.session()?.open(enc_pattern)?)
            .map_err(|_| ProtocolError::Framing("search payload is not UTF-8".into()))?;
        let (mode, pattern) = payload
            .split_once(';')
            .ok_or_else(|| ProtocolError::Framing("search payload without mode".into()))?;
        let mode: SearchMode = mode
            .parse()
            .map_err(|_| ProtocolError::Framing(format!("unknown search mode {mode:?}")))?;
        let keys = self.keys()?;

        let vault = self.store.load(&self.account()?.name)?;
        let mut hits = Vec::new();
        for (index, data) in vault.list()? {
            let record = match UnverifiedRecord::from_bytes(&data).and_then(|r| r.verify(keys)) {
                Ok(record) => record,
                Err(e) => {
                    warn!(index, error = %e, "skipping unreadable record");
                    continue;
                }
            };
            if record.matches(keys, pattern, mode == SearchMode::All)? {
                hits.push(StreamRecord { index, data });
            }
        }
        debug!(count = hits.len(), %mode, "search done");
        Ok(Reply::Stream(hits))
    }

    async fn add(&mut self, record: &[u8]) -> ProtocolResult<Reply> {
        UnverifiedRecord::from_bytes(record)?.verify(self.keys()?)?;
        let name = self.account()?.name.clone();
        let _guard = self.lock_account(&name).await;
        let mut vault = self.store.load(&name)?;
        let index = vault.insert_new(record);
        self.store.save(&name, &vault)?;
        debug!(index, "record added");
        Ok(Reply::Send(ServerMessage::Ok(Some(index.to_string()))))
    }

    async fn update(&mut self, index: u64, record: &[u8]) -> ProtocolResult<Reply> {
        UnverifiedRecord::from_bytes(record)?.verify(self.keys()?)?;
        let name = self.account()?.name.clone();
        let _guard = self.lock_account(&name).await;
        let mut vault = self.store.load(&name)?;
        if !vault.put(index, record) {
            return Err(ProtocolError::Resource(format!("no record at index {index}")));
        }
        self.store.save(&name, &vault)?;
        debug!(index, "record updated");
        Ok(Reply::Send(ServerMessage::Ok(None)))
    }

    async fn delete(&mut self, index: u64) -> ProtocolResult<Reply> {
        let name = self.account()?.name.clone();
        let _guard = self.lock_account(&name).await;
        let mut vault = self.store.load(&name)?;
        if !vault.delete(index) {
            return Err(ProtocolError::Resource(format!("no record at index {index}")));
        }
        self.store.save(&name, &vault)?;
        debug!(index, remaining = vault.len(), "record deleted");
        Ok(Reply::Send(ServerMessage::Ok(None)))
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    fn session(&self) -> ProtocolResult<&SessionKeys> {
        self.session
            .as_ref()
            .ok_or_else(|| ProtocolError::Framing("no session established".into()))
    }

    fn account(&self) -> ProtocolResult<&Account> {
        self.account
            .as_ref()
            .ok_or_else(|| ProtocolError::Framing("not logged in".into()))
    }

    fn keys(&self) -> ProtocolResult<&KeyHandler> {
        self.account()?
            .keys
            .as_ref()
            .ok_or_else(|| ProtocolError::Framing("account not configured".into()))
    }
}

fn reencrypt_all(
    ms: &MasterSecret,
    old: CipherSuite,
    new: CipherSuite,
    records: Vec<(u64, Vec<u8>)>,
) -> ProtocolResult<Vec<(u64, Vec<u8>)>> {
    let old = KeyHandler::new(ms, old)?;
    let new = KeyHandler::new(ms, new)?;
    records
        .into_iter()
        .map(|(index, data)| {
            let migrated = UnverifiedRecord::from_bytes(&data)
                .and_then(|r| r.verify(&old))
                .and_then(|r| r.reencrypt(&old, &new))
                .and_then(|r| r.to_bytes())
                .map_err(|e| {
                    ProtocolError::Configuration(format!("record {index} not migrated: {e}"))
                })?;
            Ok((index, migrated))
        })
        .collect()
}
