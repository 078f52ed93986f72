//! Session establishment, run once per connection on both sides
//!
//! ```text
//! server                                   client
//! KeySharing ── KEYSHARING;<pub> ────────▶ KeySharing
//! MasterSecretExchange ◀── SESSION ─────── SessionChallengeRequest
//! SessionChallengeAnswer ── CHALLENGER ──▶ SessionChallengeAnswer
//!            ◀── CHALLENGEA;ECIES(HMAC(ms, session || "S1.13"))
//! Established ── OK ─────────────────────▶ Established
//! ```
//!
//! The state machines are sans-IO: they consume decoded messages and produce
//! the reply. Any error is terminal for the connection.

use std::fmt;

use sib_crypto::{
    challenge, ecies, verify_challenge, KeyPair, MasterSecret, PublicKey, SessionNumber,
    HANDSHAKE_CIPHER, HANDSHAKE_CURVE,
};

use crate::error::{ProtocolError, ProtocolResult};
use crate::labels;
use crate::wire::{ClientMessage, ServerMessage, ENC_CHALLENGE_LEN, PUBKEY_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Server: key not yet sent. Client: waiting for the server key.
    KeySharing,
    /// Server: waiting for SESSION.
    MasterSecretExchange,
    /// Client: SESSION sent, waiting for CHALLENGER.
    SessionChallengeRequest,
    /// Waiting for (server) or awaiting the verdict on (client) the session challenge.
    SessionChallengeAnswer,
    Established,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn unexpected(state: HandshakeState, what: &str) -> ProtocolError {
    ProtocolError::Framing(format!("unexpected {what} in handshake state {state}"))
}

// ── Server ───────────────────────────────────────────────────────────────────

/// Secrets held by the server once the handshake succeeded.
#[derive(Debug)]
pub struct SessionKeys {
    keypair: KeyPair,
    ms: MasterSecret,
    session: SessionNumber,
}

impl SessionKeys {
    pub fn master_secret(&self) -> &MasterSecret {
        &self.ms
    }

    /// Decrypt a request payload sent to the ephemeral key.
    pub fn open(&self, ciphertext: &[u8]) -> ProtocolResult<Vec<u8>> {
        Ok(ecies::decrypt(&self.keypair, HANDSHAKE_CIPHER, ciphertext)?)
    }

    /// Check the encrypted challenge that prefixes a request.
    pub fn verify(&self, enc_challenge: &[u8], label: &str) -> ProtocolResult<()> {
        let candidate = self
            .open(enc_challenge)
            .map_err(|_| ProtocolError::Authentication("undecryptable challenge".into()))?;
        if !verify_challenge(&self.ms, &self.session, label, &candidate)? {
            return Err(ProtocolError::Authentication(format!(
                "challenge mismatch for {label}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct ServerHandshake {
    state: HandshakeState,
    keypair: KeyPair,
    pending: Option<(MasterSecret, SessionNumber)>,
}

impl Default for ServerHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerHandshake {
    /// Generate the per-connection ephemeral keypair.
    pub fn new() -> Self {
        Self {
            state: HandshakeState::KeySharing,
            keypair: KeyPair::generate(HANDSHAKE_CURVE),
            pending: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// First message of the connection.
    pub fn start(&mut self) -> ProtocolResult<ServerMessage> {
        if self.state != HandshakeState::KeySharing {
            return Err(unexpected(self.state, "start"));
        }
        self.state = HandshakeState::MasterSecretExchange;
        Ok(ServerMessage::KeySharing(
            self.keypair.public_key().as_bytes().to_vec(),
        ))
    }

    /// Feed one client message. Returns the reply and, on the final step, the
    /// established session.
    pub fn handle(
        &mut self,
        msg: &ClientMessage,
    ) -> ProtocolResult<(ServerMessage, Option<SessionKeys>)> {
        let result = self.step(msg);
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    fn step(&mut self, msg: &ClientMessage) -> ProtocolResult<(ServerMessage, Option<SessionKeys>)> {
        match (self.state, msg) {
            (
                HandshakeState::MasterSecretExchange,
                ClientMessage::Session {
                    enc_session,
                    enc_master_secret,
                },
            ) => {
                let ms = ecies::decrypt(&self.keypair, HANDSHAKE_CIPHER, enc_master_secret)
                    .and_then(|raw| MasterSecret::from_slice(&raw))
                    .map_err(|_| ProtocolError::Authentication("bad master secret".into()))?;
                let sealed = ecies::decrypt(&self.keypair, HANDSHAKE_CIPHER, enc_session)
                    .map_err(|_| ProtocolError::Authentication("bad session number".into()))?;
                let session = SessionNumber::open(&ms, &sealed)
                    .map_err(|_| ProtocolError::Authentication("bad session number".into()))?;
                self.pending = Some((ms, session));
                self.state = HandshakeState::SessionChallengeAnswer;
                Ok((ServerMessage::ChallengeRequest, None))
            }
            (HandshakeState::SessionChallengeAnswer, ClientMessage::ChallengeAnswer(enc)) => {
                let (ms, session) = self
                    .pending
                    .take()
                    .ok_or_else(|| unexpected(self.state, "CHALLENGEA"))?;
                let established = SessionKeys {
                    keypair: self.keypair.clone(),
                    ms,
                    session,
                };
                established.verify(enc, labels::HANDSHAKE)?;
                self.state = HandshakeState::Established;
                Ok((ServerMessage::Ok(None), Some(established)))
            }
            (state, other) => Err(unexpected(state, other.name())),
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Secrets held by the client once the handshake succeeded.
#[derive(Debug)]
pub struct ClientKeys {
    server_key: PublicKey,
    ms: MasterSecret,
    session: SessionNumber,
}

impl ClientKeys {
    pub fn master_secret(&self) -> &MasterSecret {
        &self.ms
    }

    /// Encrypt a request payload to the server's ephemeral key.
    pub fn seal(&self, plaintext: &[u8]) -> ProtocolResult<Vec<u8>> {
        Ok(ecies::encrypt(&self.server_key, HANDSHAKE_CIPHER, plaintext)?)
    }

    /// The encrypted challenge authorizing one transition.
    pub fn challenge(&self, label: &str) -> ProtocolResult<Vec<u8>> {
        let proof = challenge(&self.ms, &self.session, label)?;
        self.seal(&proof)
    }
}

#[derive(Debug)]
pub struct ClientHandshake {
    state: HandshakeState,
    ms: Option<MasterSecret>,
    keys: Option<ClientKeys>,
}

impl ClientHandshake {
    pub fn new(ms: MasterSecret) -> Self {
        Self {
            state: HandshakeState::KeySharing,
            ms: Some(ms),
            keys: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Feed one server message. Returns the next message to send, if any.
    /// Once [`ClientHandshake::state`] is `Established`, call
    /// [`ClientHandshake::finish`].
    pub fn handle(&mut self, msg: &ServerMessage) -> ProtocolResult<Option<ClientMessage>> {
        let result = self.step(msg);
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    fn step(&mut self, msg: &ServerMessage) -> ProtocolResult<Option<ClientMessage>> {
        match (self.state, msg) {
            (HandshakeState::KeySharing, ServerMessage::KeySharing(key)) => {
                if key.len() != PUBKEY_LEN {
                    return Err(ProtocolError::Framing("bad server key length".into()));
                }
                let server_key = PublicKey::from_bytes(key)?;
                let ms = self
                    .ms
                    .take()
                    .ok_or_else(|| unexpected(self.state, "KEYSHARING"))?;
                let session = SessionNumber::random();

                let enc_session = ecies::encrypt(&server_key, HANDSHAKE_CIPHER, &session.seal(&ms)?)?;
                let enc_master_secret = ecies::encrypt(&server_key, HANDSHAKE_CIPHER, ms.as_bytes())?;
                self.keys = Some(ClientKeys {
                    server_key,
                    ms,
                    session,
                });
                self.state = HandshakeState::SessionChallengeRequest;
                Ok(Some(ClientMessage::Session {
                    enc_session,
                    enc_master_secret,
                }))
            }
            (HandshakeState::SessionChallengeRequest, ServerMessage::ChallengeRequest) => {
                let keys = self
                    .keys
                    .as_ref()
                    .ok_or_else(|| unexpected(self.state, "CHALLENGER"))?;
                let answer = keys.challenge(labels::HANDSHAKE)?;
                debug_assert_eq!(answer.len(), ENC_CHALLENGE_LEN);
                self.state = HandshakeState::SessionChallengeAnswer;
                Ok(Some(ClientMessage::ChallengeAnswer(answer)))
            }
            (HandshakeState::SessionChallengeAnswer, ServerMessage::Ok(None)) => {
                self.state = HandshakeState::Established;
                Ok(None)
            }
            (_, ServerMessage::Error(message)) => Err(ProtocolError::Rejected(message.clone())),
            (state, _) => Err(unexpected(state, "server message")),
        }
    }

    /// Take the established session.
    pub fn finish(self) -> ProtocolResult<ClientKeys> {
        match (self.state, self.keys) {
            (HandshakeState::Established, Some(keys)) => Ok(keys),
            (state, _) => Err(unexpected(state, "finish")),
        }
    }
}
