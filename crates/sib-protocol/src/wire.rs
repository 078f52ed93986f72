//! Wire format and incremental decoding
//!
//! Outer messages end with `\n`; embedded binary fields are either fixed-width
//! or preceded by `<decimal len>;`, so they may contain any byte:
//! ```text
//! server: KEYSHARING;<65 pubkey>\n | CHALLENGER\n | OK\n | OK;<ascii>\n | ERROR;<ascii>\n
//! client: SESSION;<len>;<encSession>;<157 encMs>\n
//!         CHALLENGEA;<125 encChallenge>\n
//!         <125 encChallenge>;<TAG>[;<fields>]\n
//! ```
//!
//! Decoders never block: they return a message with the number of bytes it
//! used, `None` when more bytes are needed, or a framing error.

use bytes::{Buf, BufMut, BytesMut};

use sib_crypto::{ecies, HANDSHAKE_CIPHER, HANDSHAKE_CURVE};

use crate::error::{ProtocolError, ProtocolResult};
use crate::labels;

/// Encoded ephemeral public key (uncompressed P-256 point)
pub const PUBKEY_LEN: usize = 65;

/// ECIES ciphertext of a 32-byte challenge or identity
pub const ENC_CHALLENGE_LEN: usize = 125;

/// ECIES ciphertext of the 64-byte master secret
pub const ENC_MASTER_SECRET_LEN: usize = 157;

/// Upper bound on any declared field length
pub const MAX_DECLARED_LEN: usize = 16 * 1024 * 1024;

const MAX_TAG_LEN: usize = 16;
const MAX_ASCII_LEN: usize = 1024;
const MAX_DIGITS: usize = 20;

/// A message that can be written to and incrementally read from a byte stream.
pub trait Frame: Sized {
    fn encode(&self, out: &mut BytesMut);

    /// Decode one message from the front of `buf`.
    fn decode(buf: &[u8]) -> ProtocolResult<Option<(Self, usize)>>;

    fn to_bytes(&self) -> BytesMut {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out
    }
}

/// Accumulates socket reads and yields complete frames, leaving any trailing
/// bytes buffered for the next one.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next_frame<T: Frame>(&mut self) -> ProtocolResult<Option<T>> {
        match T::decode(&self.buf)? {
            Some((frame, used)) => {
                self.buf.advance(used);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// ── Server → client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// `KEYSHARING;<pubkey>`
    KeySharing(Vec<u8>),
    /// `CHALLENGER`
    ChallengeRequest,
    /// `OK` or `OK;<payload>`
    Ok(Option<String>),
    /// `ERROR;<message>`
    Error(String),
}

impl Frame for ServerMessage {
    fn encode(&self, out: &mut BytesMut) {
        match self {
            ServerMessage::KeySharing(key) => {
                out.put_slice(b"KEYSHARING;");
                out.put_slice(key);
            }
            ServerMessage::ChallengeRequest => out.put_slice(b"CHALLENGER"),
            ServerMessage::Ok(None) => out.put_slice(b"OK"),
            ServerMessage::Ok(Some(payload)) => {
                out.put_slice(b"OK;");
                out.put_slice(payload.as_bytes());
            }
            ServerMessage::Error(message) => {
                out.put_slice(b"ERROR;");
                out.put_slice(message.as_bytes());
            }
        }
        out.put_u8(b'\n');
    }

    fn decode(buf: &[u8]) -> ProtocolResult<Option<(Self, usize)>> {
        let mut r = Reader::new(buf);
        let step = decode_server(&mut r);
        finish(step, &r)
    }
}

fn decode_server(r: &mut Reader<'_>) -> Step<ServerMessage> {
    let (tag, delim) = r.token(b";\n", MAX_TAG_LEN)?;
    let msg = match (tag, delim) {
        (b"KEYSHARING", b';') => {
            let key = r.fixed(PUBKEY_LEN)?.to_vec();
            r.end()?;
            ServerMessage::KeySharing(key)
        }
        (b"CHALLENGER", b'\n') => ServerMessage::ChallengeRequest,
        (b"OK", b'\n') => ServerMessage::Ok(None),
        (b"OK", b';') => ServerMessage::Ok(Some(r.ascii_line()?)),
        (b"ERROR", b';') => ServerMessage::Error(r.ascii_line()?),
        _ => {
            return Err(Halt::invalid(format!(
                "unknown server message {:?}",
                ascii(tag)
            )))
        }
    };
    Ok(msg)
}

// ── Client → server ──────────────────────────────────────────────────────────

/// Post-handshake commands, each bound to its own transition label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Login,
    Creation,
    Deletion,
    Configuration,
    Exportation,
    SearchData,
    AddData,
    UpdateData,
    DeleteData,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::Login,
        Command::Creation,
        Command::Deletion,
        Command::Configuration,
        Command::Exportation,
        Command::SearchData,
        Command::AddData,
        Command::UpdateData,
        Command::DeleteData,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Command::Login => "LOGIN",
            Command::Creation => "CREATION",
            Command::Deletion => "DELETION",
            Command::Configuration => "CONFIGURATION",
            Command::Exportation => "EXPORTATION",
            Command::SearchData => "SEARCHDATA",
            Command::AddData => "ADDDATA",
            Command::UpdateData => "UPDATEDATA",
            Command::DeleteData => "DELETEDATA",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Command::Login => labels::LOGIN,
            Command::Creation => labels::CREATION,
            Command::Deletion => labels::DELETION,
            Command::Configuration => labels::CONFIGURATION,
            Command::Exportation => labels::EXPORTATION,
            Command::SearchData => labels::SEARCHDATA,
            Command::AddData => labels::ADDDATA,
            Command::UpdateData => labels::UPDATEDATA,
            Command::DeleteData => labels::DELETEDATA,
        }
    }

    fn from_tag(tag: &[u8]) -> Option<Command> {
        Command::ALL.into_iter().find(|c| c.tag().as_bytes() == tag)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Operation-specific fields of a post-handshake message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Login { enc_id: Vec<u8>, enc_login: Vec<u8> },
    Creation { enc_id: Vec<u8>, enc_login: Vec<u8> },
    Deletion { enc_id: Vec<u8>, enc_login: Vec<u8> },
    Configuration { enc_config: Vec<u8> },
    Exportation,
    SearchData { enc_pattern: Vec<u8> },
    AddData { record: Vec<u8> },
    UpdateData { index: u64, record: Vec<u8> },
    DeleteData { index: u64 },
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Login { .. } => Command::Login,
            Request::Creation { .. } => Command::Creation,
            Request::Deletion { .. } => Command::Deletion,
            Request::Configuration { .. } => Command::Configuration,
            Request::Exportation => Command::Exportation,
            Request::SearchData { .. } => Command::SearchData,
            Request::AddData { .. } => Command::AddData,
            Request::UpdateData { .. } => Command::UpdateData,
            Request::DeleteData { .. } => Command::DeleteData,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// `SESSION;<len>;<encSession>;<encMasterSecret>`
    Session {
        enc_session: Vec<u8>,
        enc_master_secret: Vec<u8>,
    },
    /// `CHALLENGEA;<encChallenge>`
    ChallengeAnswer(Vec<u8>),
    /// `<encChallenge>;<TAG>...`
    Operation {
        enc_challenge: Vec<u8>,
        request: Request,
    },
}

impl ClientMessage {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Session { .. } => "SESSION",
            ClientMessage::ChallengeAnswer(_) => "CHALLENGEA",
            ClientMessage::Operation { request, .. } => request.command().tag(),
        }
    }
}

impl Frame for ClientMessage {
    fn encode(&self, out: &mut BytesMut) {
        match self {
            ClientMessage::Session {
                enc_session,
                enc_master_secret,
            } => {
                out.put_slice(b"SESSION;");
                put_sized(out, enc_session);
                out.put_u8(b';');
                out.put_slice(enc_master_secret);
            }
            ClientMessage::ChallengeAnswer(enc) => {
                out.put_slice(b"CHALLENGEA;");
                out.put_slice(enc);
            }
            ClientMessage::Operation {
                enc_challenge,
                request,
            } => {
                out.put_slice(enc_challenge);
                out.put_u8(b';');
                out.put_slice(request.command().tag().as_bytes());
                match request {
                    Request::Login { enc_id, enc_login }
                    | Request::Creation { enc_id, enc_login }
                    | Request::Deletion { enc_id, enc_login } => {
                        out.put_u8(b';');
                        out.put_slice(enc_id);
                        out.put_u8(b';');
                        put_sized(out, enc_login);
                    }
                    Request::Configuration { enc_config: data }
                    | Request::SearchData { enc_pattern: data }
                    | Request::AddData { record: data } => {
                        out.put_u8(b';');
                        put_sized(out, data);
                    }
                    Request::Exportation => {}
                    Request::UpdateData { index, record } => {
                        out.put_u8(b';');
                        out.put_slice(index.to_string().as_bytes());
                        out.put_u8(b';');
                        put_sized(out, record);
                    }
                    Request::DeleteData { index } => {
                        out.put_u8(b';');
                        out.put_slice(index.to_string().as_bytes());
                    }
                }
            }
        }
        out.put_u8(b'\n');
    }

    fn decode(buf: &[u8]) -> ProtocolResult<Option<(Self, usize)>> {
        let mut r = Reader::new(buf);
        let step = decode_client(&mut r);
        finish(step, &r)
    }
}

fn decode_client(r: &mut Reader<'_>) -> Step<ClientMessage> {
    let first = *r.remaining().first().ok_or(Halt::Incomplete)?;
    let msg = match first {
        b'S' => {
            r.literal(b"SESSION;")?;
            let enc_session = r.sized()?.to_vec();
            r.literal(b";")?;
            let enc_master_secret = r.fixed(ENC_MASTER_SECRET_LEN)?.to_vec();
            r.end()?;
            ClientMessage::Session {
                enc_session,
                enc_master_secret,
            }
        }
        b'C' => {
            r.literal(b"CHALLENGEA;")?;
            let enc = r.fixed(ENC_CHALLENGE_LEN)?.to_vec();
            r.end()?;
            ClientMessage::ChallengeAnswer(enc)
        }
        // ECIES output starts with an uncompressed point
        0x04 => {
            let enc_challenge = r.fixed(ENC_CHALLENGE_LEN)?.to_vec();
            r.literal(b";")?;
            let request = decode_request(r)?;
            ClientMessage::Operation {
                enc_challenge,
                request,
            }
        }
        other => {
            return Err(Halt::invalid(format!(
                "unrecognized message start 0x{other:02x}"
            )))
        }
    };
    Ok(msg)
}

fn decode_request(r: &mut Reader<'_>) -> Step<Request> {
    let (tag, delim) = r.token(b";\n", MAX_TAG_LEN)?;
    let command = Command::from_tag(tag)
        .ok_or_else(|| Halt::invalid(format!("unknown command {:?}", ascii(tag))))?;
    let expects_fields = command != Command::Exportation;
    if expects_fields != (delim == b';') {
        return Err(Halt::invalid(format!("bad delimiter after {command}")));
    }
    let request = match command {
        Command::Login | Command::Creation | Command::Deletion => {
            let enc_id = r.fixed(ENC_CHALLENGE_LEN)?.to_vec();
            r.literal(b";")?;
            let enc_login = r.sized()?.to_vec();
            r.end()?;
            match command {
                Command::Login => Request::Login { enc_id, enc_login },
                Command::Creation => Request::Creation { enc_id, enc_login },
                _ => Request::Deletion { enc_id, enc_login },
            }
        }
        Command::Configuration => {
            let enc_config = r.sized()?.to_vec();
            r.end()?;
            Request::Configuration { enc_config }
        }
        Command::Exportation => Request::Exportation,
        Command::SearchData => {
            let enc_pattern = r.sized()?.to_vec();
            r.end()?;
            Request::SearchData { enc_pattern }
        }
        Command::AddData => {
            let record = r.sized()?.to_vec();
            r.end()?;
            Request::AddData { record }
        }
        Command::UpdateData => {
            let index = r.number(b';')?;
            let record = r.sized()?.to_vec();
            r.end()?;
            Request::UpdateData { index, record }
        }
        Command::DeleteData => {
            let index = r.number(b'\n')?;
            Request::DeleteData { index }
        }
    };
    Ok(request)
}

/// ECIES ciphertext width for a fixed-size handshake payload.
pub fn handshake_ciphertext_len(plaintext_len: usize) -> usize {
    ecies::ciphertext_len(HANDSHAKE_CURVE, HANDSHAKE_CIPHER, plaintext_len)
}

// ── Incremental reader ──────────────────────────────────────────────────────

/// Why a decoder stopped early.
#[derive(Debug)]
pub(crate) enum Halt {
    Incomplete,
    Invalid(String),
}

impl Halt {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Halt::Invalid(reason.into())
    }
}

pub(crate) type Step<T> = Result<T, Halt>;

pub(crate) fn finish<T>(step: Step<T>, r: &Reader<'_>) -> ProtocolResult<Option<(T, usize)>> {
    match step {
        Ok(msg) => Ok(Some((msg, r.consumed()))),
        Err(Halt::Incomplete) => Ok(None),
        Err(Halt::Invalid(reason)) => Err(ProtocolError::Framing(reason)),
    }
}

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn consumed(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Expect exact bytes; a matching but short buffer is incomplete.
    pub(crate) fn literal(&mut self, lit: &[u8]) -> Step<()> {
        let rest = self.remaining();
        let n = rest.len().min(lit.len());
        if rest[..n] != lit[..n] {
            return Err(Halt::invalid(format!("expected {:?}", ascii(lit))));
        }
        if n < lit.len() {
            return Err(Halt::Incomplete);
        }
        self.pos += lit.len();
        Ok(())
    }

    pub(crate) fn fixed(&mut self, len: usize) -> Step<&'a [u8]> {
        let rest = self.remaining();
        if rest.len() < len {
            return Err(Halt::Incomplete);
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    /// Bytes up to the first of `delims`; the delimiter is consumed and returned.
    pub(crate) fn token(&mut self, delims: &[u8], max: usize) -> Step<(&'a [u8], u8)> {
        let rest = self.remaining();
        let window = &rest[..rest.len().min(max + 1)];
        match window.iter().position(|b| delims.contains(b)) {
            Some(i) => {
                self.pos += i + 1;
                Ok((&rest[..i], rest[i]))
            }
            None if window.len() > max => Err(Halt::invalid("field too long")),
            None => Err(Halt::Incomplete),
        }
    }

    /// A decimal number terminated by `delim`.
    pub(crate) fn number(&mut self, delim: u8) -> Step<u64> {
        let (digits, _) = self.token(&[delim], MAX_DIGITS)?;
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(Halt::invalid(format!("bad number {:?}", ascii(digits))));
        }
        ascii(digits)
            .parse()
            .map_err(|_| Halt::invalid("number out of range"))
    }

    /// `<len>;<len bytes>`
    pub(crate) fn sized(&mut self) -> Step<&'a [u8]> {
        let len = self.number(b';')?;
        let len = usize::try_from(len)
            .ok()
            .filter(|&n| n <= MAX_DECLARED_LEN)
            .ok_or_else(|| Halt::invalid(format!("declared length {len} too large")))?;
        self.fixed(len)
    }

    /// Printable ASCII up to `\n`.
    pub(crate) fn ascii_line(&mut self) -> Step<String> {
        let (text, _) = self.token(b"\n", MAX_ASCII_LEN)?;
        if !text.iter().all(|b| b.is_ascii() && !b.is_ascii_control()) {
            return Err(Halt::invalid("non-ASCII payload"));
        }
        Ok(ascii(text).into_owned())
    }

    pub(crate) fn end(&mut self) -> Step<()> {
        self.literal(b"\n")
    }
}

pub(crate) fn put_sized(out: &mut BytesMut, data: &[u8]) {
    out.put_slice(data.len().to_string().as_bytes());
    out.put_u8(b';');
    out.put_slice(data);
}

fn ascii(bytes: &[u8]) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn challenge_bytes() -> Vec<u8> {
        let mut c = vec![0xAB; ENC_CHALLENGE_LEN];
        c[0] = 0x04;
        c
    }

    fn samples() -> Vec<ClientMessage> {
        let ch = challenge_bytes();
        vec![
            ClientMessage::Session {
                enc_session: b"sess;\nion".to_vec(),
                enc_master_secret: vec![b'\n'; ENC_MASTER_SECRET_LEN],
            },
            ClientMessage::ChallengeAnswer(vec![b';'; ENC_CHALLENGE_LEN]),
            ClientMessage::Operation {
                enc_challenge: ch.clone(),
                request: Request::Login {
                    enc_id: vec![7; ENC_CHALLENGE_LEN],
                    enc_login: b"al;ice\n".to_vec(),
                },
            },
            ClientMessage::Operation {
                enc_challenge: ch.clone(),
                request: Request::Exportation,
            },
            ClientMessage::Operation {
                enc_challenge: ch.clone(),
                request: Request::UpdateData {
                    index: 42,
                    record: br#"{"fields":["a"],"fingerprint":"b"}"#.to_vec(),
                },
            },
            ClientMessage::Operation {
                enc_challenge: ch,
                request: Request::DeleteData { index: 7 },
            },
        ]
    }

    #[test]
    fn test_client_messages_decode() {
        for msg in samples() {
            let bytes = msg.to_bytes();
            let (decoded, used) = ClientMessage::decode(&bytes).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(used, bytes.len());
        }
    }

    #[test]
    fn test_server_messages_decode() {
        let msgs = [
            ServerMessage::KeySharing(vec![b'\n'; PUBKEY_LEN]),
            ServerMessage::ChallengeRequest,
            ServerMessage::Ok(None),
            ServerMessage::Ok(Some("2".into())),
            ServerMessage::Error("application protocol error".into()),
        ];
        for msg in msgs {
            let bytes = msg.to_bytes();
            assert_eq!(
                ServerMessage::decode(&bytes).unwrap(),
                Some((msg, bytes.len()))
            );
        }
    }

    #[test]
    fn test_every_prefix_is_incomplete() {
        for msg in samples() {
            let bytes = msg.to_bytes();
            for cut in 0..bytes.len() {
                assert!(
                    ClientMessage::decode(&bytes[..cut]).unwrap().is_none(),
                    "{} cut at {cut}",
                    msg.name()
                );
            }
        }
    }

    #[test]
    fn test_framing_errors() {
        assert!(ClientMessage::decode(b"HELLO\n").is_err());
        assert!(ClientMessage::decode(b"SESSIOX;").is_err());
        assert!(ServerMessage::decode(b"NOPE\n").is_err());
        assert!(ServerMessage::decode(b"CHALLENGER;x\n").is_err());

        let mut op = challenge_bytes();
        op.extend_from_slice(b";FROBNICATE\n");
        assert!(ClientMessage::decode(&op).is_err());

        let mut bad_len = challenge_bytes();
        bad_len.extend_from_slice(b";ADDDATA;12x;");
        assert!(ClientMessage::decode(&bad_len).is_err());

        let mut huge = challenge_bytes();
        huge.extend_from_slice(format!(";ADDDATA;{};", MAX_DECLARED_LEN + 1).as_bytes());
        assert!(ClientMessage::decode(&huge).is_err());
    }

    #[test]
    fn test_frame_buffer_keeps_trailing_bytes() {
        let mut fb = FrameBuffer::new();
        let mut wire = ServerMessage::ChallengeRequest.to_bytes();
        wire.extend_from_slice(&ServerMessage::Ok(Some("5".into())).to_bytes());
        fb.extend(&wire[..wire.len() - 2]);

        assert_eq!(
            fb.next_frame::<ServerMessage>().unwrap(),
            Some(ServerMessage::ChallengeRequest)
        );
        assert_eq!(fb.next_frame::<ServerMessage>().unwrap(), None);
        fb.extend(&wire[wire.len() - 2..]);
        assert_eq!(
            fb.next_frame::<ServerMessage>().unwrap(),
            Some(ServerMessage::Ok(Some("5".into())))
        );
        assert!(fb.is_empty());
    }

    #[test]
    fn test_handshake_widths() {
        assert_eq!(handshake_ciphertext_len(32), ENC_CHALLENGE_LEN);
        assert_eq!(handshake_ciphertext_len(64), ENC_MASTER_SECRET_LEN);
    }

    proptest! {
        #[test]
        fn chunked_delivery_matches_whole(split in 1usize..400, payload in prop::collection::vec(any::<u8>(), 0..300)) {
            let msg = ClientMessage::Operation {
                enc_challenge: challenge_bytes(),
                request: Request::AddData { record: payload },
            };
            let bytes = msg.to_bytes();
            let split = split.min(bytes.len());

            let mut fb = FrameBuffer::new();
            fb.extend(&bytes[..split]);
            let early = fb.next_frame::<ClientMessage>().unwrap();
            if split < bytes.len() {
                prop_assert!(early.is_none());
                fb.extend(&bytes[split..]);
                prop_assert_eq!(fb.next_frame::<ClientMessage>().unwrap(), Some(msg));
            } else {
                prop_assert_eq!(early, Some(msg));
            }
        }
    }
}
