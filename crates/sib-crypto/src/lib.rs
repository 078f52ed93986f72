//! sib-crypto: crypto adapter, session key derivation and record codec for SIBVault
//!
//! Handshake:
//! ```text
//! client: ms = PBKDF2-HMAC-SHA512(password, salt = login)
//! server ── KEYSHARING(ephemeral P-256 public key) ──▶ client
//! client ── SESSION(ECIES(sealed session number), ECIES(ms)) ──▶ server
//! both:     challenge(label) = HMAC-SHA256(ms, session || label)
//! ```
//!
//! Stored records are onion-encrypted field by field under up to three
//! (curve, cipher) stages derived from the master secret, and carry an
//! HMAC-SHA512 fingerprint keyed by SHA-512(ms).

pub mod cipher;
pub mod curve;
pub mod ecies;
pub mod error;
pub mod export;
pub mod kdf;
pub mod keys;
pub mod mac;
pub mod record;

pub use cipher::Cipher;
pub use curve::{Curve, KeyPair, PublicKey};
pub use error::{CryptoError, CryptoResult};
pub use export::{export_clear, export_encrypted, import, ExportFile};
pub use kdf::{derive_master_secret, MasterSecret, Pbkdf2Params, SessionNumber};
pub use keys::{CipherSuite, KeyHandler, Stage};
pub use mac::{account_filename, challenge, client_identity, identities_match, verify_challenge};
pub use record::{SecretRecord, UnverifiedRecord, MAX_FIELDS};

/// Size of a symmetric cipher key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AEAD authentication tag
pub const TAG_SIZE: usize = 16;

/// Curve of the per-connection ephemeral handshake keypair
pub const HANDSHAKE_CURVE: Curve = Curve::Secp256r1;

/// Cipher used under ECIES for handshake and request payloads
pub const HANDSHAKE_CIPHER: Cipher = Cipher::Aes256Gcm;

pub(crate) fn base64_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(data)
}

pub(crate) fn base64_decode(s: &str) -> Result<Vec<u8>, String> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.decode(s).map_err(|e| format!("base64 decode: {e}"))
}
