//! Key derivation: password → master secret, master secret → session key

use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Sha256, Sha512};
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::Cipher;
use crate::error::{CryptoError, CryptoResult};
use crate::KEY_SIZE;

/// Size of the master secret (PBKDF2-HMAC-SHA512 output)
pub const MASTER_SECRET_SIZE: usize = 64;

/// Size of the per-connection session number
pub const SESSION_NUMBER_SIZE: usize = 16;

/// The password-derived secret shared once per session.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct MasterSecret {
    bytes: [u8; MASTER_SECRET_SIZE],
}

impl MasterSecret {
    pub fn from_bytes(bytes: [u8; MASTER_SECRET_SIZE]) -> Self {
        Self { bytes }
    }

    /// Build from a decrypted buffer, rejecting any other length.
    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; MASTER_SECRET_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("master secret must be 64 bytes"))?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_SECRET_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterSecret")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// PBKDF2 parameters
#[derive(Debug, Clone)]
pub struct Pbkdf2Params {
    pub iterations: u32,
}

impl Default for Pbkdf2Params {
    fn default() -> Self {
        Self {
            iterations: 100_000,
        }
    }
}

/// Derive the master secret from a password, salted with the login.
///
/// The same (password, login, iterations) always yields the same secret, which
/// is what lets the server find the account again on the next connection.
pub fn derive_master_secret(
    password: &SecretString,
    login: &str,
    params: &Pbkdf2Params,
) -> CryptoResult<MasterSecret> {
    if params.iterations == 0 {
        return Err(CryptoError::Kdf("PBKDF2 iterations must be > 0".into()));
    }
    let mut out = [0u8; MASTER_SECRET_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha512>(
        password.expose_secret().as_bytes(),
        login.as_bytes(),
        params.iterations,
        &mut out,
    );
    let secret = MasterSecret::from_bytes(out);
    out.zeroize();
    Ok(secret)
}

/// Random per-connection nonce bound into every challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionNumber([u8; SESSION_NUMBER_SIZE]);

impl SessionNumber {
    pub fn random() -> Self {
        let mut bytes = [0u8; SESSION_NUMBER_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_NUMBER_SIZE] {
        &self.0
    }

    /// Symmetric layer applied before the session number is ECIES-wrapped:
    /// AES-256-GCM keyed by HKDF-SHA256(ms, "sib-session").
    pub fn seal(&self, ms: &MasterSecret) -> CryptoResult<Vec<u8>> {
        let key = session_key(ms)?;
        Cipher::Aes256Gcm.seal(&key, &self.0)
    }

    pub fn open(ms: &MasterSecret, sealed: &[u8]) -> CryptoResult<Self> {
        let key = session_key(ms)?;
        let plain = Zeroizing::new(Cipher::Aes256Gcm.open(&key, sealed)?);
        let bytes: [u8; SESSION_NUMBER_SIZE] = plain
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("session number must be 16 bytes"))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for SessionNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionNumber([REDACTED])")
    }
}

fn session_key(ms: &MasterSecret) -> CryptoResult<Zeroizing<[u8; KEY_SIZE]>> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    Hkdf::<Sha256>::new(None, ms.as_bytes())
        .expand(b"sib-session", &mut key[..])
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand for session key: {e}")))?;
    Ok(key)
}
