//! Challenges, client identity and account file names
//!
//! ```text
//! challenge = HMAC-SHA256(ms, session || label)
//! identity  = SHA256(HMAC-SHA512(ms, ms || login))
//! filename  = base32(identity || HMAC-SHA256(ms, login))[..64]
//! ```

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{MasterSecret, SessionNumber};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Size of a challenge (HMAC-SHA256 output)
pub const CHALLENGE_SIZE: usize = 32;

/// Size of a client identity (SHA256 output)
pub const IDENTITY_SIZE: usize = 32;

/// Length of an account file name, in base32 characters
pub const ACCOUNT_FILENAME_LEN: usize = 64;

/// Compute the single-use proof of possession for one protocol transition.
pub fn challenge(
    ms: &MasterSecret,
    session: &SessionNumber,
    label: &str,
) -> CryptoResult<[u8; CHALLENGE_SIZE]> {
    Ok(challenge_mac(ms, session, label)?.finalize().into_bytes().into())
}

/// Constant-time check of a challenge received from the peer.
pub fn verify_challenge(
    ms: &MasterSecret,
    session: &SessionNumber,
    label: &str,
    candidate: &[u8],
) -> CryptoResult<bool> {
    Ok(challenge_mac(ms, session, label)?
        .verify_slice(candidate)
        .is_ok())
}

fn challenge_mac(
    ms: &MasterSecret,
    session: &SessionNumber,
    label: &str,
) -> CryptoResult<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(ms.as_bytes())
        .map_err(|_| CryptoError::InvalidKey("hmac key"))?;
    mac.update(session.as_bytes());
    mac.update(label.as_bytes());
    Ok(mac)
}

/// Stable pseudonymous identifier of (master secret, login).
pub fn client_identity(ms: &MasterSecret, login: &str) -> CryptoResult<[u8; IDENTITY_SIZE]> {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(ms.as_bytes())
        .map_err(|_| CryptoError::InvalidKey("hmac key"))?;
    mac.update(ms.as_bytes());
    mac.update(login.as_bytes());
    Ok(Sha256::digest(mac.finalize().into_bytes()).into())
}

pub fn identities_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Store key of the account owned by (master secret, login).
pub fn account_filename(ms: &MasterSecret, login: &str) -> CryptoResult<String> {
    let identity = client_identity(ms, login)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(ms.as_bytes())
        .map_err(|_| CryptoError::InvalidKey("hmac key"))?;
    mac.update(login.as_bytes());

    let mut material = Vec::with_capacity(IDENTITY_SIZE + 32);
    material.extend_from_slice(&identity);
    material.extend_from_slice(&mac.finalize().into_bytes());

    let mut name = BASE32_NOPAD.encode(&material).to_ascii_lowercase();
    name.truncate(ACCOUNT_FILENAME_LEN);
    Ok(name)
}
