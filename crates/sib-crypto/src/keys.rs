//! Cipher suites and the per-connection key handler
//!
//! Key hierarchy:
//! ```text
//! Master Secret (512-bit, PBKDF2-HMAC-SHA512 from password, salt = login)
//!   ├── Integrity Key = SHA-512(ms)                 (record fingerprints)
//!   └── Stage i keypair, seed = HKDF-SHA512(ms, info = "sib-stage-{i}-{curve}-{cipher}")
//!       └── field layer i = ECIES(stage i public key, cipher i)
//! ```
//!
//! A field is sealed by stage 1 first and stage N last; opening peels the
//! layers in reverse order.

use std::fmt;
use std::str::FromStr;

use hkdf::Hkdf;
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use crate::cipher::Cipher;
use crate::curve::{Curve, KeyPair};
use crate::ecies;
use crate::error::{CryptoError, CryptoResult};
use crate::kdf::MasterSecret;

/// Maximum number of onion stages in a suite
pub const MAX_STAGES: usize = 3;

/// Seed re-derivation attempts before a stage is declared underivable
const MAX_SEED_ATTEMPTS: u32 = 16;

/// One onion layer: a curve for the stage keypair and the AEAD used under ECIES.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stage {
    pub curve: Curve,
    pub cipher: Cipher,
}

/// An ordered chain of 1..=3 stages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CipherSuite {
    stages: Vec<Stage>,
}

impl CipherSuite {
    pub fn new(stages: Vec<Stage>) -> CryptoResult<Self> {
        if stages.is_empty() || stages.len() > MAX_STAGES {
            return Err(CryptoError::InvalidSuite(format!(
                "{} stages (expected 1..={MAX_STAGES})",
                stages.len()
            )));
        }
        Ok(Self { stages })
    }

    /// Build from the six configured names (curve1, cipher1, ..., cipher3).
    /// Unused stages are empty strings and must follow every used one.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> CryptoResult<Self> {
        if names.len() != 2 * MAX_STAGES {
            return Err(CryptoError::InvalidSuite(format!(
                "{} names (expected {})",
                names.len(),
                2 * MAX_STAGES
            )));
        }
        let mut stages = Vec::with_capacity(MAX_STAGES);
        let mut ended = false;
        for pair in names.chunks(2) {
            let (curve, cipher) = (pair[0].as_ref().trim(), pair[1].as_ref().trim());
            match (curve.is_empty(), cipher.is_empty()) {
                (true, true) => ended = true,
                (false, false) if !ended => stages.push(Stage {
                    curve: curve.parse()?,
                    cipher: cipher.parse()?,
                }),
                (false, false) => {
                    return Err(CryptoError::InvalidSuite(
                        "stages must be contiguous".into(),
                    ))
                }
                _ => {
                    return Err(CryptoError::InvalidSuite(format!(
                        "incomplete stage '{curve}' / '{cipher}'"
                    )))
                }
            }
        }
        Self::new(stages)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Bytes added to a field by the full onion
    pub fn overhead(&self) -> usize {
        self.stages
            .iter()
            .map(|s| s.curve.public_len() + s.cipher.overhead())
            .sum()
    }
}

impl Default for CipherSuite {
    fn default() -> Self {
        Self {
            stages: vec![Stage {
                curve: Curve::X25519,
                cipher: Cipher::XChaCha20Poly1305,
            }],
        }
    }
}

impl fmt::Display for CipherSuite {
    /// Canonical 6-tuple text form: `curve1;cipher1;curve2;cipher2;curve3;cipher3`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(2 * MAX_STAGES);
        for i in 0..MAX_STAGES {
            match self.stages.get(i) {
                Some(stage) => {
                    parts.push(stage.curve.name());
                    parts.push(stage.cipher.name());
                }
                None => parts.extend(["", ""]),
            }
        }
        f.write_str(&parts.join(";"))
    }
}

impl FromStr for CipherSuite {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let names: Vec<&str> = s.split(';').collect();
        Self::from_names(&names)
    }
}

struct StageKey {
    stage: Stage,
    keypair: KeyPair,
}

/// Keys derived from (master secret, cipher suite), owned by one connection.
///
/// Rebuilt whenever the account's suite changes.
pub struct KeyHandler {
    suite: CipherSuite,
    integrity_key: Zeroizing<[u8; 64]>,
    stages: Vec<StageKey>,
}

impl KeyHandler {
    pub fn new(ms: &MasterSecret, suite: CipherSuite) -> CryptoResult<Self> {
        let mut integrity_key = Zeroizing::new([0u8; 64]);
        integrity_key.copy_from_slice(&Sha512::digest(ms.as_bytes()));
        let stages = suite
            .stages()
            .iter()
            .enumerate()
            .map(|(i, stage)| {
                Ok(StageKey {
                    stage: *stage,
                    keypair: derive_stage_keypair(ms, i + 1, stage)?,
                })
            })
            .collect::<CryptoResult<Vec<_>>>()?;
        Ok(Self {
            suite,
            integrity_key,
            stages,
        })
    }

    pub fn suite(&self) -> &CipherSuite {
        &self.suite
    }

    pub fn integrity_key(&self) -> &[u8; 64] {
        &self.integrity_key
    }

    /// Apply every stage to one field value, stage 1 first.
    pub fn encrypt_field(&self, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut data = plaintext.to_vec();
        for key in &self.stages {
            data = ecies::encrypt(key.keypair.public_key(), key.stage.cipher, &data)?;
        }
        Ok(data)
    }

    /// Peel every stage from one encrypted field, last stage first.
    pub fn decrypt_field(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        let mut data = ciphertext.to_vec();
        for key in self.stages.iter().rev() {
            data = ecies::decrypt(&key.keypair, key.stage.cipher, &data)?;
        }
        Ok(data)
    }
}

impl fmt::Debug for KeyHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandler")
            .field("suite", &self.suite.to_string())
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

fn derive_stage_keypair(ms: &MasterSecret, index: usize, stage: &Stage) -> CryptoResult<KeyPair> {
    let hk = Hkdf::<Sha512>::new(None, ms.as_bytes());
    let mut seed = Zeroizing::new(vec![0u8; stage.curve.seed_len()]);
    for attempt in 0..MAX_SEED_ATTEMPTS {
        let info = if attempt == 0 {
            format!("sib-stage-{index}-{}-{}", stage.curve, stage.cipher)
        } else {
            format!("sib-stage-{index}-{}-{}#{attempt}", stage.curve, stage.cipher)
        };
        hk.expand(info.as_bytes(), &mut seed)
            .map_err(|e| CryptoError::Kdf(format!("HKDF expand for stage {index}: {e}")))?;
        match KeyPair::from_seed(stage.curve, &seed) {
            Ok(kp) => return Ok(kp),
            Err(_) => tracing::debug!(index, attempt, "stage seed is not a valid scalar, re-deriving"),
        }
    }
    Err(CryptoError::Kdf(format!(
        "no valid {} scalar for stage {index}",
        stage.curve
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::MASTER_SECRET_SIZE;
    use proptest::prelude::*;

    fn ms() -> MasterSecret {
        MasterSecret::from_bytes([0x5Au8; MASTER_SECRET_SIZE])
    }

    fn suites() -> Vec<CipherSuite> {
        [
            "x25519;xchacha20-poly1305;;;;",
            "secp256r1;aes-256-gcm;x25519;chacha20-poly1305;;",
            "secp384r1;aes-256-siv;secp256r1;xchacha20-poly1305;x25519;aes-256-gcm",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect()
    }

    #[test]
    fn test_suite_text_roundtrip() {
        for suite in suites() {
            let text = suite.to_string();
            assert_eq!(text.split(';').count(), 6);
            assert_eq!(text.parse::<CipherSuite>().unwrap(), suite);
        }
    }

    #[test]
    fn test_suite_rejects_gap_and_partial() {
        assert!("x25519;aes-256-gcm;;;x25519;aes-256-gcm"
            .parse::<CipherSuite>()
            .is_err());
        assert!("x25519;;;;;".parse::<CipherSuite>().is_err());
        assert!(";;;;;".parse::<CipherSuite>().is_err());
        assert!("x25519;aes-256-gcm".parse::<CipherSuite>().is_err());
        assert!(matches!(
            "curve448;aes-256-gcm;;;;".parse::<CipherSuite>(),
            Err(CryptoError::UnknownCurve(_))
        ));
    }

    #[test]
    fn test_key_handler_deterministic() {
        let suite = suites().remove(2);
        let a = KeyHandler::new(&ms(), suite.clone()).unwrap();
        let b = KeyHandler::new(&ms(), suite).unwrap();
        let ct = a.encrypt_field(b"shared across connections").unwrap();
        assert_eq!(b.decrypt_field(&ct).unwrap(), b"shared across connections");
        assert_eq!(a.integrity_key(), b.integrity_key());
    }

    #[test]
    fn test_other_suite_cannot_decrypt() {
        let all = suites();
        let one = KeyHandler::new(&ms(), all[0].clone()).unwrap();
        let two = KeyHandler::new(&ms(), all[1].clone()).unwrap();
        let ct = one.encrypt_field(b"value").unwrap();
        assert!(two.decrypt_field(&ct).is_err());
    }

    #[test]
    fn test_overhead_matches() {
        for suite in suites() {
            let kh = KeyHandler::new(&ms(), suite.clone()).unwrap();
            let ct = kh.encrypt_field(b"abc").unwrap();
            assert_eq!(ct.len(), 3 + suite.overhead());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn onion_roundtrip(value in prop::collection::vec(any::<u8>(), 0..2048), which in 0usize..3) {
            let kh = KeyHandler::new(&ms(), suites().remove(which)).unwrap();
            let ct = kh.encrypt_field(&value).unwrap();
            prop_assert_eq!(kh.decrypt_field(&ct).unwrap(), value);
        }
    }
}
