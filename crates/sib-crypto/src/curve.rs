//! Elliptic-curve keypairs: random (ephemeral) or derived from a seed (stage keys)
//!
//! Public keys travel as raw bytes: 32 bytes for x25519, uncompressed SEC1
//! points for the NIST curves (65 bytes for P-256, 97 bytes for P-384).
//! The lengths are distinct, so a public key identifies its curve.

use std::fmt;
use std::str::FromStr;

use p256::elliptic_curve::sec1::ToEncodedPoint as _;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};

/// Curves supported for handshake and onion-stage keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    X25519,
    Secp256r1,
    Secp384r1,
}

impl Curve {
    pub const ALL: [Curve; 3] = [Curve::X25519, Curve::Secp256r1, Curve::Secp384r1];

    pub fn name(self) -> &'static str {
        match self {
            Curve::X25519 => "x25519",
            Curve::Secp256r1 => "secp256r1",
            Curve::Secp384r1 => "secp384r1",
        }
    }

    /// Length of an encoded public key on this curve
    pub fn public_len(self) -> usize {
        match self {
            Curve::X25519 => 32,
            Curve::Secp256r1 => 65,
            Curve::Secp384r1 => 97,
        }
    }

    /// Length of the seed needed to derive a secret scalar
    pub fn seed_len(self) -> usize {
        match self {
            Curve::X25519 | Curve::Secp256r1 => 32,
            Curve::Secp384r1 => 48,
        }
    }

    /// Identify the curve of an encoded public key from its length.
    pub fn from_public_len(len: usize) -> Option<Curve> {
        Curve::ALL.into_iter().find(|c| c.public_len() == len)
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Curve {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Curve::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| CryptoError::UnknownCurve(s.to_string()))
    }
}

/// A validated public key on a known curve.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    curve: Curve,
    bytes: Vec<u8>,
}

impl PublicKey {
    /// Parse an encoded public key; the curve is inferred from the length.
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let curve = Curve::from_public_len(bytes.len())
            .ok_or(CryptoError::InvalidKey("public key length matches no curve"))?;
        match curve {
            Curve::X25519 => {}
            Curve::Secp256r1 => {
                p256::PublicKey::from_sec1_bytes(bytes)
                    .map_err(|_| CryptoError::InvalidKey("secp256r1 point not on curve"))?;
            }
            Curve::Secp384r1 => {
                p384::PublicKey::from_sec1_bytes(bytes)
                    .map_err(|_| CryptoError::InvalidKey("secp384r1 point not on curve"))?;
            }
        }
        Ok(Self {
            curve,
            bytes: bytes.to_vec(),
        })
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("curve", &self.curve)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Clone)]
enum SecretKey {
    X25519(x25519_dalek::StaticSecret),
    Secp256r1(p256::SecretKey),
    Secp384r1(p384::SecretKey),
}

/// A secret scalar together with its encoded public key.
///
/// Secret material is zeroized on drop by the underlying curve crates.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh random keypair.
    pub fn generate(curve: Curve) -> Self {
        let secret = match curve {
            Curve::X25519 => SecretKey::X25519(x25519_dalek::StaticSecret::random_from_rng(OsRng)),
            Curve::Secp256r1 => SecretKey::Secp256r1(p256::SecretKey::random(&mut OsRng)),
            Curve::Secp384r1 => SecretKey::Secp384r1(p384::SecretKey::random(&mut OsRng)),
        };
        Self::from_secret(secret)
    }

    /// Derive a keypair from `curve.seed_len()` bytes of key material.
    ///
    /// Fails for NIST curves when the seed is not a valid scalar (zero or not
    /// below the group order); callers re-derive with a different seed.
    pub fn from_seed(curve: Curve, seed: &[u8]) -> CryptoResult<Self> {
        if seed.len() != curve.seed_len() {
            return Err(CryptoError::InvalidKey("seed length does not match curve"));
        }
        let secret = match curve {
            Curve::X25519 => {
                let mut bytes = Zeroizing::new([0u8; 32]);
                bytes.copy_from_slice(seed);
                SecretKey::X25519(x25519_dalek::StaticSecret::from(*bytes))
            }
            Curve::Secp256r1 => SecretKey::Secp256r1(
                p256::SecretKey::from_slice(seed)
                    .map_err(|_| CryptoError::InvalidKey("seed is not a secp256r1 scalar"))?,
            ),
            Curve::Secp384r1 => SecretKey::Secp384r1(
                p384::SecretKey::from_slice(seed)
                    .map_err(|_| CryptoError::InvalidKey("seed is not a secp384r1 scalar"))?,
            ),
        };
        Ok(Self::from_secret(secret))
    }

    fn from_secret(secret: SecretKey) -> Self {
        let (curve, bytes) = match &secret {
            SecretKey::X25519(s) => (
                Curve::X25519,
                x25519_dalek::PublicKey::from(s).as_bytes().to_vec(),
            ),
            SecretKey::Secp256r1(s) => (
                Curve::Secp256r1,
                s.public_key().to_encoded_point(false).as_bytes().to_vec(),
            ),
            SecretKey::Secp384r1(s) => (
                Curve::Secp384r1,
                s.public_key().to_encoded_point(false).as_bytes().to_vec(),
            ),
        };
        Self {
            secret,
            public: PublicKey { curve, bytes },
        }
    }

    pub fn curve(&self) -> Curve {
        self.public.curve
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// ECDH with a peer public key on the same curve. Returns the raw shared secret.
    pub fn diffie_hellman(&self, peer: &PublicKey) -> CryptoResult<Zeroizing<Vec<u8>>> {
        if peer.curve != self.curve() {
            return Err(CryptoError::InvalidKey("peer key is on a different curve"));
        }
        match &self.secret {
            SecretKey::X25519(s) => {
                let mut raw = [0u8; 32];
                raw.copy_from_slice(&peer.bytes);
                let shared = s.diffie_hellman(&x25519_dalek::PublicKey::from(raw));
                if !shared.was_contributory() {
                    return Err(CryptoError::InvalidKey("x25519 low-order point"));
                }
                Ok(Zeroizing::new(shared.as_bytes().to_vec()))
            }
            SecretKey::Secp256r1(s) => {
                let point = p256::PublicKey::from_sec1_bytes(&peer.bytes)
                    .map_err(|_| CryptoError::InvalidKey("secp256r1 point not on curve"))?;
                let shared = p256::ecdh::diffie_hellman(s.to_nonzero_scalar(), point.as_affine());
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            SecretKey::Secp384r1(s) => {
                let point = p384::PublicKey::from_sec1_bytes(&peer.bytes)
                    .map_err(|_| CryptoError::InvalidKey("secp384r1 point not on curve"))?;
                let shared = p384::ecdh::diffie_hellman(s.to_nonzero_scalar(), point.as_affine());
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
        }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("curve", &self.curve())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_lengths() {
        for curve in Curve::ALL {
            let kp = KeyPair::generate(curve);
            assert_eq!(kp.public_key().as_bytes().len(), curve.public_len());
            assert_eq!(Curve::from_public_len(curve.public_len()), Some(curve));
        }
    }

    #[test]
    fn test_ecdh_agreement() {
        for curve in Curve::ALL {
            let a = KeyPair::generate(curve);
            let b = KeyPair::generate(curve);
            let ab = a.diffie_hellman(b.public_key()).unwrap();
            let ba = b.diffie_hellman(a.public_key()).unwrap();
            assert_eq!(*ab, *ba, "{curve}: shared secrets must agree");
        }
    }

    #[test]
    fn test_from_seed_deterministic() {
        for curve in Curve::ALL {
            let seed = vec![7u8; curve.seed_len()];
            let a = KeyPair::from_seed(curve, &seed).unwrap();
            let b = KeyPair::from_seed(curve, &seed).unwrap();
            assert_eq!(a.public_key(), b.public_key());
        }
    }

    #[test]
    fn test_from_seed_rejects_zero_scalar() {
        assert!(KeyPair::from_seed(Curve::Secp256r1, &[0u8; 32]).is_err());
        assert!(KeyPair::from_seed(Curve::Secp384r1, &[0u8; 48]).is_err());
    }

    #[test]
    fn test_cross_curve_rejected() {
        let a = KeyPair::generate(Curve::X25519);
        let b = KeyPair::generate(Curve::Secp256r1);
        assert!(a.diffie_hellman(b.public_key()).is_err());
    }

    #[test]
    fn test_public_key_parse() {
        let kp = KeyPair::generate(Curve::Secp384r1);
        let parsed = PublicKey::from_bytes(kp.public_key().as_bytes()).unwrap();
        assert_eq!(parsed.curve(), Curve::Secp384r1);

        let mut bogus = kp.public_key().as_bytes().to_vec();
        bogus[10] ^= 0xFF;
        assert!(PublicKey::from_bytes(&bogus).is_err());
        assert!(PublicKey::from_bytes(&[1u8; 40]).is_err());
    }

    #[test]
    fn test_curve_names() {
        for curve in Curve::ALL {
            assert_eq!(curve.name().parse::<Curve>().unwrap(), curve);
        }
        assert!("ed25519".parse::<Curve>().is_err());
    }
}
