//! Symmetric AEAD ciphers selectable by name
//!
//! Every cipher takes a 256-bit key and produces:
//! ```text
//! [nonce][ciphertext][16-byte tag]
//! ```
//! AES-256-SIV needs a 512-bit key; it is expanded from the 256-bit key with
//! HKDF-SHA256 (info "sib-aes-siv").

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{CryptoError, CryptoResult};
use crate::{KEY_SIZE, TAG_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cipher {
    Aes256Gcm,
    ChaCha20Poly1305,
    XChaCha20Poly1305,
    Aes256Siv,
}

impl Cipher {
    pub const ALL: [Cipher; 4] = [
        Cipher::Aes256Gcm,
        Cipher::ChaCha20Poly1305,
        Cipher::XChaCha20Poly1305,
        Cipher::Aes256Siv,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Cipher::Aes256Gcm => "aes-256-gcm",
            Cipher::ChaCha20Poly1305 => "chacha20-poly1305",
            Cipher::XChaCha20Poly1305 => "xchacha20-poly1305",
            Cipher::Aes256Siv => "aes-256-siv",
        }
    }

    pub fn nonce_len(self) -> usize {
        match self {
            Cipher::Aes256Gcm | Cipher::ChaCha20Poly1305 => 12,
            Cipher::XChaCha20Poly1305 => 24,
            Cipher::Aes256Siv => 16,
        }
    }

    /// Bytes added to the plaintext by `seal`
    pub fn overhead(self) -> usize {
        self.nonce_len() + TAG_SIZE
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn seal(self, key: &[u8; KEY_SIZE], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        match self {
            Cipher::Aes256Gcm => seal_with::<aes_gcm::Aes256Gcm>(key, self.nonce_len(), plaintext),
            Cipher::ChaCha20Poly1305 => seal_with::<chacha20poly1305::ChaCha20Poly1305>(
                key,
                self.nonce_len(),
                plaintext,
            ),
            Cipher::XChaCha20Poly1305 => seal_with::<chacha20poly1305::XChaCha20Poly1305>(
                key,
                self.nonce_len(),
                plaintext,
            ),
            Cipher::Aes256Siv => {
                let wide = siv_key(key)?;
                seal_with::<aes_siv::Aes256SivAead>(&wide[..], self.nonce_len(), plaintext)
            }
        }
    }

    /// Decrypt the output of [`Cipher::seal`].
    pub fn open(self, key: &[u8; KEY_SIZE], sealed: &[u8]) -> CryptoResult<Vec<u8>> {
        if sealed.len() < self.overhead() {
            return Err(CryptoError::Decryption);
        }
        match self {
            Cipher::Aes256Gcm => open_with::<aes_gcm::Aes256Gcm>(key, self.nonce_len(), sealed),
            Cipher::ChaCha20Poly1305 => {
                open_with::<chacha20poly1305::ChaCha20Poly1305>(key, self.nonce_len(), sealed)
            }
            Cipher::XChaCha20Poly1305 => {
                open_with::<chacha20poly1305::XChaCha20Poly1305>(key, self.nonce_len(), sealed)
            }
            Cipher::Aes256Siv => {
                let wide = siv_key(key)?;
                open_with::<aes_siv::Aes256SivAead>(&wide[..], self.nonce_len(), sealed)
            }
        }
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cipher {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cipher::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| CryptoError::UnknownCipher(s.to_string()))
    }
}

fn seal_with<C: Aead + KeyInit>(key: &[u8], nonce_len: usize, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKey("cipher key length"))?;

    let mut nonce = vec![0u8; nonce_len];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption("aead seal"))?;

    let mut out = Vec::with_capacity(nonce_len + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_with<C: Aead + KeyInit>(key: &[u8], nonce_len: usize, sealed: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::InvalidKey("cipher key length"))?;
    let (nonce, ciphertext) = sealed.split_at(nonce_len);
    cipher
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

fn siv_key(key: &[u8; KEY_SIZE]) -> CryptoResult<Zeroizing<[u8; 64]>> {
    let mut wide = Zeroizing::new([0u8; 64]);
    hkdf::Hkdf::<sha2::Sha256>::new(None, key)
        .expand(b"sib-aes-siv", &mut wide[..])
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand for AES-SIV: {e}")))?;
    Ok(wide)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_ciphers() {
        let key = [0x42u8; KEY_SIZE];
        for cipher in Cipher::ALL {
            for msg in [&b""[..], b"hello", &[0xA5u8; 2048][..]] {
                let sealed = cipher.seal(&key, msg).unwrap();
                assert_eq!(sealed.len(), msg.len() + cipher.overhead(), "{cipher}");
                assert_eq!(cipher.open(&key, &sealed).unwrap(), msg, "{cipher}");
            }
        }
    }

    #[test]
    fn test_nonces_are_random() {
        let key = [1u8; KEY_SIZE];
        for cipher in Cipher::ALL {
            let a = cipher.seal(&key, b"same").unwrap();
            let b = cipher.seal(&key, b"same").unwrap();
            assert_ne!(a, b, "{cipher}");
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        for cipher in Cipher::ALL {
            let sealed = cipher.seal(&[1u8; KEY_SIZE], b"secret").unwrap();
            assert!(matches!(
                cipher.open(&[2u8; KEY_SIZE], &sealed),
                Err(CryptoError::Decryption)
            ));
        }
    }

    #[test]
    fn test_tamper_and_truncation_fail() {
        let key = [3u8; KEY_SIZE];
        for cipher in Cipher::ALL {
            let mut sealed = cipher.seal(&key, b"payload").unwrap();
            let last = sealed.len() - 1;
            sealed[last] ^= 0x01;
            assert!(cipher.open(&key, &sealed).is_err());
            assert!(cipher.open(&key, &sealed[..cipher.overhead() - 1]).is_err());
        }
    }

    #[test]
    fn test_cipher_names() {
        for cipher in Cipher::ALL {
            assert_eq!(cipher.name().parse::<Cipher>().unwrap(), cipher);
        }
        assert!(matches!(
            "rot13".parse::<Cipher>(),
            Err(CryptoError::UnknownCipher(_))
        ));
    }
}
