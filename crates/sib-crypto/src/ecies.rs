//! ECIES: encrypt to a public key with an ephemeral keypair
//!
//! ```text
//! [ephemeral public key][nonce][ciphertext][16-byte tag]
//! key = HKDF-SHA256(salt = ephemeral public key, ikm = ECDH secret, info = "sib-ecies")
//! ```

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::cipher::Cipher;
use crate::curve::{Curve, KeyPair, PublicKey};
use crate::error::{CryptoError, CryptoResult};
use crate::KEY_SIZE;

const ECIES_INFO: &[u8] = b"sib-ecies";

/// Encrypt `plaintext` so that only the holder of `recipient`'s secret can read it.
pub fn encrypt(recipient: &PublicKey, cipher: Cipher, plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let ephemeral = KeyPair::generate(recipient.curve());
    let shared = ephemeral.diffie_hellman(recipient)?;
    let key = derive_key(ephemeral.public_key().as_bytes(), &shared)?;

    let sealed = cipher.seal(&key, plaintext)?;
    let eph_pub = ephemeral.public_key().as_bytes();

    let mut out = Vec::with_capacity(eph_pub.len() + sealed.len());
    out.extend_from_slice(eph_pub);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt the output of [`encrypt`] with the recipient's keypair.
pub fn decrypt(recipient: &KeyPair, cipher: Cipher, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
    let pub_len = recipient.curve().public_len();
    if ciphertext.len() < pub_len + cipher.overhead() {
        return Err(CryptoError::Decryption);
    }
    let (eph_pub, sealed) = ciphertext.split_at(pub_len);
    let eph_pub = PublicKey::from_bytes(eph_pub).map_err(|_| CryptoError::Decryption)?;
    let shared = recipient.diffie_hellman(&eph_pub)?;
    let key = derive_key(eph_pub.as_bytes(), &shared)?;
    cipher.open(&key, sealed)
}

/// Exact ciphertext length for a plaintext of `plaintext_len` bytes.
pub fn ciphertext_len(curve: Curve, cipher: Cipher, plaintext_len: usize) -> usize {
    curve.public_len() + cipher.overhead() + plaintext_len
}

fn derive_key(salt: &[u8], shared: &[u8]) -> CryptoResult<Zeroizing<[u8; KEY_SIZE]>> {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    Hkdf::<Sha256>::new(Some(salt), shared)
        .expand(ECIES_INFO, &mut key[..])
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand for ECIES: {e}")))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_every_curve_and_cipher() {
        for curve in Curve::ALL {
            let recipient = KeyPair::generate(curve);
            for cipher in Cipher::ALL {
                let ct = encrypt(recipient.public_key(), cipher, b"master secret").unwrap();
                assert_eq!(ct.len(), ciphertext_len(curve, cipher, 13));
                let pt = decrypt(&recipient, cipher, &ct).unwrap();
                assert_eq!(pt, b"master secret");
            }
        }
    }

    #[test]
    fn test_handshake_widths() {
        assert_eq!(ciphertext_len(Curve::Secp256r1, Cipher::Aes256Gcm, 32), 125);
        assert_eq!(ciphertext_len(Curve::Secp256r1, Cipher::Aes256Gcm, 64), 157);
    }

    #[test]
    fn test_wrong_recipient_fails() {
        let alice = KeyPair::generate(Curve::Secp256r1);
        let mallory = KeyPair::generate(Curve::Secp256r1);
        let ct = encrypt(alice.public_key(), Cipher::Aes256Gcm, b"for alice").unwrap();
        assert!(decrypt(&mallory, Cipher::Aes256Gcm, &ct).is_err());
    }

    #[test]
    fn test_garbage_input_fails() {
        let kp = KeyPair::generate(Curve::Secp256r1);
        assert!(decrypt(&kp, Cipher::Aes256Gcm, &[0u8; 10]).is_err());
        assert!(decrypt(&kp, Cipher::Aes256Gcm, &[0u8; 125]).is_err());
    }
}
