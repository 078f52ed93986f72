//! Secret records: up to eight onion-encrypted fields and a fingerprint
//!
//! Pickled (wire and store) format:
//! ```text
//! {"fields": ["<b64 field 1>", ...], "fingerprint": "<b64 HMAC-SHA512>"}
//! ```
//!
//! The fingerprint binds every encrypted field, the field count and the cipher
//! suite. A pickled record can only be read after [`UnverifiedRecord::verify`].

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha512;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::KeyHandler;
use crate::{base64_decode, base64_encode};

type HmacSha512 = Hmac<Sha512>;

/// Maximum number of fields ("info1".."info8") in one record
pub const MAX_FIELDS: usize = 8;

#[derive(Serialize, Deserialize)]
struct Pickled {
    fields: Vec<String>,
    fingerprint: String,
}

/// A record whose fields are readable with the owning [`KeyHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRecord {
    fields: [Option<Vec<u8>>; MAX_FIELDS],
    count: usize,
    fingerprint: Option<Vec<u8>>,
}

impl SecretRecord {
    /// Encrypt `values` (1..=MAX_FIELDS of them) into a sealed record.
    pub fn encrypt<V: AsRef<[u8]>>(kh: &KeyHandler, values: &[V]) -> CryptoResult<Self> {
        if values.is_empty() || values.len() > MAX_FIELDS {
            return Err(CryptoError::Record(format!(
                "{} fields (expected 1..={MAX_FIELDS})",
                values.len()
            )));
        }
        let mut record = Self {
            fields: Default::default(),
            count: 0,
            fingerprint: None,
        };
        for value in values {
            record.push_field(kh, value.as_ref())?;
        }
        record.seal(kh)?;
        Ok(record)
    }

    pub fn field_count(&self) -> usize {
        self.count
    }

    /// Decrypt field `n` (1-based).
    pub fn decrypt_field(&self, kh: &KeyHandler, n: usize) -> CryptoResult<Vec<u8>> {
        let field = self.slot(n)?;
        kh.decrypt_field(field)
    }

    pub fn decrypt_all(&self, kh: &KeyHandler) -> CryptoResult<Vec<Vec<u8>>> {
        (1..=self.count).map(|n| self.decrypt_field(kh, n)).collect()
    }

    /// Replace field `n` (1-based). The record must be re-sealed afterwards.
    pub fn set_field(&mut self, kh: &KeyHandler, n: usize, value: &[u8]) -> CryptoResult<()> {
        self.slot(n)?;
        self.fields[n - 1] = Some(kh.encrypt_field(value)?);
        self.fingerprint = None;
        Ok(())
    }

    /// Append a field. The record must be re-sealed afterwards.
    pub fn push_field(&mut self, kh: &KeyHandler, value: &[u8]) -> CryptoResult<()> {
        if self.count == MAX_FIELDS {
            return Err(CryptoError::Record(format!("record already has {MAX_FIELDS} fields")));
        }
        self.fields[self.count] = Some(kh.encrypt_field(value)?);
        self.count += 1;
        self.fingerprint = None;
        Ok(())
    }

    /// Compute a fresh fingerprint over the current fields.
    pub fn seal(&mut self, kh: &KeyHandler) -> CryptoResult<()> {
        self.fingerprint = Some(fingerprint_mac(kh, self.present())?.finalize().into_bytes().to_vec());
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.fingerprint.is_some()
    }

    /// Pickle a sealed record.
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        let fingerprint = self
            .fingerprint
            .as_ref()
            .ok_or_else(|| CryptoError::Record("record modified since last seal".into()))?;
        let pickled = Pickled {
            fields: self.present().map(|f| base64_encode(f)).collect(),
            fingerprint: base64_encode(fingerprint),
        };
        serde_json::to_vec(&pickled).map_err(|e| CryptoError::Record(format!("serialization: {e}")))
    }

    /// Re-encrypt every field from `old` to `new`, returning a record sealed under `new`.
    pub fn reencrypt(&self, old: &KeyHandler, new: &KeyHandler) -> CryptoResult<Self> {
        let values = self.decrypt_all(old)?;
        Self::encrypt(new, &values)
    }

    /// Case-insensitive substring match of `pattern` against field 1, or
    /// against every field when `all_fields` is set.
    pub fn matches(&self, kh: &KeyHandler, pattern: &str, all_fields: bool) -> CryptoResult<bool> {
        let needle = pattern.to_lowercase();
        let last = if all_fields { self.count } else { 1 };
        for n in 1..=last {
            let value = self.decrypt_field(kh, n)?;
            if String::from_utf8_lossy(&value).to_lowercase().contains(&needle) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn slot(&self, n: usize) -> CryptoResult<&[u8]> {
        if n == 0 || n > self.count {
            return Err(CryptoError::Record(format!(
                "field info{n} out of range (record has {})",
                self.count
            )));
        }
        self.fields[n - 1]
            .as_deref()
            .ok_or_else(|| CryptoError::Record(format!("field info{n} is empty")))
    }

    fn present(&self) -> impl Iterator<Item = &[u8]> {
        self.fields[..self.count].iter().flatten().map(Vec::as_slice)
    }
}

/// A deserialized record whose fingerprint has not been checked yet.
#[derive(Debug, Clone)]
pub struct UnverifiedRecord {
    fields: Vec<Vec<u8>>,
    fingerprint: Vec<u8>,
}

impl UnverifiedRecord {
    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        let pickled: Pickled = serde_json::from_slice(data)
            .map_err(|e| CryptoError::Record(format!("deserialization: {e}")))?;
        if pickled.fields.is_empty() || pickled.fields.len() > MAX_FIELDS {
            return Err(CryptoError::Record(format!(
                "{} fields (expected 1..={MAX_FIELDS})",
                pickled.fields.len()
            )));
        }
        let fields = pickled
            .fields
            .iter()
            .map(|f| base64_decode(f).map_err(CryptoError::Record))
            .collect::<CryptoResult<Vec<_>>>()?;
        let fingerprint = base64_decode(&pickled.fingerprint).map_err(CryptoError::Record)?;
        Ok(Self {
            fields,
            fingerprint,
        })
    }

    /// Check the fingerprint under `kh`; the only way to obtain a readable record.
    pub fn verify(self, kh: &KeyHandler) -> CryptoResult<SecretRecord> {
        fingerprint_mac(kh, self.fields.iter().map(Vec::as_slice))?
            .verify_slice(&self.fingerprint)
            .map_err(|_| CryptoError::Integrity)?;

        let count = self.fields.len();
        let mut fields: [Option<Vec<u8>>; MAX_FIELDS] = Default::default();
        for (slot, field) in fields.iter_mut().zip(self.fields) {
            *slot = Some(field);
        }
        Ok(SecretRecord {
            fields,
            count,
            fingerprint: Some(self.fingerprint),
        })
    }
}

fn fingerprint_mac<'a>(
    kh: &KeyHandler,
    fields: impl Iterator<Item = &'a [u8]>,
) -> CryptoResult<HmacSha512> {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(kh.integrity_key())
        .map_err(|_| CryptoError::InvalidKey("hmac key"))?;
    for (i, field) in fields.enumerate() {
        mac.update(format!("info{}:{}:", i + 1, field.len()).as_bytes());
        mac.update(field);
        mac.update(b";");
    }
    mac.update(kh.suite().to_string().as_bytes());
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{MasterSecret, MASTER_SECRET_SIZE};
    use crate::keys::CipherSuite;
    use proptest::prelude::*;

    fn kh(suite: &str) -> KeyHandler {
        let ms = MasterSecret::from_bytes([0x11; MASTER_SECRET_SIZE]);
        KeyHandler::new(&ms, suite.parse::<CipherSuite>().unwrap()).unwrap()
    }

    fn one_stage() -> KeyHandler {
        kh("x25519;aes-256-gcm;;;;")
    }

    #[test]
    fn test_pickle_verify_roundtrip() {
        let kh = one_stage();
        let record = SecretRecord::encrypt(&kh, &["github", "alice", "s3cret"]).unwrap();
        let bytes = record.to_bytes().unwrap();
        let restored = UnverifiedRecord::from_bytes(&bytes).unwrap().verify(&kh).unwrap();
        assert_eq!(restored, record);
        assert_eq!(restored.decrypt_field(&kh, 3).unwrap(), b"s3cret");
    }

    #[test]
    fn test_mutation_requires_seal() {
        let kh = one_stage();
        let mut record = SecretRecord::encrypt(&kh, &["a"]).unwrap();
        record.push_field(&kh, b"b").unwrap();
        assert!(!record.is_sealed());
        assert!(record.to_bytes().is_err());
        record.seal(&kh).unwrap();
        record.set_field(&kh, 1, b"A").unwrap();
        assert!(record.to_bytes().is_err());
        record.seal(&kh).unwrap();
        assert_eq!(record.decrypt_all(&kh).unwrap(), vec![b"A".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_field_bounds() {
        let kh = one_stage();
        let values = vec!["x"; MAX_FIELDS + 1];
        assert!(SecretRecord::encrypt(&kh, &values).is_err());
        assert!(SecretRecord::encrypt::<&str>(&kh, &[]).is_err());

        let mut record = SecretRecord::encrypt(&kh, &values[..MAX_FIELDS]).unwrap();
        assert!(record.push_field(&kh, b"ninth").is_err());
        assert!(record.decrypt_field(&kh, 0).is_err());
        assert!(record.decrypt_field(&kh, MAX_FIELDS + 1).is_err());
    }

    #[test]
    fn test_fingerprint_binds_suite() {
        let a = one_stage();
        let record = SecretRecord::encrypt(&a, &["title"]).unwrap();
        let bytes = record.to_bytes().unwrap();
        let b = kh("x25519;aes-256-gcm;secp256r1;aes-256-siv;;");
        assert!(matches!(
            UnverifiedRecord::from_bytes(&bytes).unwrap().verify(&b),
            Err(CryptoError::Integrity)
        ));
    }

    #[test]
    fn test_dropped_field_detected() {
        let kh = one_stage();
        let record = SecretRecord::encrypt(&kh, &["one", "two"]).unwrap();
        let mut pickled: Pickled = serde_json::from_slice(&record.to_bytes().unwrap()).unwrap();
        pickled.fields.pop();
        let bytes = serde_json::to_vec(&pickled).unwrap();
        assert!(UnverifiedRecord::from_bytes(&bytes).unwrap().verify(&kh).is_err());
    }

    #[test]
    fn test_reencrypt() {
        let old = one_stage();
        let new = kh("secp384r1;chacha20-poly1305;x25519;xchacha20-poly1305;;");
        let record = SecretRecord::encrypt(&old, &["mail", "pw"]).unwrap();
        let migrated = record.reencrypt(&old, &new).unwrap();
        assert!(migrated.is_sealed());
        assert_eq!(migrated.decrypt_field(&new, 2).unwrap(), b"pw");
        assert!(migrated.decrypt_field(&old, 2).is_err());
    }

    #[test]
    fn test_matches() {
        let kh = one_stage();
        let record = SecretRecord::encrypt(&kh, &["GitHub", "alice@example.com"]).unwrap();
        assert!(record.matches(&kh, "github", false).unwrap());
        assert!(!record.matches(&kh, "example", false).unwrap());
        assert!(record.matches(&kh, "EXAMPLE", true).unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn integrity_is_tamper_sensitive(
            values in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..4),
            which in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let kh = one_stage();
            let record = SecretRecord::encrypt(&kh, &values).unwrap();
            let mut pickled: Pickled = serde_json::from_slice(&record.to_bytes().unwrap()).unwrap();

            let field = which.index(pickled.fields.len());
            let mut raw = base64_decode(&pickled.fields[field]).unwrap();
            let pos = which.index(raw.len());
            raw[pos] ^= 1 << bit;
            pickled.fields[field] = base64_encode(&raw);

            let bytes = serde_json::to_vec(&pickled).unwrap();
            let verdict = UnverifiedRecord::from_bytes(&bytes).unwrap().verify(&kh);
            prop_assert!(matches!(verdict, Err(CryptoError::Integrity)));
        }
    }
}
