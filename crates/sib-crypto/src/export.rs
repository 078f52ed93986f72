//! Export/import transcoding of a vault's records
//!
//! Two JSON formats:
//! ```text
//! {"format": "clear",     "records": [["title", "login", ...], ...]}
//! {"format": "encrypted", "suite": "c1;ci1;c2;ci2;c3;ci3", "records": ["<b64 pickled>", ...]}
//! ```
//! An encrypted export can only be imported with the master secret it was
//! produced under. Imports always yield records sealed under the current
//! key handler.

use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::MasterSecret;
use crate::keys::{CipherSuite, KeyHandler};
use crate::record::{SecretRecord, UnverifiedRecord};
use crate::{base64_decode, base64_encode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum ExportFile {
    Clear { records: Vec<Vec<String>> },
    Encrypted { suite: String, records: Vec<String> },
}

impl ExportFile {
    pub fn len(&self) -> usize {
        match self {
            ExportFile::Clear { records } => records.len(),
            ExportFile::Encrypted { records, .. } => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| CryptoError::Export(format!("serialization: {e}")))
    }

    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        serde_json::from_slice(data).map_err(|e| CryptoError::Export(format!("deserialization: {e}")))
    }
}

/// Decrypt every record into plain UTF-8 strings.
pub fn export_clear(kh: &KeyHandler, records: &[SecretRecord]) -> CryptoResult<ExportFile> {
    let records = records
        .iter()
        .map(|record| {
            record
                .decrypt_all(kh)?
                .into_iter()
                .map(|value| {
                    String::from_utf8(value)
                        .map_err(|_| CryptoError::Export("field is not UTF-8 text".into()))
                })
                .collect::<CryptoResult<Vec<_>>>()
        })
        .collect::<CryptoResult<Vec<_>>>()?;
    Ok(ExportFile::Clear { records })
}

/// Keep records encrypted, tagged with the suite they are sealed under.
pub fn export_encrypted(kh: &KeyHandler, records: &[SecretRecord]) -> CryptoResult<ExportFile> {
    let records = records
        .iter()
        .map(|record| record.to_bytes().map(|bytes| base64_encode(&bytes)))
        .collect::<CryptoResult<Vec<_>>>()?;
    Ok(ExportFile::Encrypted {
        suite: kh.suite().to_string(),
        records,
    })
}

/// Turn an export file back into records sealed under `current`.
pub fn import(
    ms: &MasterSecret,
    current: &KeyHandler,
    file: &ExportFile,
) -> CryptoResult<Vec<SecretRecord>> {
    match file {
        ExportFile::Clear { records } => records
            .iter()
            .map(|values| SecretRecord::encrypt(current, values))
            .collect(),
        ExportFile::Encrypted { suite, records } => {
            let suite: CipherSuite = suite.parse()?;
            let source = if &suite == current.suite() {
                None
            } else {
                Some(KeyHandler::new(ms, suite)?)
            };
            let source_kh = source.as_ref().unwrap_or(current);
            records
                .iter()
                .map(|encoded| {
                    let bytes = base64_decode(encoded).map_err(CryptoError::Export)?;
                    let record = UnverifiedRecord::from_bytes(&bytes)?.verify(source_kh)?;
                    match &source {
                        Some(old) => record.reencrypt(old, current),
                        None => Ok(record),
                    }
                })
                .collect()
        }
    }
}
