//! Per-account vault contents
//!
//! Records are kept opaque (pickled bytes, base64 in the JSON file); indices
//! are assigned from a counter that never goes backwards, so a deleted index
//! is never handed out again.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Validated account key: lowercase base32 characters only, so it is always a
/// safe file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountName(String);

impl AccountName {
    pub fn new(name: impl Into<String>) -> StoreResult<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= 128
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || (b'2'..=b'7').contains(&b));
        if !valid {
            return Err(StoreError::InvalidName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Enough to correlate log lines without printing the whole key
        write!(f, "{}…", &self.0[..self.0.len().min(12)])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultData {
    /// Cipher suite text the records are sealed under (None until configured)
    #[serde(default)]
    pub suite: Option<String>,
    /// Suite of an unfinished migration; cleared on success or rollback
    #[serde(default)]
    pub pending_suite: Option<String>,
    /// Last index handed out
    #[serde(default)]
    pub next_index: u64,
    /// index → base64 pickled record
    #[serde(default)]
    pub records: BTreeMap<u64, String>,
}

impl VaultData {
    pub fn get(&self, index: u64) -> StoreResult<Option<Vec<u8>>> {
        self.records
            .get(&index)
            .map(|encoded| decode(index, encoded))
            .transpose()
    }

    /// Store a record under a fresh index and return it.
    pub fn insert_new(&mut self, record: &[u8]) -> u64 {
        self.next_index += 1;
        self.records.insert(self.next_index, STANDARD.encode(record));
        self.next_index
    }

    /// Replace an existing record. Returns false when the index is unknown.
    pub fn put(&mut self, index: u64, record: &[u8]) -> bool {
        match self.records.get_mut(&index) {
            Some(slot) => {
                *slot = STANDARD.encode(record);
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, index: u64) -> bool {
        self.records.remove(&index).is_some()
    }

    /// Every record in index order.
    pub fn list(&self) -> StoreResult<Vec<(u64, Vec<u8>)>> {
        self.records
            .iter()
            .map(|(&index, encoded)| Ok((index, decode(index, encoded)?)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn decode(index: u64, encoded: &str) -> StoreResult<Vec<u8>> {
    STANDARD.decode(encoded).map_err(|e| StoreError::Corrupt {
        path: Default::default(),
        reason: format!("record {index}: {e}"),
    })
}
