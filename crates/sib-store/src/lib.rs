//! sib-store: persistence boundary of the SIBVault server
//!
//! Each account owns one vault: its cipher suite, an optional pending suite
//! (set while a reconfiguration migrates records) and its pickled records.
//! Record contents stay opaque here; integrity is checked by the protocol layer.

pub mod error;
pub mod store;
pub mod vault;

pub use error::{StoreError, StoreResult};
pub use store::{AccountLocks, AccountStore, JsonFileStore, MemoryStore};
pub use vault::{AccountName, VaultData};
