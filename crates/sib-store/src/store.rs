//! Account store backends
//!
//! Two backends are available:
//!   - **JSON files** (daemon default): one `<account>.json` per account,
//!     flushed atomically through a uniquely named temp file.
//!   - **Memory**: a mutex-guarded map, for tests and ephemeral servers.
//!
//! Both implement `AccountStore`, so the protocol layer can use either
//! transparently. Each backend also hands out one async lock per account;
//! callers hold it across a load-modify-save so that concurrent sessions on
//! the same account do not overwrite each other.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Mutex as AsyncMutex;

use crate::error::{StoreError, StoreResult};
use crate::vault::{AccountName, VaultData};

/// Persistence boundary of the vault server.
pub trait AccountStore: Send + Sync {
    /// Atomically create an empty vault. Returns false if it already exists.
    fn create(&self, account: &AccountName) -> StoreResult<bool>;
    fn exists(&self, account: &AccountName) -> StoreResult<bool>;
    /// Load a vault; `StoreError::NotFound` if it does not exist.
    fn load(&self, account: &AccountName) -> StoreResult<VaultData>;
    /// Replace a vault's contents in one step.
    fn save(&self, account: &AccountName, data: &VaultData) -> StoreResult<()>;
    /// Returns false if the vault did not exist.
    fn delete(&self, account: &AccountName) -> StoreResult<bool>;
    /// The lock serializing read-modify-write cycles on `account`.
    fn account_lock(&self, account: &AccountName) -> Arc<AsyncMutex<()>>;
}

/// Per-account async locks. Entries only live while someone holds the lock
/// handle; dead ones are pruned whenever a new lock is created.
#[derive(Debug, Default)]
pub struct AccountLocks {
    locks: Mutex<HashMap<AccountName, Weak<AsyncMutex<()>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, account: &AccountName) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(account).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, lock| lock.strong_count() > 0);
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(account.clone(), Arc::downgrade(&lock));
        lock
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One JSON file per account under a directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
    locks: Arc<AccountLocks>,
}

impl JsonFileStore {
    /// Open (creating if needed) the store directory.
    pub fn open(dir: &Path) -> StoreResult<Self> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        tracing::debug!(dir = %dir.display(), "account store opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            locks: Arc::new(AccountLocks::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, account: &AccountName) -> PathBuf {
        self.dir.join(format!("{}.json", account.as_str()))
    }
}

impl AccountStore for JsonFileStore {
    fn create(&self, account: &AccountName) -> StoreResult<bool> {
        let path = self.path(account);
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let json = serde_json::to_vec_pretty(&VaultData::default()).map_err(|e| {
            StoreError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        file.write_all(&json).map_err(|e| StoreError::io(&path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&path, e))?;
        Ok(true)
    }

    fn exists(&self, account: &AccountName) -> StoreResult<bool> {
        Ok(self.path(account).is_file())
    }

    fn load(&self, account: &AccountName) -> StoreResult<VaultData> {
        let path = self.path(account);
        let content = match std::fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(account.to_string()))
            }
            Err(e) => return Err(StoreError::io(path, e)),
        };
        serde_json::from_slice(&content).map_err(|e| StoreError::Corrupt {
            path,
            reason: e.to_string(),
        })
    }

    fn save(&self, account: &AccountName, data: &VaultData) -> StoreResult<()> {
        let path = self.path(account);
        if !path.exists() {
            return Err(StoreError::NotFound(account.to_string()));
        }
        let json = serde_json::to_vec_pretty(data).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        // Atomic write: unique temp file in the same directory, then rename
        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        tmp.write_all(&json)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| StoreError::io(&path, e.error))?;
        Ok(())
    }

    fn delete(&self, account: &AccountName) -> StoreResult<bool> {
        let path = self.path(account);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn account_lock(&self, account: &AccountName) -> Arc<AsyncMutex<()>> {
        self.locks.get(account)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    vaults: Mutex<HashMap<AccountName, VaultData>>,
    locks: AccountLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<AccountName, VaultData>>> {
        self.vaults.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl AccountStore for MemoryStore {
    fn create(&self, account: &AccountName) -> StoreResult<bool> {
        let mut vaults = self.lock()?;
        if vaults.contains_key(account) {
            return Ok(false);
        }
        vaults.insert(account.clone(), VaultData::default());
        Ok(true)
    }

    fn exists(&self, account: &AccountName) -> StoreResult<bool> {
        Ok(self.lock()?.contains_key(account))
    }

    fn load(&self, account: &AccountName) -> StoreResult<VaultData> {
        self.lock()?
            .get(account)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(account.to_string()))
    }

    fn save(&self, account: &AccountName, data: &VaultData) -> StoreResult<()> {
        match self.lock()?.get_mut(account) {
            Some(slot) => {
                *slot = data.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(account.to_string())),
        }
    }

    fn delete(&self, account: &AccountName) -> StoreResult<bool> {
        Ok(self.lock()?.remove(account).is_some())
    }

    fn account_lock(&self, account: &AccountName) -> Arc<AsyncMutex<()>> {
        self.locks.get(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountName {
        AccountName::new("mzxw6ytboi2dcmrt").unwrap()
    }

    fn exercise(store: &dyn AccountStore) {
        let acct = account();
        assert!(!store.exists(&acct).unwrap());
        assert!(matches!(store.load(&acct), Err(StoreError::NotFound(_))));
        assert!(store.save(&acct, &VaultData::default()).is_err());

        assert!(store.create(&acct).unwrap());
        assert!(!store.create(&acct).unwrap(), "second create must fail");
        assert!(store.exists(&acct).unwrap());

        let mut vault = store.load(&acct).unwrap();
        assert!(vault.is_empty());
        vault.suite = Some("x25519;aes-256-gcm;;;;".into());
        let idx = vault.insert_new(b"{\"fields\":[]}");
        store.save(&acct, &vault).unwrap();

        let reloaded = store.load(&acct).unwrap();
        assert_eq!(reloaded, vault);
        assert_eq!(reloaded.get(idx).unwrap().unwrap(), b"{\"fields\":[]}");

        assert!(store.delete(&acct).unwrap());
        assert!(!store.delete(&acct).unwrap());
        assert!(!store.exists(&acct).unwrap());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_json_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(&dir.path().join("accounts")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_json_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let acct = account();
        store.create(&acct).unwrap();
        store.save(&acct, &VaultData::default()).unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![format!("{}.json", acct.as_str())]);
    }

    #[test]
    fn test_json_concurrent_saves_use_distinct_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(dir.path()).unwrap());
        let acct = account();
        store.create(&acct).unwrap();

        let writers: Vec<_> = (0..8u8)
            .map(|n| {
                let store = store.clone();
                let acct = acct.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        let mut vault = VaultData::default();
                        vault.insert_new(&[n; 16]);
                        store.save(&acct, &vault).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(store.load(&acct).unwrap().len(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_account_lock_shared_per_account() {
        let store = MemoryStore::new();
        let other = AccountName::new("nbswy3dpeb3w64tm").unwrap();

        let first = store.account_lock(&account());
        let again = store.account_lock(&account());
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &store.account_lock(&other)));

        drop((first, again));
        let _fresh = store.account_lock(&other);
        assert_eq!(store.locks.len(), 1, "released locks are pruned");
    }

    #[tokio::test]
    async fn test_account_lock_serializes_updates() {
        let store = Arc::new(MemoryStore::new());
        let acct = account();
        store.create(&acct).unwrap();

        let tasks: Vec<_> = (0..16u8)
            .map(|n| {
                let store = store.clone();
                let acct = acct.clone();
                tokio::spawn(async move {
                    let lock = store.account_lock(&acct);
                    let _guard = lock.lock().await;
                    let mut vault = store.load(&acct).unwrap();
                    tokio::task::yield_now().await;
                    vault.insert_new(&[n]);
                    store.save(&acct, &vault).unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.load(&acct).unwrap().len(), 16);
    }

    #[test]
    fn test_json_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let acct = account();
        std::fs::write(dir.path().join(format!("{}.json", acct.as_str())), "{not json").unwrap();
        assert!(matches!(store.load(&acct), Err(StoreError::Corrupt { .. })));
    }
}
