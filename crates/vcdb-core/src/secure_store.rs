//! OS secret store access behind a small capability trait.

use crate::error::{Result, VaultError};
use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use zeroize::Zeroizing;

pub const DEFAULT_SERVICE_NAME: &str = "VcdbVault";

pub trait SecureKeyStore: Send + Sync {
    /// `Ok(None)` when no entry exists under `name`.
    fn get(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>>;
    fn set(&self, name: &str, value: &[u8]) -> Result<()>;
    /// Deleting a missing entry is not an error.
    fn delete(&self, name: &str) -> Result<()>;
}

/// Platform keychain / credential manager / secret service via `keyring`.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, name: &str) -> Result<Entry> {
        Entry::new(&self.service, name).map_err(|e| VaultError::Keychain(format!("keyring init: {e}")))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_NAME)
    }
}

impl SecureKeyStore for KeyringStore {
    fn get(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        let encoded = match self.entry(name)?.get_password() {
            Ok(value) => Zeroizing::new(value),
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(VaultError::Keychain(format!("load secret: {e}"))),
        };
        let decoded = general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| VaultError::Keychain(format!("decode secret: {e}")))?;
        Ok(Some(Zeroizing::new(decoded)))
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<()> {
        let encoded = Zeroizing::new(general_purpose::STANDARD.encode(value));
        self.entry(name)?
            .set_password(&encoded)
            .map_err(|e| VaultError::Keychain(format!("store secret: {e}")))
    }

    fn delete(&self, name: &str) -> Result<()> {
        match self.entry(name)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(VaultError::Keychain(format!("delete secret: {e}"))),
        }
    }
}

/// In-process store. Counts every call so callers can assert the store was
/// (or was not) touched, and can be told to fail or to silently drop writes.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<HashMap<String, Zeroizing<Vec<u8>>>>,
    accesses: AtomicUsize,
    fail_all: AtomicBool,
    fail_writes: AtomicBool,
    drop_writes: AtomicBool,
    fail_read_back: AtomicBool,
    read_back_pending: AtomicBool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accesses(&self) -> usize {
        self.accesses.load(Ordering::SeqCst)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    /// Every call returns a keychain error, as when the OS store is locked.
    pub fn set_unavailable(&self, on: bool) {
        self.fail_all.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    /// Writes report success but store nothing.
    pub fn set_drop_writes(&self, on: bool) {
        self.drop_writes.store(on, Ordering::SeqCst);
    }

    /// The first read after each successful write fails, as when the OS
    /// store accepts a secret and then errors on the confirming lookup.
    pub fn set_fail_read_back(&self, on: bool) {
        self.fail_read_back.store(on, Ordering::SeqCst);
        if !on {
            self.read_back_pending.store(false, Ordering::SeqCst);
        }
    }

    fn touch(&self) -> Result<()> {
        self.accesses.fetch_add(1, Ordering::SeqCst);
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(VaultError::Keychain("secure store unavailable".into()));
        }
        Ok(())
    }
}

impl SecureKeyStore for MemoryKeyStore {
    fn get(&self, name: &str) -> Result<Option<Zeroizing<Vec<u8>>>> {
        self.touch()?;
        if self.read_back_pending.swap(false, Ordering::SeqCst) {
            return Err(VaultError::Keychain("transient read failure".into()));
        }
        Ok(self.entries.lock().get(name).cloned())
    }

    fn set(&self, name: &str, value: &[u8]) -> Result<()> {
        self.touch()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(VaultError::Keychain("write rejected".into()));
        }
        if !self.drop_writes.load(Ordering::SeqCst) {
            self.entries
                .lock()
                .insert(name.to_string(), Zeroizing::new(value.to_vec()));
        }
        if self.fail_read_back.load(Ordering::SeqCst) {
            self.read_back_pending.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.touch()?;
        self.entries.lock().remove(name);
        Ok(())
    }
}
