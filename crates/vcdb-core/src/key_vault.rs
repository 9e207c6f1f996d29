//! Master password gate and custody of the database key.
//!
//! The key is random and lives only in the secure store (and in memory while
//! unlocked). The password merely unlocks access to it: the config file holds
//! an Argon2id verification hash that is checked before the store is touched.

use crate::crypto::{check_password_strength, EncryptionKey, KdfParams};
use crate::error::{Result, VaultError};
use crate::master_record::MasterKeyRecord;
use crate::secure_store::SecureKeyStore;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const KEY_ENTRY_NAME: &str = "database-encryption-key";

pub struct KeyVault {
    config_path: PathBuf,
    store: Arc<dyn SecureKeyStore>,
    entry_name: String,
    kdf: KdfParams,
}

impl KeyVault {
    pub fn new(config_path: impl AsRef<Path>, store: Arc<dyn SecureKeyStore>, kdf: KdfParams) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            store,
            entry_name: KEY_ENTRY_NAME.to_string(),
            kdf,
        }
    }

    /// Use a different secure-store entry, e.g. one per vault directory.
    pub fn with_entry_name(mut self, name: impl Into<String>) -> Self {
        self.entry_name = name.into();
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn is_initialized(&self) -> bool {
        self.config_path.exists()
    }

    pub fn record(&self) -> Result<MasterKeyRecord> {
        MasterKeyRecord::load(&self.config_path)?.ok_or(VaultError::NotInitialized)
    }

    pub fn setup(&self, password: &str) -> Result<EncryptionKey> {
        self.setup_with(password, |_| Ok(()))
    }

    /// Generate and store a new key, run `init` with it, then write the
    /// config. The config is written last, so a vault whose config exists
    /// always has a confirmed key and an initialized database. A crash before
    /// that point leaves the vault uninitialized and setup can be retried.
    pub fn setup_with<F>(&self, password: &str, init: F) -> Result<EncryptionKey>
    where
        F: FnOnce(&EncryptionKey) -> Result<()>,
    {
        if self.is_initialized() {
            return Err(VaultError::AlreadyInitialized);
        }
        check_password_strength(password)?;

        let key = EncryptionKey::generate();
        self.store_key(&key)?;
        init(&key)?;

        let record = MasterKeyRecord::new(password, self.kdf)?;
        record.save(&self.config_path)?;
        info!(fingerprint = %key.fingerprint(), "vault set up");
        Ok(key)
    }

    pub fn unlock(&self, password: &str) -> Result<EncryptionKey> {
        self.verify(password)?;
        let key = self.load_key()?;
        info!("vault key released");
        Ok(key)
    }

    /// Check `password` against the config without touching the secure store.
    pub fn verify(&self, password: &str) -> Result<MasterKeyRecord> {
        let record = self.record()?;
        if !record.verify(password)? {
            warn!("unlock rejected: password mismatch");
            return Err(VaultError::InvalidPassword);
        }
        Ok(record)
    }

    /// Replace the password and rotate the database key.
    ///
    /// `rekey` must re-encrypt the database under the key it is given and
    /// return only once that is durable. Nothing in the secure store or the
    /// config changes until it has succeeded. If the new key then cannot be
    /// stored, the old key is written back to the store and `rekey` is
    /// called again with it, so the store and the database agree.
    pub fn change_password<F>(&self, old: &str, new: &str, mut rekey: F) -> Result<EncryptionKey>
    where
        F: FnMut(&EncryptionKey) -> Result<()>,
    {
        let mut record = self.verify(old)?;
        check_password_strength(new)?;
        let old_key = self.load_key()?;
        let new_key = EncryptionKey::generate();

        rekey(&new_key)?;

        if let Err(store_err) = self.store_key(&new_key) {
            warn!(error = %store_err, "storing rotated key failed; reverting database key");
            // the write may have landed even though confirming it failed
            if let Err(e) = self.store.set(&self.entry_name, old_key.as_bytes()) {
                warn!(error = %e, "restoring previous key in secure store failed");
            }
            if let Err(revert_err) = rekey(&old_key) {
                warn!(error = %revert_err, "reverting database key failed");
                return Err(VaultError::Keychain(format!(
                    "{store_err}; database could not be reverted: {revert_err}"
                )));
            }
            return Err(store_err);
        }

        record.set_password(new, self.kdf)?;
        record.save(&self.config_path)?;
        info!(fingerprint = %new_key.fingerprint(), "password changed and key rotated");
        Ok(new_key)
    }

    pub fn update_preferences(
        &self,
        idle_timeout_minutes: Option<u32>,
        lock_on_minimize: Option<bool>,
    ) -> Result<MasterKeyRecord> {
        let mut record = self.record()?;
        if let Some(minutes) = idle_timeout_minutes {
            record.idle_timeout_minutes = minutes;
        }
        if let Some(flag) = lock_on_minimize {
            record.lock_on_minimize = flag;
        }
        record.save(&self.config_path)?;
        Ok(record)
    }

    /// Forget the vault: drop the stored key and the config file.
    pub fn reset(&self) -> Result<()> {
        self.store.delete(&self.entry_name)?;
        match fs::remove_file(&self.config_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        warn!("vault credentials reset");
        Ok(())
    }

    fn store_key(&self, key: &EncryptionKey) -> Result<()> {
        self.store.set(&self.entry_name, key.as_bytes())?;
        match self.store.get(&self.entry_name)? {
            Some(stored) if stored.as_slice() == key.as_bytes() => Ok(()),
            _ => Err(VaultError::Keychain(
                "key read back from secure store does not match".into(),
            )),
        }
    }

    fn load_key(&self) -> Result<EncryptionKey> {
        let bytes = self
            .store
            .get(&self.entry_name)?
            .ok_or(VaultError::KeyNotFound)?;
        EncryptionKey::from_slice(&bytes)
            .map_err(|_| VaultError::Keychain("stored key has the wrong length".into()))
    }
}
