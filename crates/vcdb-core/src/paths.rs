use crate::atomic::restrict_dir_permissions;
use crate::crypto::sha256_hex;
use crate::error::{Result, VaultError};
use crate::key_vault::KEY_ENTRY_NAME;
use directories::ProjectDirs;
use std::fs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "vcdb";
pub const APP_NAME: &str = "vault";

pub const DATA_DIR_ENV: &str = "VCDB_DATA_DIR";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_dir) = std::env::var(DATA_DIR_ENV) {
        if !override_dir.is_empty() {
            return Ok(PathBuf::from(override_dir));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| VaultError::InvalidInput("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Every file the engine reads or writes, derived from one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultPaths {
    root: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(data_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database(&self) -> PathBuf {
        self.root.join("vault.db.enc")
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("vault-config.json")
    }

    pub fn recovery_state(&self) -> PathBuf {
        self.root.join("recovery-state.json")
    }

    pub fn backup_settings(&self) -> PathBuf {
        self.root.join("backup-settings.json")
    }

    pub fn settings(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn recovery_dir(&self) -> PathBuf {
        self.root.join("recovery")
    }

    /// Secure-store entry holding this vault's key. Distinct data
    /// directories get distinct entries, so one vault's setup never replaces
    /// another's key.
    pub fn key_entry_name(&self) -> String {
        let root = fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        let digest = sha256_hex(root.to_string_lossy().as_bytes());
        format!("{KEY_ENTRY_NAME}:{}", &digest[..16])
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        restrict_dir_permissions(&self.root);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_hangs_off_one_root() {
        let paths = VaultPaths::new("/tmp/vcdb-test");
        assert_eq!(paths.database(), PathBuf::from("/tmp/vcdb-test/vault.db.enc"));
        assert_eq!(paths.config(), PathBuf::from("/tmp/vcdb-test/vault-config.json"));
        assert_eq!(paths.backups_dir(), PathBuf::from("/tmp/vcdb-test/backups"));
        assert_eq!(paths.recovery_dir(), PathBuf::from("/tmp/vcdb-test/recovery"));
    }

    #[test]
    fn ensure_dirs_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let paths = VaultPaths::new(dir.path().join("nested").join("vault"));
        paths.ensure_dirs().unwrap();
        assert!(paths.root().is_dir());
    }

    #[test]
    fn key_entry_is_per_root() {
        let dir = tempfile::tempdir().unwrap();
        let a = VaultPaths::new(dir.path().join("a"));
        let b = VaultPaths::new(dir.path().join("b"));
        a.ensure_dirs().unwrap();
        b.ensure_dirs().unwrap();

        assert_ne!(a.key_entry_name(), b.key_entry_name());
        assert!(a.key_entry_name().starts_with(KEY_ENTRY_NAME));
        // the same directory reached through a different spelling
        let a_again = VaultPaths::new(dir.path().join("b").join("..").join("a"));
        assert_eq!(a_again.key_entry_name(), a.key_entry_name());
    }
}
