//! The engine as the rest of an application sees it.
//!
//! One `VaultService` per data directory. It owns the key vault, the
//! persistence coordinator, the backup manager and the recovery controller,
//! and applies the cross-cutting rules: safe mode blocks mutation, activity
//! feeds the idle lock, unlock and lock start and stop the backup scheduler.

use crate::backup::{BackupInfo, BackupManager, BackupManifest};
use crate::crypto::EncryptionKey;
use crate::error::{Result, VaultError};
use crate::idle::IdleTracker;
use crate::key_vault::KeyVault;
use crate::master_record::MasterKeyRecord;
use crate::paths::VaultPaths;
use crate::persistence::PersistenceCoordinator;
use crate::recovery::{DiagnosticsReport, RecoveryController, RecoveryState, SafeModeReason};
use crate::schedule::spawn_scheduler;
use crate::secure_store::{KeyringStore, SecureKeyStore};
use crate::settings::EngineSettings;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultStatus {
    Uninitialized,
    Locked,
    Unlocked,
}

impl fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VaultStatus::Uninitialized => "uninitialized",
            VaultStatus::Locked => "locked",
            VaultStatus::Unlocked => "unlocked",
        })
    }
}

pub struct VaultService {
    paths: VaultPaths,
    settings: EngineSettings,
    key_vault: KeyVault,
    coordinator: Arc<PersistenceCoordinator>,
    backups: Arc<BackupManager>,
    recovery: RecoveryController,
    idle: IdleTracker,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl VaultService {
    /// Open the vault under `paths` with the settings file found there and
    /// the platform keyring.
    pub fn open(paths: VaultPaths) -> Result<Self> {
        paths.ensure_dirs()?;
        let settings = EngineSettings::load(&paths.settings())?;
        let store = Arc::new(KeyringStore::new(settings.keyring_service.clone()));
        Self::open_with(paths, settings, store)
    }

    pub fn open_with(
        paths: VaultPaths,
        settings: EngineSettings,
        store: Arc<dyn SecureKeyStore>,
    ) -> Result<Self> {
        paths.ensure_dirs()?;
        let key_vault = KeyVault::new(paths.config(), store, settings.kdf)
            .with_entry_name(paths.key_entry_name());
        let coordinator = Arc::new(PersistenceCoordinator::new(paths.database()));
        let backups = Arc::new(
            BackupManager::new(
                coordinator.clone(),
                paths.backups_dir(),
                paths.backup_settings(),
            )
            .with_schedule(
                settings.scheduler.window,
                Duration::seconds(settings.scheduler.catch_up_delay_secs as i64),
            ),
        );
        let recovery = RecoveryController::open(
            paths.recovery_state(),
            paths.recovery_dir(),
            settings.crash_threshold,
        );
        Ok(Self {
            paths,
            settings,
            key_vault,
            coordinator,
            backups,
            recovery,
            idle: IdleTracker::new(Utc::now()),
            scheduler: Mutex::new(None),
        })
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn coordinator(&self) -> &Arc<PersistenceCoordinator> {
        &self.coordinator
    }

    pub fn backups(&self) -> &Arc<BackupManager> {
        &self.backups
    }

    /// Mark this process session as running. Call once per process before
    /// anything else.
    pub fn start(&self) -> Result<RecoveryState> {
        let state = self.recovery.record_start(Utc::now())?;
        if state.safe_mode_enabled {
            warn!(reason = ?state.safe_mode_reason, "starting in safe mode");
        }
        Ok(state)
    }

    /// Lock and record a clean exit.
    pub fn shutdown(&self) -> Result<()> {
        self.lock();
        self.recovery.mark_clean_exit()?;
        info!("vault service shut down cleanly");
        Ok(())
    }

    pub fn status(&self) -> VaultStatus {
        if !self.key_vault.is_initialized() {
            VaultStatus::Uninitialized
        } else if self.coordinator.is_loaded() {
            VaultStatus::Unlocked
        } else {
            VaultStatus::Locked
        }
    }

    /// Create the vault. Leaves it unlocked on success.
    pub fn setup(&self, password: &str) -> Result<()> {
        if self.key_vault.is_initialized() {
            return Err(VaultError::AlreadyInitialized);
        }
        let db_path = self.coordinator.db_path().to_path_buf();
        if db_path.exists() {
            let copy = self.recovery.defensive_copy(&db_path, "orphan")?;
            fs::remove_file(&db_path)?;
            warn!(defensive_copy = ?copy, "moved aside database file that had no vault config");
        }

        let coordinator = &self.coordinator;
        let result = self
            .key_vault
            .setup_with(password, |key| coordinator.create(key));
        if let Err(e) = result {
            coordinator.unload();
            return Err(e);
        }
        self.on_unlocked();
        Ok(())
    }

    pub fn unlock(&self, password: &str) -> Result<()> {
        let key = self.key_vault.unlock(password)?;
        if self.coordinator.is_loaded() {
            self.idle.touch(Utc::now());
            return Ok(());
        }
        self.load_session(&key)?;
        self.on_unlocked();
        Ok(())
    }

    /// Drop the session. Waits for an in-flight save or backup export.
    pub fn lock(&self) -> bool {
        self.stop_scheduler();
        self.backups.on_lock();
        self.coordinator.unload()
    }

    pub fn change_password(&self, old: &str, new: &str) -> Result<()> {
        self.ensure_writable()?;
        if !self.coordinator.is_loaded() {
            return Err(VaultError::Locked);
        }
        let coordinator = &self.coordinator;
        self.key_vault
            .change_password(old, new, |key| coordinator.rekey(key))?;
        self.idle.touch(Utc::now());

        // archives written before this point are sealed under the retired key
        if self.backups.settings().enabled {
            if let Err(e) = self.backups.run_backup() {
                warn!(error = %e, "backup after password change failed");
            }
        }
        Ok(())
    }

    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let value = self.coordinator.read(f)?;
        self.idle.touch(Utc::now());
        Ok(value)
    }

    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        self.ensure_writable()?;
        let value = self.coordinator.write(f)?;
        self.idle.touch(Utc::now());
        Ok(value)
    }

    pub fn execute<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.write(|tx| tx.execute(sql, params))
    }

    pub fn export_encrypted(&self) -> Result<Vec<u8>> {
        self.coordinator.export_encrypted()
    }

    pub fn run_backup(&self) -> Result<BackupInfo> {
        self.backups.run_backup()
    }

    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        self.backups.list_backups()
    }

    pub fn restore_from_backup(&self, archive: &Path) -> Result<BackupManifest> {
        self.recovery.restore_from_backup(&self.coordinator, archive)
    }

    /// Delete the database file (after a defensive copy). The credentials
    /// stay, so the next unlock starts an empty database under the same key
    /// and the copy remains readable.
    pub fn reset_database(&self) -> Result<Option<PathBuf>> {
        self.stop_scheduler();
        self.backups.on_lock();
        self.recovery.reset_database(&self.coordinator)
    }

    pub fn safe_mode_status(&self) -> RecoveryState {
        self.recovery.status()
    }

    pub fn enter_safe_mode(&self, reason: SafeModeReason) -> Result<()> {
        self.recovery.enter_safe_mode(reason)
    }

    pub fn exit_safe_mode(&self) -> Result<()> {
        self.recovery.exit_safe_mode()
    }

    pub fn diagnostics(&self) -> DiagnosticsReport {
        let backups = self.backups.list_backups().unwrap_or_else(|e| {
            warn!(error = %e, "cannot list backups for diagnostics");
            Vec::new()
        });
        self.recovery
            .diagnostics(&self.paths.database(), &self.paths.config(), backups)
    }

    pub fn export_diagnostics(&self, dest: &Path) -> Result<DiagnosticsReport> {
        let report = self.diagnostics();
        self.recovery.export_diagnostics(&report, dest)?;
        Ok(report)
    }

    pub fn preferences(&self) -> Result<MasterKeyRecord> {
        self.key_vault.record()
    }

    pub fn update_preferences(
        &self,
        idle_timeout_minutes: Option<u32>,
        lock_on_minimize: Option<bool>,
    ) -> Result<MasterKeyRecord> {
        self.key_vault
            .update_preferences(idle_timeout_minutes, lock_on_minimize)
    }

    /// Window minimized. Locks when the user asked for that.
    pub fn on_minimize(&self) -> Result<bool> {
        if !self.coordinator.is_loaded() || !self.key_vault.record()?.lock_on_minimize {
            return Ok(false);
        }
        info!("locking on minimize");
        Ok(self.lock())
    }

    /// Lock if the idle timeout has elapsed since the last read or write.
    pub fn check_idle(&self, now: DateTime<Utc>) -> Result<bool> {
        if !self.coordinator.is_loaded() {
            return Ok(false);
        }
        let timeout = self.key_vault.record()?.idle_timeout_minutes;
        if !self.idle.expired(now, timeout) {
            return Ok(false);
        }
        info!(timeout_minutes = timeout, "idle timeout reached; locking");
        Ok(self.lock())
    }

    fn load_session(&self, key: &EncryptionKey) -> Result<()> {
        match self.coordinator.load(key) {
            Ok(()) => Ok(()),
            Err(VaultError::DatabaseMissing(path)) => {
                warn!(path = %path, "database file missing; starting an empty database");
                self.coordinator.create(key)
            }
            Err(e @ VaultError::MigrationFailed { .. }) => {
                error!(error = %e, "schema migration failed; entering safe mode");
                self.recovery.enter_safe_mode(SafeModeReason::MigrationFailure)?;
                Err(e)
            }
            Err(VaultError::DecryptionFailed) => {
                // the password was accepted, so the key is right and the file is not
                error!("database does not decrypt under the stored key; entering safe mode");
                self.recovery.enter_safe_mode(SafeModeReason::VaultCorrupt)?;
                Err(VaultError::DecryptionFailed)
            }
            Err(e) => Err(e),
        }
    }

    fn on_unlocked(&self) {
        let now = Utc::now();
        self.idle.touch(now);
        self.backups.on_unlock(now);
        self.start_scheduler();
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.recovery.is_safe_mode() {
            return Err(VaultError::SafeMode);
        }
        Ok(())
    }

    /// Spawn the backup timer when running inside a tokio runtime. Outside
    /// one (tests, one-shot CLI commands) scheduling is left to the caller.
    fn start_scheduler(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let handle = spawn_scheduler(
            self.backups.clone(),
            std::time::Duration::from_secs(self.settings.scheduler.check_interval_secs.max(1)),
            std::time::Duration::from_secs(self.settings.scheduler.catch_up_delay_secs),
        );
        if let Some(previous) = self.scheduler.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_scheduler(&self) {
        if let Some(handle) = self.scheduler.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for VaultService {
    fn drop(&mut self) {
        self.stop_scheduler();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::secure_store::MemoryKeyStore;
    use rusqlite::params;
    use tempfile::{tempdir, TempDir};

    fn service(dir: &TempDir, store: Arc<MemoryKeyStore>) -> VaultService {
        let settings = EngineSettings {
            kdf: KdfParams::insecure_fast(),
            ..EngineSettings::default()
        };
        VaultService::open_with(VaultPaths::new(dir.path()), settings, store).unwrap()
    }

    #[test]
    fn lifecycle_statuses() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, Arc::new(MemoryKeyStore::new()));
        assert_eq!(svc.status(), VaultStatus::Uninitialized);
        svc.setup("Str0ngP@ss").unwrap();
        assert_eq!(svc.status(), VaultStatus::Unlocked);
        assert!(svc.lock());
        assert_eq!(svc.status(), VaultStatus::Locked);
        svc.unlock("Str0ngP@ss").unwrap();
        assert_eq!(svc.status(), VaultStatus::Unlocked);
    }

    #[test]
    fn vaults_in_different_directories_keep_separate_keys() {
        let store = Arc::new(MemoryKeyStore::new());
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();

        let a = service(&dir_a, store.clone());
        a.setup("Str0ngP@ss").unwrap();
        a.execute("INSERT INTO contacts (id) VALUES (?1)", params!["c1"])
            .unwrap();
        let fingerprint_a = a.coordinator().key_fingerprint().unwrap();
        a.lock();

        let b = service(&dir_b, store.clone());
        b.setup("Str0ngP@ss").unwrap();
        assert_ne!(b.coordinator().key_fingerprint().unwrap(), fingerprint_a);

        a.unlock("Str0ngP@ss").unwrap();
        assert_eq!(a.coordinator().key_fingerprint().unwrap(), fingerprint_a);
        let count: i64 = a
            .read(|c| c.query_row("SELECT COUNT(*) FROM contacts", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
        assert!(!a.safe_mode_status().safe_mode_enabled);
        assert!(store.contains(&a.paths().key_entry_name()));
        assert!(store.contains(&b.paths().key_entry_name()));
    }

    #[test]
    fn orphaned_database_is_moved_aside_at_setup() {
        let dir = tempdir().unwrap();
        let paths = VaultPaths::new(dir.path());
        fs::write(paths.database(), b"leftover bytes").unwrap();

        let svc = service(&dir, Arc::new(MemoryKeyStore::new()));
        svc.setup("Str0ngP@ss").unwrap();
        let copies: Vec<_> = fs::read_dir(paths.recovery_dir())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(copies.len(), 1);
        assert!(copies[0].starts_with("vault.db.enc.orphan-"));
    }

    #[test]
    fn failed_setup_leaves_no_session() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryKeyStore::new());
        store.set_fail_writes(true);
        let svc = service(&dir, store);
        assert!(matches!(svc.setup("Str0ngP@ss"), Err(VaultError::Keychain(_))));
        assert_eq!(svc.status(), VaultStatus::Uninitialized);
        assert!(!svc.coordinator().is_loaded());
    }

    #[test]
    fn safe_mode_blocks_mutation_but_not_reads() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, Arc::new(MemoryKeyStore::new()));
        svc.setup("Str0ngP@ss").unwrap();
        svc.execute("INSERT INTO contacts (id) VALUES (?1)", params!["c1"])
            .unwrap();

        svc.enter_safe_mode(SafeModeReason::Manual).unwrap();
        assert!(matches!(
            svc.execute("INSERT INTO contacts (id) VALUES (?1)", params!["c2"]),
            Err(VaultError::SafeMode)
        ));
        assert!(matches!(
            svc.change_password("Str0ngP@ss", "An0therP@ss"),
            Err(VaultError::SafeMode)
        ));
        let count: i64 = svc
            .read(|c| c.query_row("SELECT COUNT(*) FROM contacts", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
        assert!(svc.run_backup().is_ok());

        svc.exit_safe_mode().unwrap();
        svc.execute("INSERT INTO contacts (id) VALUES (?1)", params!["c2"])
            .unwrap();
    }

    #[test]
    fn idle_timeout_locks() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, Arc::new(MemoryKeyStore::new()));
        svc.setup("Str0ngP@ss").unwrap();
        svc.update_preferences(Some(5), None).unwrap();

        let now = Utc::now();
        assert!(!svc.check_idle(now + Duration::minutes(4)).unwrap());
        assert!(svc.check_idle(now + Duration::minutes(6)).unwrap());
        assert_eq!(svc.status(), VaultStatus::Locked);
    }

    #[test]
    fn minimize_locks_only_when_configured() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, Arc::new(MemoryKeyStore::new()));
        svc.setup("Str0ngP@ss").unwrap();
        assert!(!svc.on_minimize().unwrap());
        svc.update_preferences(None, Some(true)).unwrap();
        assert!(svc.on_minimize().unwrap());
        assert_eq!(svc.status(), VaultStatus::Locked);
    }

    #[test]
    fn reset_database_then_unlock_starts_empty() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, Arc::new(MemoryKeyStore::new()));
        svc.setup("Str0ngP@ss").unwrap();
        svc.execute("INSERT INTO contacts (id) VALUES (?1)", params!["c1"])
            .unwrap();

        let copy = svc.reset_database().unwrap();
        assert!(copy.is_some());
        assert_eq!(svc.status(), VaultStatus::Locked);

        svc.unlock("Str0ngP@ss").unwrap();
        let count: i64 = svc
            .read(|c| c.query_row("SELECT COUNT(*) FROM contacts", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn corrupt_database_enters_safe_mode_on_unlock() {
        let dir = tempdir().unwrap();
        let svc = service(&dir, Arc::new(MemoryKeyStore::new()));
        svc.setup("Str0ngP@ss").unwrap();
        svc.lock();

        let path = svc.paths().database();
        let mut blob = fs::read(&path).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        fs::write(&path, blob).unwrap();

        assert!(matches!(
            svc.unlock("Str0ngP@ss"),
            Err(VaultError::DecryptionFailed)
        ));
        let state = svc.safe_mode_status();
        assert!(state.safe_mode_enabled);
        assert_eq!(state.safe_mode_reason, Some(SafeModeReason::VaultCorrupt));
    }
}
