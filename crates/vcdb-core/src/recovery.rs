//! Crash tracking, safe mode and the recovery actions available in it.
//!
//! `Clean -> Dirty` on every process start, `Dirty -> Clean` on graceful
//! exit. A start that finds the previous session still dirty counts as a
//! crash; enough consecutive crashes switch safe mode on.

use crate::atomic::{durable_copy, restrict_dir_permissions, write_atomic};
use crate::backup::{open_archive, BackupInfo, BackupManifest, APP_VERSION};
use crate::codec;
use crate::error::{Result, VaultError};
use crate::persistence::PersistenceCoordinator;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const DEFAULT_CRASH_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafeModeReason {
    Manual,
    CrashLoop,
    MigrationFailure,
    VaultCorrupt,
    #[serde(other)]
    Unknown,
}

impl SafeModeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafeModeReason::Manual => "MANUAL",
            SafeModeReason::CrashLoop => "CRASH_LOOP",
            SafeModeReason::MigrationFailure => "MIGRATION_FAILURE",
            SafeModeReason::VaultCorrupt => "VAULT_CORRUPT",
            SafeModeReason::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for SafeModeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryState {
    pub last_clean_exit: bool,
    pub crash_count: u32,
    pub last_crash_at: Option<DateTime<Utc>>,
    pub safe_mode_enabled: bool,
    pub safe_mode_reason: Option<SafeModeReason>,
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self {
            last_clean_exit: true,
            crash_count: 0,
            last_crash_at: None,
            safe_mode_enabled: false,
            safe_mode_reason: None,
        }
    }
}

impl RecoveryState {
    pub fn enter(&mut self, reason: SafeModeReason) {
        self.safe_mode_enabled = true;
        self.safe_mode_reason = Some(reason);
    }

    pub fn exit(&mut self) {
        self.safe_mode_enabled = false;
        self.safe_mode_reason = None;
        self.crash_count = 0;
    }

    fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt recovery state, starting clean");
                Self::default()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read recovery state, starting clean");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDiagnostics {
    pub path: PathBuf,
    pub present: bool,
    pub size_bytes: Option<u64>,
    pub format: Option<String>,
    pub format_version: Option<u16>,
    pub format_error: Option<String>,
}

/// Support report. Contains file metadata and state only; nothing here is
/// decrypted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub app_version: String,
    pub generated_at: DateTime<Utc>,
    pub recovery: RecoveryState,
    pub database: DatabaseDiagnostics,
    pub config_present: bool,
    pub backups: Vec<BackupInfo>,
    pub defensive_copies: Vec<String>,
}

pub struct RecoveryController {
    state_path: PathBuf,
    recovery_dir: PathBuf,
    threshold: u32,
    state: Mutex<RecoveryState>,
}

impl RecoveryController {
    pub fn open(state_path: impl AsRef<Path>, recovery_dir: impl AsRef<Path>, threshold: u32) -> Self {
        let state_path = state_path.as_ref().to_path_buf();
        let state = RecoveryState::load(&state_path);
        Self {
            state_path,
            recovery_dir: recovery_dir.as_ref().to_path_buf(),
            threshold: threshold.max(1),
            state: Mutex::new(state),
        }
    }

    pub fn status(&self) -> RecoveryState {
        self.state.lock().clone()
    }

    pub fn is_safe_mode(&self) -> bool {
        self.state.lock().safe_mode_enabled
    }

    /// Mark the session dirty, counting the previous one as a crash if it
    /// never reached `mark_clean_exit`.
    pub fn record_start(&self, now: DateTime<Utc>) -> Result<RecoveryState> {
        let mut state = self.state.lock();
        if !state.last_clean_exit {
            state.crash_count += 1;
            state.last_crash_at = Some(now);
            warn!(crash_count = state.crash_count, "previous session did not exit cleanly");
            if state.crash_count >= self.threshold && !state.safe_mode_enabled {
                state.enter(SafeModeReason::CrashLoop);
                error!(crash_count = state.crash_count, "crash loop detected; entering safe mode");
            }
        }
        state.last_clean_exit = false;
        self.persist(&state)?;
        Ok(state.clone())
    }

    pub fn mark_clean_exit(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.last_clean_exit = true;
        state.crash_count = 0;
        self.persist(&state)
    }

    pub fn enter_safe_mode(&self, reason: SafeModeReason) -> Result<()> {
        let mut state = self.state.lock();
        state.enter(reason);
        warn!(reason = %reason, "safe mode entered");
        self.persist(&state)
    }

    pub fn exit_safe_mode(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.safe_mode_enabled {
            return Ok(());
        }
        state.exit();
        info!("safe mode cleared");
        self.persist(&state)
    }

    /// Replace the primary database with the blob from a backup archive.
    ///
    /// The archive is fully validated, and while a session is open its key
    /// fingerprint must match the session key, before the current file is
    /// copied aside and replaced.
    pub fn restore_from_backup(
        &self,
        coordinator: &PersistenceCoordinator,
        archive_path: &Path,
    ) -> Result<BackupManifest> {
        let archive = open_archive(archive_path)?;
        match coordinator.key_fingerprint() {
            Some(current) if current != archive.manifest.encryption.key_fingerprint => {
                return Err(VaultError::RestoreFailed(
                    "backup was sealed under a different encryption key".into(),
                ));
            }
            Some(_) => {}
            None => warn!("restoring while locked; key match is checked on next unlock"),
        }

        let copy = self.defensive_copy(coordinator.db_path(), "pre-restore")?;
        coordinator.replace_primary(&archive.blob)?;
        info!(
            archive = %archive_path.display(),
            defensive_copy = ?copy,
            "database restored from backup"
        );
        Ok(archive.manifest)
    }

    /// Delete the primary database after copying it aside.
    pub fn reset_database(&self, coordinator: &PersistenceCoordinator) -> Result<Option<PathBuf>> {
        let copy = self.defensive_copy(coordinator.db_path(), "pre-reset")?;
        coordinator.discard_primary()?;
        warn!(defensive_copy = ?copy, "primary database reset");
        Ok(copy)
    }

    /// Copy `source` into the recovery directory as
    /// `<file>.<label>-<timestamp>`. Returns `None` when there is nothing to
    /// copy.
    pub fn defensive_copy(&self, source: &Path, label: &str) -> Result<Option<PathBuf>> {
        if !source.exists() {
            return Ok(None);
        }
        fs::create_dir_all(&self.recovery_dir).map_err(VaultError::restore)?;
        restrict_dir_permissions(&self.recovery_dir);
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vault.db.enc".to_string());
        let dest = self.recovery_dir.join(format!(
            "{file_name}.{label}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        durable_copy(source, &dest).map_err(VaultError::restore)?;
        info!(dest = %dest.display(), "defensive copy written");
        Ok(Some(dest))
    }

    pub fn defensive_copies(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.recovery_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn diagnostics(&self, db_path: &Path, config_path: &Path, backups: Vec<BackupInfo>) -> DiagnosticsReport {
        DiagnosticsReport {
            app_version: APP_VERSION.to_string(),
            generated_at: Utc::now(),
            recovery: self.status(),
            database: inspect_database(db_path),
            config_present: config_path.exists(),
            backups,
            defensive_copies: self.defensive_copies(),
        }
    }

    pub fn export_diagnostics(&self, report: &DiagnosticsReport, dest: &Path) -> Result<()> {
        write_atomic(dest, &serde_json::to_vec_pretty(report)?)?;
        info!(dest = %dest.display(), "diagnostics exported");
        Ok(())
    }

    fn persist(&self, state: &RecoveryState) -> Result<()> {
        write_atomic(&self.state_path, &serde_json::to_vec_pretty(state)?)?;
        Ok(())
    }
}

fn inspect_database(path: &Path) -> DatabaseDiagnostics {
    let mut diag = DatabaseDiagnostics {
        path: path.to_path_buf(),
        present: false,
        size_bytes: None,
        format: None,
        format_version: None,
        format_error: None,
    };
    match fs::read(path) {
        Ok(blob) => {
            diag.present = true;
            diag.size_bytes = Some(blob.len() as u64);
            match codec::inspect(&blob) {
                Ok(info) => {
                    diag.format = Some(format!("{:?}", info.format));
                    diag.format_version = Some(info.format.version());
                }
                Err(e) => diag.format_error = Some(e.to_string()),
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => diag.format_error = Some(e.to_string()),
    }
    diag
}
