//! Encrypted backup archives.
//!
//! An archive is a gzip-compressed tar holding the encrypted database blob
//! exactly as the codec produced it, a JSON manifest, and a small plaintext
//! extract of contact details for manual recovery. The database itself never
//! appears in plaintext inside an archive.

use crate::atomic::{
    cleanup_staging_dir, restrict_dir_permissions, write_atomic, StagedWrite,
};
use crate::codec::{self, ALGORITHM, BLOB_MAGIC};
use crate::crypto::sha256_hex;
use crate::error::{Result, VaultError};
use crate::persistence::{Export, PersistenceCoordinator};
use crate::schedule::{is_due, is_overdue, BackupWindow, CatchUp};
use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BACKUP_FORMAT_VERSION: u32 = 1;
pub const DEFAULT_MAX_BACKUPS: usize = 7;

pub const BLOB_ENTRY: &str = "vault.db.enc";
pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const RECOVERY_ENTRY: &str = "recovery-export.json";

const NAME_PREFIX: &str = "vcdb-backup-";
const NAME_SUFFIX: &str = ".tar.gz";
const NAME_TIME_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupFrequency {
    Daily,
    Weekly,
}

impl BackupFrequency {
    pub fn interval(self) -> Duration {
        match self {
            BackupFrequency::Daily => Duration::days(1),
            BackupFrequency::Weekly => Duration::weeks(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSettings {
    pub enabled: bool,
    pub frequency: BackupFrequency,
    pub max_backups: usize,
    #[serde(default)]
    pub last_backup_at: Option<DateTime<Utc>>,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: BackupFrequency::Daily,
            max_backups: DEFAULT_MAX_BACKUPS,
            last_backup_at: None,
        }
    }
}

impl BackupSettings {
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "unreadable backup settings, using defaults");
                Self::default()
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read backup settings, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionInfo {
    pub algorithm: String,
    pub header_magic: String,
    pub format_version: u16,
    pub key_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub app_version: String,
    pub backup_format_version: u32,
    pub created_at: DateTime<Utc>,
    pub encryption: EncryptionInfo,
    pub blob_sha256: String,
}

impl BackupManifest {
    fn describe(created_at: DateTime<Utc>, blob: &[u8], key_fingerprint: &str) -> Result<Self> {
        let info = codec::inspect(blob)?;
        Ok(Self {
            app_version: APP_VERSION.to_string(),
            backup_format_version: BACKUP_FORMAT_VERSION,
            created_at,
            encryption: EncryptionInfo {
                algorithm: ALGORITHM.to_string(),
                header_magic: String::from_utf8_lossy(BLOB_MAGIC).into_owned(),
                format_version: info.format.version(),
                key_fingerprint: key_fingerprint.to_string(),
            },
            blob_sha256: sha256_hex(blob),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryContact {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryExport {
    pub exported_at: DateTime<Utc>,
    pub contacts: Vec<RecoveryContact>,
}

fn read_recovery_export(conn: &Connection) -> rusqlite::Result<RecoveryExport> {
    let mut stmt = conn.prepare(
        "SELECT id, first_name, last_name, company, email, phone
         FROM contacts ORDER BY last_name, first_name, id",
    )?;
    let contacts = stmt
        .query_map([], |row| {
            Ok(RecoveryContact {
                id: row.get(0)?,
                first_name: row.get(1)?,
                last_name: row.get(2)?,
                company: row.get(3)?,
                email: row.get(4)?,
                phone: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(RecoveryExport {
        exported_at: Utc::now(),
        contacts,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupInfo {
    pub path: PathBuf,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Contents of an archive that passed validation.
#[derive(Debug)]
pub struct BackupArchive {
    pub manifest: BackupManifest,
    pub blob: Vec<u8>,
    pub recovery: RecoveryExport,
}

pub fn archive_name(created_at: DateTime<Utc>) -> String {
    format!("{NAME_PREFIX}{}{NAME_SUFFIX}", created_at.format(NAME_TIME_FORMAT))
}

/// Creation time encoded in an archive file name, or `None` for anything
/// that is not one of ours.
pub fn parse_archive_name(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(NAME_PREFIX)?.strip_suffix(NAME_SUFFIX)?;
    let naive = NaiveDateTime::parse_from_str(stamp, NAME_TIME_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// Read an archive, check that all three entries are present and that the
/// blob matches its manifest digest and carries a known header.
pub fn open_archive(path: &Path) -> Result<BackupArchive> {
    let file = File::open(path).map_err(VaultError::restore)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut blob = None;
    let mut manifest = None;
    let mut recovery = None;

    for entry in archive.entries().map_err(VaultError::restore)? {
        let mut entry = entry.map_err(VaultError::restore)?;
        let name = entry
            .path()
            .map_err(VaultError::restore)?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(VaultError::restore)?;
        match name.as_str() {
            BLOB_ENTRY => blob = Some(data),
            MANIFEST_ENTRY => {
                manifest = Some(
                    serde_json::from_slice::<BackupManifest>(&data).map_err(VaultError::restore)?,
                )
            }
            RECOVERY_ENTRY => {
                recovery = Some(
                    serde_json::from_slice::<RecoveryExport>(&data).map_err(VaultError::restore)?,
                )
            }
            other => warn!(entry = other, "ignoring unexpected archive entry"),
        }
    }

    let missing = |entry: &str| VaultError::RestoreFailed(format!("archive has no {entry}"));
    let blob = blob.ok_or_else(|| missing(BLOB_ENTRY))?;
    let manifest = manifest.ok_or_else(|| missing(MANIFEST_ENTRY))?;
    let recovery = recovery.ok_or_else(|| missing(RECOVERY_ENTRY))?;

    if manifest.backup_format_version > BACKUP_FORMAT_VERSION {
        return Err(VaultError::RestoreFailed(format!(
            "archive format {} is newer than supported {BACKUP_FORMAT_VERSION}",
            manifest.backup_format_version
        )));
    }
    if sha256_hex(&blob) != manifest.blob_sha256 {
        return Err(VaultError::RestoreFailed(
            "database blob does not match manifest digest".into(),
        ));
    }
    codec::inspect(&blob).map_err(VaultError::restore)?;

    Ok(BackupArchive {
        manifest,
        blob,
        recovery,
    })
}

fn write_archive(file: &mut File, mtime: u64, entries: &[(&str, &[u8])]) -> io::Result<()> {
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_mtime(mtime);
        builder.append_data(&mut header, name, *data)?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

pub struct BackupManager {
    coordinator: Arc<PersistenceCoordinator>,
    backup_dir: PathBuf,
    settings_path: PathBuf,
    window: BackupWindow,
    catch_up_delay: Duration,
    settings: Mutex<BackupSettings>,
    catch_up: Mutex<Option<CatchUp>>,
    running: Mutex<()>,
}

impl BackupManager {
    pub fn new(
        coordinator: Arc<PersistenceCoordinator>,
        backup_dir: impl AsRef<Path>,
        settings_path: impl AsRef<Path>,
    ) -> Self {
        let settings_path = settings_path.as_ref().to_path_buf();
        let settings = BackupSettings::load(&settings_path);
        Self {
            coordinator,
            backup_dir: backup_dir.as_ref().to_path_buf(),
            settings_path,
            window: BackupWindow::default(),
            catch_up_delay: Duration::seconds(60),
            settings: Mutex::new(settings),
            catch_up: Mutex::new(None),
            running: Mutex::new(()),
        }
    }

    pub fn with_schedule(mut self, window: BackupWindow, catch_up_delay: Duration) -> Self {
        self.window = window;
        self.catch_up_delay = catch_up_delay;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn settings(&self) -> BackupSettings {
        self.settings.lock().clone()
    }

    pub fn update_settings(
        &self,
        enabled: Option<bool>,
        frequency: Option<BackupFrequency>,
        max_backups: Option<usize>,
    ) -> Result<BackupSettings> {
        if max_backups == Some(0) {
            return Err(VaultError::InvalidInput("max backups must be at least 1".into()));
        }
        let mut settings = self.settings.lock();
        let mut updated = settings.clone();
        if let Some(enabled) = enabled {
            updated.enabled = enabled;
        }
        if let Some(frequency) = frequency {
            updated.frequency = frequency;
        }
        if let Some(max) = max_backups {
            updated.max_backups = max;
        }
        updated.save(&self.settings_path)?;
        *settings = updated.clone();
        Ok(updated)
    }

    /// Write a new archive from the live database, then rotate.
    ///
    /// Fails with `Locked` when no session is open; any other failure is
    /// reported as `BackupFailed` and leaves the vault itself untouched.
    pub fn run_backup(&self) -> Result<BackupInfo> {
        let _running = self.running.lock();
        let Export {
            blob,
            key_fingerprint,
            extra: recovery,
        } = self
            .coordinator
            .export_with(read_recovery_export)
            .map_err(|e| match e {
                VaultError::Locked => VaultError::Locked,
                other => VaultError::backup(other),
            })?;

        fs::create_dir_all(&self.backup_dir).map_err(VaultError::backup)?;
        restrict_dir_permissions(&self.backup_dir);
        let swept = cleanup_staging_dir(&self.backup_dir);
        if swept > 0 {
            info!(swept, "removed staging files from interrupted backups");
        }

        let created_at = self.next_timestamp(Utc::now());
        let manifest = BackupManifest::describe(created_at, &blob, &key_fingerprint)
            .map_err(VaultError::backup)?;
        let manifest_json = serde_json::to_vec_pretty(&manifest).map_err(VaultError::backup)?;
        let recovery_json = serde_json::to_vec_pretty(&recovery).map_err(VaultError::backup)?;

        let file_name = archive_name(created_at);
        let path = self.backup_dir.join(&file_name);
        let mtime = created_at.timestamp().max(0) as u64;
        let staged = StagedWrite::write_with(&path, |file| {
            write_archive(
                file,
                mtime,
                &[
                    (BLOB_ENTRY, blob.as_slice()),
                    (MANIFEST_ENTRY, manifest_json.as_slice()),
                    (RECOVERY_ENTRY, recovery_json.as_slice()),
                ],
            )
        })
        .map_err(VaultError::backup)?;
        staged.commit().map_err(VaultError::backup)?;
        let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        {
            let mut settings = self.settings.lock();
            settings.last_backup_at = Some(created_at);
            if let Err(e) = settings.save(&self.settings_path) {
                warn!(error = %e, "cannot record last backup time");
            }
        }
        if let Err(e) = self.rotate() {
            warn!(error = %e, "backup rotation failed");
        }

        info!(
            file = %file_name,
            size_bytes,
            contacts = recovery.contacts.len(),
            "backup written"
        );
        Ok(BackupInfo {
            path,
            file_name,
            created_at,
            size_bytes,
        })
    }

    /// Delete archives beyond the retention count, oldest first.
    pub fn rotate(&self) -> Result<usize> {
        let keep = self.settings.lock().max_backups.max(1);
        let mut removed = 0;
        for stale in self.list_backups()?.into_iter().skip(keep) {
            fs::remove_file(&stale.path).map_err(VaultError::backup)?;
            info!(file = %stale.file_name, "rotated out old backup");
            removed += 1;
        }
        Ok(removed)
    }

    /// Archives in the backup directory, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut backups: Vec<BackupInfo> = entries
            .flatten()
            .filter_map(|entry| {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let created_at = parse_archive_name(&file_name)?;
                let size_bytes = entry.metadata().ok()?.len();
                Some(BackupInfo {
                    path: entry.path(),
                    file_name,
                    created_at,
                    size_bytes,
                })
            })
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    pub fn delete_backup(&self, file_name: &str) -> Result<()> {
        if parse_archive_name(file_name).is_none() {
            return Err(VaultError::InvalidInput(format!(
                "{file_name} is not a backup archive name"
            )));
        }
        fs::remove_file(self.backup_dir.join(file_name))?;
        info!(file = file_name, "backup deleted");
        Ok(())
    }

    /// Arm the post-unlock catch-up when a backup is already overdue.
    pub fn on_unlock(&self, now: DateTime<Utc>) {
        if is_overdue(&self.settings.lock(), now) {
            *self.catch_up.lock() = Some(CatchUp::new(now, self.catch_up_delay));
            info!(delay_secs = self.catch_up_delay.num_seconds(), "backup overdue; catch-up armed");
        }
    }

    pub fn on_lock(&self) {
        self.catch_up.lock().take();
    }

    /// One scheduler check. Never runs while the vault is locked.
    pub fn scheduled_tick(&self, now: DateTime<Utc>) -> Result<Option<BackupInfo>> {
        if !self.coordinator.is_loaded() {
            return Ok(None);
        }
        let settings = self.settings();
        let catch_up_fired = {
            let mut armed = self.catch_up.lock();
            if armed.map_or(false, |catch_up| catch_up.ready(now)) {
                armed.take();
                is_overdue(&settings, now)
            } else {
                false
            }
        };
        if catch_up_fired || is_due(&settings, &self.window, &now.with_timezone(&Local)) {
            return self.run_backup().map(Some);
        }
        Ok(None)
    }

    fn next_timestamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = Utc
            .timestamp_millis_opt(now.timestamp_millis())
            .single()
            .unwrap_or(now);
        let newest_listed = self
            .list_backups()
            .ok()
            .and_then(|list| list.first().map(|b| b.created_at));
        let newest = [self.settings.lock().last_backup_at, newest_listed]
            .into_iter()
            .flatten()
            .max();
        match newest {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use rusqlite::params;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        dir: TempDir,
        key: EncryptionKey,
        coordinator: Arc<PersistenceCoordinator>,
        manager: BackupManager,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let key = EncryptionKey::generate();
        let coordinator = Arc::new(PersistenceCoordinator::new(dir.path().join("vault.db.enc")));
        coordinator.create(&key).unwrap();
        coordinator
            .execute(
                "INSERT INTO contacts (id, first_name, last_name, email) VALUES (?1, ?2, ?3, ?4)",
                params!["c1", "Ada", "Lovelace", "ada@example.com"],
            )
            .unwrap();
        let manager = BackupManager::new(
            coordinator.clone(),
            dir.path().join("backups"),
            dir.path().join("backup-settings.json"),
        )
        .with_schedule(BackupWindow::ALL_DAY, Duration::seconds(60));
        Fixture {
            dir,
            key,
            coordinator,
            manager,
        }
    }

    #[test]
    fn archive_holds_ciphertext_manifest_and_extract() {
        let f = fixture();
        let info = f.manager.run_backup().unwrap();
        assert!(info.file_name.starts_with("vcdb-backup-"));
        assert!(info.file_name.ends_with(".tar.gz"));

        let archive = open_archive(&info.path).unwrap();
        assert_eq!(archive.manifest.backup_format_version, BACKUP_FORMAT_VERSION);
        assert_eq!(archive.manifest.encryption.algorithm, "AES-256-GCM");
        assert_eq!(archive.manifest.encryption.header_magic, "VCDB");
        assert_eq!(archive.manifest.encryption.key_fingerprint, f.key.fingerprint());
        assert_eq!(archive.manifest.created_at, info.created_at);
        assert_eq!(&archive.blob[..4], BLOB_MAGIC);
        assert!(codec::decode(&archive.blob, &f.key).is_ok());
        assert_eq!(archive.recovery.contacts.len(), 1);
        assert_eq!(archive.recovery.contacts[0].email.as_deref(), Some("ada@example.com"));

        // nothing in the archive file is the raw engine image
        let raw = fs::read(&info.path).unwrap();
        let mut decoded = Vec::new();
        GzDecoder::new(&raw[..]).read_to_end(&mut decoded).unwrap();
        assert!(!String::from_utf8_lossy(&decoded).contains("SQLite format 3"));
    }

    #[test]
    fn manifest_json_field_names() {
        let f = fixture();
        let info = f.manager.run_backup().unwrap();
        let archive = open_archive(&info.path).unwrap();
        let value = serde_json::to_value(&archive.manifest).unwrap();
        for field in ["appVersion", "backupFormatVersion", "createdAt", "blobSha256"] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        for field in ["algorithm", "headerMagic", "formatVersion", "keyFingerprint"] {
            assert!(value["encryption"].get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn rotation_keeps_the_newest_n() {
        let f = fixture();
        f.manager.update_settings(None, None, Some(3)).unwrap();
        let mut written = Vec::new();
        for _ in 0..6 {
            written.push(f.manager.run_backup().unwrap().file_name);
        }
        let left: Vec<String> = f
            .manager
            .list_backups()
            .unwrap()
            .into_iter()
            .map(|b| b.file_name)
            .collect();
        let mut expected: Vec<String> = written[3..].to_vec();
        expected.reverse();
        assert_eq!(left, expected);
    }

    #[test]
    fn names_strictly_increase() {
        let f = fixture();
        let a = f.manager.run_backup().unwrap();
        let b = f.manager.run_backup().unwrap();
        assert!(b.created_at > a.created_at);
        assert!(b.file_name > a.file_name);
        assert_eq!(f.manager.settings().last_backup_at, Some(b.created_at));
    }

    #[test]
    fn locked_vault_cannot_be_backed_up() {
        let f = fixture();
        f.coordinator.unload();
        assert!(matches!(f.manager.run_backup(), Err(VaultError::Locked)));
        assert!(f.manager.list_backups().unwrap().is_empty());
    }

    #[test]
    fn tampered_archive_blob_is_rejected() {
        let f = fixture();
        let info = f.manager.run_backup().unwrap();
        let archive = open_archive(&info.path).unwrap();

        let mut blob = archive.blob.clone();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let manifest = serde_json::to_vec(&archive.manifest).unwrap();
        let recovery = serde_json::to_vec(&archive.recovery).unwrap();
        let forged = f.dir.path().join("backups").join(archive_name(Utc::now()));
        let mut file = File::create(&forged).unwrap();
        write_archive(
            &mut file,
            0,
            &[
                (BLOB_ENTRY, blob.as_slice()),
                (MANIFEST_ENTRY, manifest.as_slice()),
                (RECOVERY_ENTRY, recovery.as_slice()),
            ],
        )
        .unwrap();
        drop(file);

        assert!(matches!(
            open_archive(&forged),
            Err(VaultError::RestoreFailed(_))
        ));
    }

    #[test]
    fn settings_persist_and_reject_zero_retention() {
        let f = fixture();
        assert_eq!(f.manager.settings(), BackupSettings::default());
        f.manager
            .update_settings(Some(false), Some(BackupFrequency::Weekly), Some(2))
            .unwrap();
        assert!(matches!(
            f.manager.update_settings(None, None, Some(0)),
            Err(VaultError::InvalidInput(_))
        ));
        let reloaded = BackupSettings::load(&f.dir.path().join("backup-settings.json"));
        assert!(!reloaded.enabled);
        assert_eq!(reloaded.frequency, BackupFrequency::Weekly);
        assert_eq!(reloaded.max_backups, 2);
        let json = fs::read_to_string(f.dir.path().join("backup-settings.json")).unwrap();
        assert!(json.contains("\"weekly\""));
        assert!(json.contains("maxBackups"));
    }

    #[test]
    fn delete_backup_checks_the_name() {
        let f = fixture();
        let info = f.manager.run_backup().unwrap();
        assert!(matches!(
            f.manager.delete_backup("../vault.db.enc"),
            Err(VaultError::InvalidInput(_))
        ));
        f.manager.delete_backup(&info.file_name).unwrap();
        assert!(f.manager.list_backups().unwrap().is_empty());
    }

    #[test]
    fn catch_up_fires_once_after_unlock() {
        let f = fixture();
        let manager = BackupManager::new(
            f.coordinator.clone(),
            f.dir.path().join("backups"),
            f.dir.path().join("backup-settings.json"),
        )
        .with_schedule(
            BackupWindow {
                start_hour: 0,
                end_hour: 0,
            },
            Duration::seconds(60),
        );
        let unlocked_at = Utc::now();
        manager.on_unlock(unlocked_at);

        assert!(manager.scheduled_tick(unlocked_at).unwrap().is_none());
        let fired = manager
            .scheduled_tick(unlocked_at + Duration::seconds(61))
            .unwrap();
        assert!(fired.is_some());
        assert!(manager
            .scheduled_tick(unlocked_at + Duration::seconds(120))
            .unwrap()
            .is_none());
    }

    #[test]
    fn interrupted_archive_is_swept_by_the_next_run() {
        let f = fixture();
        f.manager.run_backup().unwrap();
        let target = f.manager.backup_dir().join(archive_name(Utc::now()));
        let staged = StagedWrite::write(&target, b"partial archive").unwrap();
        let leftover = staged.staging_path().to_path_buf();
        std::mem::forget(staged);

        f.manager.run_backup().unwrap();
        assert!(!leftover.exists());
        let stray = fs::read_dir(f.manager.backup_dir())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".staging"))
            .count();
        assert_eq!(stray, 0);
        assert_eq!(f.manager.list_backups().unwrap().len(), 2);
    }

    #[test]
    fn tick_is_a_no_op_while_locked() {
        let f = fixture();
        f.coordinator.unload();
        assert!(f.manager.scheduled_tick(Utc::now()).unwrap().is_none());
    }

    #[test]
    fn archive_names_parse_back() {
        let at = Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap() + Duration::milliseconds(42);
        let name = archive_name(at);
        assert_eq!(name, "vcdb-backup-20240506T070809.042Z.tar.gz");
        assert_eq!(parse_archive_name(&name), Some(at));
        assert_eq!(parse_archive_name("notes.txt"), None);
    }
}
