use crate::crypto::KdfParams;
use crate::error::Result;
use crate::recovery::DEFAULT_CRASH_THRESHOLD;
use crate::schedule::BackupWindow;
use crate::secure_store::DEFAULT_SERVICE_NAME;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    pub window: BackupWindow,
    pub catch_up_delay_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            window: BackupWindow::default(),
            catch_up_delay_secs: 60,
            check_interval_secs: 3600,
        }
    }
}

/// Engine tuning read from `settings.json`. Every field is optional in the
/// file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub kdf: KdfParams,
    pub crash_threshold: u32,
    pub keyring_service: String,
    pub scheduler: SchedulerSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            kdf: KdfParams::default(),
            crash_threshold: DEFAULT_CRASH_THRESHOLD,
            keyring_service: DEFAULT_SERVICE_NAME.to_string(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

impl EngineSettings {
    /// Missing file means defaults; a malformed one is an error so a typo
    /// does not silently weaken the KDF.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read engine settings");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use tempfile::tempdir;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let settings = EngineSettings::load(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.crash_threshold, 3);
        assert_eq!(settings.scheduler.window, BackupWindow { start_hour: 2, end_hour: 5 });
    }

    #[test]
    fn partial_file_overrides_only_what_it_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, br#"{"crashThreshold": 5, "scheduler": {"window": {"startHour": 1, "endHour": 4}, "catchUpDelaySecs": 10, "checkIntervalSecs": 600}}"#).unwrap();
        let settings = EngineSettings::load(&path).unwrap();
        assert_eq!(settings.crash_threshold, 5);
        assert_eq!(settings.scheduler.catch_up_delay_secs, 10);
        assert_eq!(settings.kdf, KdfParams::default());
        assert_eq!(settings.keyring_service, DEFAULT_SERVICE_NAME);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"{ nope").unwrap();
        assert!(matches!(
            EngineSettings::load(&path),
            Err(VaultError::Serialization(_))
        ));
    }
}
