use crate::atomic::write_atomic;
use crate::crypto::{generate_salt, hash_password, verify_password, KdfParams};
use crate::error::{Result, VaultError};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

pub const DEFAULT_IDLE_TIMEOUT_MINUTES: u32 = 15;

/// Plaintext vault configuration. Holds only what is needed to check a
/// password; the database key is never derived from anything in here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterKeyRecord {
    pub salt: String,
    pub password_hash: String,
    pub idle_timeout_minutes: u32,
    pub lock_on_minimize: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub kdf: KdfParams,
}

impl MasterKeyRecord {
    pub fn new(password: &str, kdf: KdfParams) -> Result<Self> {
        let mut record = Self {
            salt: String::new(),
            password_hash: String::new(),
            idle_timeout_minutes: DEFAULT_IDLE_TIMEOUT_MINUTES,
            lock_on_minimize: false,
            created_at: Utc::now(),
            kdf,
        };
        record.set_password(password, kdf)?;
        Ok(record)
    }

    /// Fresh salt and hash; preferences and creation time are kept.
    pub fn set_password(&mut self, password: &str, kdf: KdfParams) -> Result<()> {
        let salt = generate_salt();
        let hash = hash_password(password, &salt, &kdf)?;
        self.salt = general_purpose::STANDARD.encode(salt);
        self.password_hash = hex::encode(&hash[..]);
        self.kdf = kdf;
        Ok(())
    }

    pub fn verify(&self, password: &str) -> Result<bool> {
        let salt = general_purpose::STANDARD
            .decode(&self.salt)
            .map_err(|e| VaultError::InvalidInput(format!("vault config salt: {e}")))?;
        let expected = hex::decode(&self.password_hash)
            .map_err(|e| VaultError::InvalidInput(format!("vault config hash: {e}")))?;
        verify_password(password, &salt, &self.kdf, &expected)
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)?;
        Ok(())
    }
}
