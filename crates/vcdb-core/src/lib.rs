//! Encrypted local vault storage engine.
//!
//! A single SQLite database lives in memory while the vault is unlocked and
//! on disk only as an AES-256-GCM blob. The database key is random, held in
//! the OS secret store, and released by the master password.

pub mod atomic;
pub mod backup;
pub mod codec;
pub mod crypto;
pub mod error;
pub mod idle;
pub mod key_vault;
pub mod master_record;
pub mod migrations;
pub mod paths;
pub mod persistence;
pub mod recovery;
pub mod schedule;
pub mod secure_store;
pub mod service;
pub mod settings;

pub use backup::{BackupFrequency, BackupInfo, BackupManager, BackupManifest, BackupSettings};
pub use crypto::{EncryptionKey, KdfParams};
pub use error::{ErrorKind, Result, VaultError};
pub use key_vault::KeyVault;
pub use master_record::MasterKeyRecord;
pub use migrations::{Migration, SchemaMigrator};
pub use paths::VaultPaths;
pub use persistence::PersistenceCoordinator;
pub use recovery::{RecoveryController, RecoveryState, SafeModeReason};
pub use secure_store::{KeyringStore, MemoryKeyStore, SecureKeyStore};
pub use service::{VaultService, VaultStatus};
pub use settings::EngineSettings;
