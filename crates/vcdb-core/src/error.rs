use thiserror::Error;

/// Stable error codes surfaced to the layers that sit on top of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidPassword,
    KeyNotFound,
    KeychainError,
    DecryptionFailed,
    UnsupportedVersion,
    MigrationFailed,
    BackupFailed,
    RestoreFailed,
    Locked,
    NotInitialized,
    AlreadyInitialized,
    SafeMode,
    InvalidInput,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidPassword => "INVALID_PASSWORD",
            ErrorKind::KeyNotFound => "KEY_NOT_FOUND",
            ErrorKind::KeychainError => "KEYCHAIN_ERROR",
            ErrorKind::DecryptionFailed => "DECRYPTION_FAILED",
            ErrorKind::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorKind::MigrationFailed => "MIGRATION_FAILED",
            ErrorKind::BackupFailed => "BACKUP_FAILED",
            ErrorKind::RestoreFailed => "RESTORE_FAILED",
            ErrorKind::Locked => "LOCKED",
            ErrorKind::NotInitialized => "NOT_INITIALIZED",
            ErrorKind::AlreadyInitialized => "ALREADY_INITIALIZED",
            ErrorKind::SafeMode => "SAFE_MODE",
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::Storage => "STORAGE_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid password")]
    InvalidPassword,

    #[error("encryption key not found in secure store")]
    KeyNotFound,

    #[error("secure store error: {0}")]
    Keychain(String),

    /// Deliberately does not say whether the key or the data was at fault.
    #[error("wrong password or corrupted data")]
    DecryptionFailed,

    #[error("unsupported database format version {0}")]
    UnsupportedVersion(u16),

    #[error("migration {name} failed: {reason}")]
    MigrationFailed { name: String, reason: String },

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("restore failed: {0}")]
    RestoreFailed(String),

    #[error("vault is locked")]
    Locked,

    #[error("vault has not been set up")]
    NotInitialized,

    #[error("vault is already set up")]
    AlreadyInitialized,

    #[error("vault database file is missing: {0}")]
    DatabaseMissing(String),

    #[error("operation not available in safe mode")]
    SafeMode,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::InvalidPassword => ErrorKind::InvalidPassword,
            VaultError::KeyNotFound => ErrorKind::KeyNotFound,
            VaultError::Keychain(_) => ErrorKind::KeychainError,
            VaultError::DecryptionFailed => ErrorKind::DecryptionFailed,
            VaultError::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            VaultError::MigrationFailed { .. } => ErrorKind::MigrationFailed,
            VaultError::BackupFailed(_) => ErrorKind::BackupFailed,
            VaultError::RestoreFailed(_) => ErrorKind::RestoreFailed,
            VaultError::Locked => ErrorKind::Locked,
            VaultError::NotInitialized => ErrorKind::NotInitialized,
            VaultError::AlreadyInitialized => ErrorKind::AlreadyInitialized,
            VaultError::SafeMode => ErrorKind::SafeMode,
            VaultError::InvalidInput(_) => ErrorKind::InvalidInput,
            VaultError::DatabaseMissing(_)
            | VaultError::Io(_)
            | VaultError::Database(_)
            | VaultError::Serialization(_) => ErrorKind::Storage,
        }
    }

    pub(crate) fn backup(err: impl std::fmt::Display) -> Self {
        VaultError::BackupFailed(err.to_string())
    }

    pub(crate) fn restore(err: impl std::fmt::Display) -> Self {
        VaultError::RestoreFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;
