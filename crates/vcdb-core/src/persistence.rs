//! Owner of the live database for an unlocked session.
//!
//! The relational engine runs entirely in memory. The only on-disk form of
//! the database is the encrypted blob at `db_path`, rewritten through a
//! staged temp file and rename after every committed write.
//!
//! Every operation that touches the session or the primary file (save,
//! rekey, export, restore, unload) holds the same mutex, so they never
//! interleave and a lock request waits for an in-flight write to finish.

use crate::atomic::{self, write_atomic};
use crate::codec;
use crate::crypto::EncryptionKey;
use crate::error::{Result, VaultError};
use crate::migrations::SchemaMigrator;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::serialize::OwnedData;
use rusqlite::{ffi, Connection, DatabaseName, Transaction};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::{debug, info, warn};

struct Session {
    conn: Connection,
    key: EncryptionKey,
    opened_at: DateTime<Utc>,
}

/// Encrypted export of the live image plus whatever the caller read from the
/// same snapshot.
#[derive(Debug)]
pub struct Export<T> {
    pub blob: Vec<u8>,
    pub key_fingerprint: String,
    pub extra: T,
}

pub struct PersistenceCoordinator {
    db_path: PathBuf,
    migrator: SchemaMigrator,
    session: Mutex<Option<Session>>,
}

impl PersistenceCoordinator {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self::with_migrator(db_path, SchemaMigrator::standard())
    }

    pub fn with_migrator(db_path: impl AsRef<Path>, migrator: SchemaMigrator) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            migrator,
            session: Mutex::new(None),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_loaded(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.session.lock().as_ref().map(|s| s.opened_at)
    }

    pub fn key_fingerprint(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.key.fingerprint())
    }

    /// Start a brand-new database under `key` and write it out.
    pub fn create(&self, key: &EncryptionKey) -> Result<()> {
        let mut guard = self.session.lock();
        if self.db_path.exists() {
            return Err(VaultError::AlreadyInitialized);
        }
        let mut conn = open_image(&[])?;
        self.migrator.run(&mut conn)?;
        let session = Session {
            conn,
            key: key.clone(),
            opened_at: Utc::now(),
        };
        self.persist(&session)?;
        *guard = Some(session);
        info!(path = %self.db_path.display(), "created database");
        Ok(())
    }

    /// Decrypt the primary file into a live session and bring its schema up
    /// to date. A wrong key and a damaged file both yield `DecryptionFailed`.
    pub fn load(&self, key: &EncryptionKey) -> Result<()> {
        let mut guard = self.session.lock();
        atomic::cleanup_orphans(&self.db_path);
        let mut conn = self.read_primary(key)?;
        let applied = self.migrator.run(&mut conn)?;
        let session = Session {
            conn,
            key: key.clone(),
            opened_at: Utc::now(),
        };
        if !applied.is_empty() {
            self.persist(&session)?;
        }
        *guard = Some(session);
        info!(migrations = applied.len(), "database loaded");
        Ok(())
    }

    /// Drop the session. The key and the engine handle go with it. Waits for
    /// any save, rekey or export in progress.
    pub fn unload(&self) -> bool {
        let had_session = self.session.lock().take().is_some();
        if had_session {
            info!("database session closed");
        }
        had_session
    }

    /// Run a read-only closure against the live database.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self.session.lock();
        let session = guard.as_ref().ok_or(VaultError::Locked)?;
        session.conn.execute_batch("PRAGMA query_only = ON;")?;
        let result = f(&session.conn);
        session.conn.execute_batch("PRAGMA query_only = OFF;")?;
        Ok(result?)
    }

    /// Run `f` in a transaction, commit, then save the image. If the save
    /// fails the in-memory database is reloaded from the primary file so it
    /// does not run ahead of what is on disk.
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or(VaultError::Locked)?;
        let value = {
            let tx = session.conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            value
        };
        if let Err(err) = self.persist(session) {
            warn!(error = %err, "write-through save failed; reloading last saved image");
            match self.read_primary(&session.key) {
                Ok(conn) => session.conn = conn,
                Err(reload_err) => warn!(error = %reload_err, "reloading saved image failed"),
            }
            return Err(err);
        }
        Ok(value)
    }

    pub fn execute<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<usize> {
        self.write(|tx| tx.execute(sql, params))
    }

    pub fn save(&self) -> Result<()> {
        let guard = self.session.lock();
        let session = guard.as_ref().ok_or(VaultError::Locked)?;
        self.persist(session)
    }

    /// Re-encrypt the primary file under `new_key`. The session switches to
    /// the new key only after the renamed file is on disk.
    pub fn rekey(&self, new_key: &EncryptionKey) -> Result<()> {
        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or(VaultError::Locked)?;
        let blob = encode_conn(&session.conn, new_key)?;
        write_atomic(&self.db_path, &blob)?;
        session.key = new_key.clone();
        info!(fingerprint = %new_key.fingerprint(), "database rekeyed");
        Ok(())
    }

    /// Fresh encryption of the live image; the primary file is not touched.
    pub fn export_encrypted(&self) -> Result<Vec<u8>> {
        Ok(self.export_with(|_| Ok(()))?.blob)
    }

    pub fn export_with<T, F>(&self, f: F) -> Result<Export<T>>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self.session.lock();
        let session = guard.as_ref().ok_or(VaultError::Locked)?;
        let extra = f(&session.conn)?;
        let blob = encode_conn(&session.conn, &session.key)?;
        Ok(Export {
            blob,
            key_fingerprint: session.key.fingerprint(),
            extra,
        })
    }

    /// Install `blob` as the primary file. With a live session the blob must
    /// decrypt under the session key and replaces the live image as well.
    pub fn replace_primary(&self, blob: &[u8]) -> Result<()> {
        codec::inspect(blob).map_err(VaultError::restore)?;
        let mut guard = self.session.lock();
        match guard.as_mut() {
            Some(session) => {
                let plaintext = codec::decode(blob, &session.key).map_err(|_| {
                    VaultError::RestoreFailed(
                        "backup is not encrypted with the current vault key".into(),
                    )
                })?;
                let mut conn = open_image(&plaintext)?;
                self.migrator.run(&mut conn)?;
                let fresh = encode_conn(&conn, &session.key)?;
                write_atomic(&self.db_path, &fresh)?;
                session.conn = conn;
            }
            None => write_atomic(&self.db_path, blob)?,
        }
        info!(path = %self.db_path.display(), "primary database replaced");
        Ok(())
    }

    /// Close the session and delete the primary file.
    pub fn discard_primary(&self) -> Result<bool> {
        let mut guard = self.session.lock();
        guard.take();
        match fs::remove_file(&self.db_path) {
            Ok(()) => {
                warn!(path = %self.db_path.display(), "primary database removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, session: &Session) -> Result<()> {
        let blob = encode_conn(&session.conn, &session.key)?;
        write_atomic(&self.db_path, &blob)?;
        debug!(bytes = blob.len(), "saved database image");
        Ok(())
    }

    fn read_primary(&self, key: &EncryptionKey) -> Result<Connection> {
        let blob = match fs::read(&self.db_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(VaultError::DatabaseMissing(self.db_path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let plaintext = codec::decode(&blob, key)?;
        open_image(&plaintext)
    }
}

fn encode_conn(conn: &Connection, key: &EncryptionKey) -> Result<Vec<u8>> {
    let image = conn.serialize(DatabaseName::Main)?;
    codec::encode(&image, key)
}

fn open_image(plaintext: &[u8]) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    if !plaintext.is_empty() {
        conn.deserialize(DatabaseName::Main, owned_image(plaintext)?, false)?;
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })?;
    }
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

fn owned_image(bytes: &[u8]) -> Result<OwnedData> {
    // SAFETY: the buffer is allocated by sqlite3_malloc64 with exactly
    // `bytes.len()` bytes and fully initialized before ownership passes to
    // OwnedData, which frees it through SQLite.
    unsafe {
        let raw = ffi::sqlite3_malloc64(bytes.len() as u64) as *mut u8;
        let ptr = NonNull::new(raw).ok_or_else(|| {
            VaultError::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "cannot allocate database image",
            ))
        })?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        Ok(OwnedData::from_raw_nonnull(ptr, bytes.len()))
    }
}
