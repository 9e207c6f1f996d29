//! Encrypted container for the database image.
//!
//! Current layout (all offsets in bytes):
//!
//! ```text
//! [ magic "VCDB" (4) | version u16 BE (2) | nonce (12) | tag (16) | ciphertext ]
//! ```
//!
//! Files written before the header existed start directly at the nonce:
//!
//! ```text
//! [ nonce (12) | tag (16) | ciphertext ]
//! ```
//!
//! AEAD is AES-256-GCM with a fresh random nonce per encode.

use crate::crypto::EncryptionKey;
use crate::error::{Result, VaultError};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

pub const BLOB_MAGIC: &[u8; 4] = b"VCDB";
pub const CURRENT_FORMAT_VERSION: u16 = 1;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const ALGORITHM: &str = "AES-256-GCM";

const VERSION_LEN: usize = 2;
const PREFIX_LEN: usize = BLOB_MAGIC.len() + VERSION_LEN;

/// Container revision, resolved once from the leading bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobFormat {
    /// Pre-versioning files without magic or version.
    Legacy,
    V1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlobLayout {
    nonce_at: usize,
    tag_at: usize,
    body_at: usize,
}

impl BlobLayout {
    const fn starting_at(offset: usize) -> Self {
        Self {
            nonce_at: offset,
            tag_at: offset + NONCE_LEN,
            body_at: offset + NONCE_LEN + TAG_LEN,
        }
    }
}

impl BlobFormat {
    pub fn detect(blob: &[u8]) -> Result<Self> {
        if blob.len() < BLOB_MAGIC.len() || &blob[..BLOB_MAGIC.len()] != BLOB_MAGIC {
            return Ok(BlobFormat::Legacy);
        }
        if blob.len() < PREFIX_LEN {
            return Err(VaultError::DecryptionFailed);
        }
        let version = u16::from_be_bytes([blob[4], blob[5]]);
        Self::from_version(version)
    }

    pub fn from_version(version: u16) -> Result<Self> {
        match version {
            1 => Ok(BlobFormat::V1),
            other => Err(VaultError::UnsupportedVersion(other)),
        }
    }

    /// Version number as written in the header; 0 for legacy files.
    pub fn version(self) -> u16 {
        match self {
            BlobFormat::Legacy => 0,
            BlobFormat::V1 => 1,
        }
    }

    fn layout(self) -> BlobLayout {
        match self {
            BlobFormat::Legacy => BlobLayout::starting_at(0),
            BlobFormat::V1 => BlobLayout::starting_at(PREFIX_LEN),
        }
    }

    pub fn header_len(self) -> usize {
        self.layout().body_at
    }
}

/// What can be learned about a blob without the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobInfo {
    pub format: BlobFormat,
    pub header_len: usize,
    pub ciphertext_len: usize,
}

pub fn inspect(blob: &[u8]) -> Result<BlobInfo> {
    let format = BlobFormat::detect(blob)?;
    let header_len = format.header_len();
    if blob.len() < header_len {
        return Err(VaultError::DecryptionFailed);
    }
    Ok(BlobInfo {
        format,
        header_len,
        ciphertext_len: blob.len() - header_len,
    })
}

pub fn encode(plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let layout = BlobFormat::V1.layout();
    let mut out = Vec::with_capacity(layout.body_at + plaintext.len());
    out.extend_from_slice(BLOB_MAGIC);
    out.extend_from_slice(&CURRENT_FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&[0u8; TAG_LEN]);
    out.extend_from_slice(plaintext);

    let tag = cipher
        .encrypt_in_place_detached(
            GenericArray::from_slice(&nonce),
            b"",
            &mut out[layout.body_at..],
        )
        .map_err(|_| VaultError::InvalidInput("plaintext too large to encrypt".into()))?;
    out[layout.tag_at..layout.body_at].copy_from_slice(&tag);
    Ok(out)
}

pub fn decode(blob: &[u8], key: &EncryptionKey) -> Result<Zeroizing<Vec<u8>>> {
    let format = BlobFormat::detect(blob)?;
    let layout = format.layout();
    if blob.len() < layout.body_at {
        return Err(VaultError::DecryptionFailed);
    }
    let nonce = &blob[layout.nonce_at..layout.tag_at];
    let tag = &blob[layout.tag_at..layout.body_at];

    let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
    let mut buffer = Zeroizing::new(blob[layout.body_at..].to_vec());
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            b"",
            &mut buffer[..],
            GenericArray::from_slice(tag),
        )
        .map_err(|_| VaultError::DecryptionFailed)?;
    Ok(buffer)
}

/// Build a pre-versioning blob. Kept for compatibility tests and fixtures.
pub fn encode_legacy(plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>> {
    let mut blob = encode(plaintext, key)?;
    blob.drain(..PREFIX_LEN);
    Ok(blob)
}
