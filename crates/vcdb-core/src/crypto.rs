use crate::error::{Result, VaultError};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 32;
pub const PASSWORD_HASH_LEN: usize = 32;
pub const MIN_PASSWORD_LEN: usize = 8;

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64MB
pub const KDF_PARALLELISM: u32 = 4;

/// The 256-bit data-encryption key. Random, never derived from the password.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            VaultError::InvalidInput(format!(
                "encryption key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Short public identifier for the key; safe to store next to ciphertext.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

impl PartialEq for EncryptionKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for EncryptionKey {}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey({})", self.fingerprint())
    }
}

/// Argon2id cost parameters for the password verification hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: KDF_MEMORY_COST,
            iterations: KDF_TIME_COST,
            parallelism: KDF_PARALLELISM,
        }
    }
}

impl KdfParams {
    /// Minimal cost. Only for tests and throwaway vaults.
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }
}

pub fn hash_password(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
) -> Result<Zeroizing<[u8; PASSWORD_HASH_LEN]>> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(PASSWORD_HASH_LEN),
    )
    .map_err(|e| VaultError::InvalidInput(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = Zeroizing::new([0u8; PASSWORD_HASH_LEN]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut out[..])
        .map_err(|e| VaultError::InvalidInput(format!("argon2 hash: {e}")))?;
    Ok(out)
}

pub fn verify_password(
    password: &str,
    salt: &[u8],
    params: &KdfParams,
    expected: &[u8],
) -> Result<bool> {
    let actual = hash_password(password, salt, params)?;
    Ok(constant_time_eq(&actual[..], expected))
}

pub fn check_password_strength(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(VaultError::InvalidInput(format!(
            "password too short; minimum {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        let a = EncryptionKey::generate();
        let b = EncryptionKey::generate();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn debug_does_not_leak_key_bytes() {
        let key = EncryptionKey::from_slice(&[0xAB; KEY_LEN]).unwrap();
        let rendered = format!("{key:?}");
        assert!(!rendered.contains(&hex::encode([0xABu8; KEY_LEN])));
        assert!(rendered.contains(&key.fingerprint()));
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(EncryptionKey::from_slice(&[1u8; 16]).is_err());
    }

    #[test]
    fn password_hash_verifies_only_the_right_password() {
        let params = KdfParams::insecure_fast();
        let salt = generate_salt();
        let hash = hash_password("Str0ngP@ss", &salt, &params).unwrap();
        assert!(verify_password("Str0ngP@ss", &salt, &params, &hash[..]).unwrap());
        assert!(!verify_password("str0ngP@ss", &salt, &params, &hash[..]).unwrap());
    }

    #[test]
    fn same_password_different_salt_gives_different_hash() {
        let params = KdfParams::insecure_fast();
        let a = hash_password("pw-pw-pw-pw", &generate_salt(), &params).unwrap();
        let b = hash_password("pw-pw-pw-pw", &generate_salt(), &params).unwrap();
        assert_ne!(&a[..], &b[..]);
    }

    #[test]
    fn short_passwords_are_rejected() {
        assert!(check_password_strength("short").is_err());
        assert!(check_password_strength("long enough").is_ok());
    }
}
