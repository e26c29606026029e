//! Key Manager
//!
//! Derives purpose-scoped subkeys from a single master secret with Argon2id.
//! Subkeys live only in memory and are zeroized when their key set drops.

use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

use crate::error::{DrError, Result};

/// AES-256 key length in bytes.
pub const KEY_SIZE: usize = 32;

/// Raw key bytes that are wiped on drop.
pub type KeyBytes = Zeroizing<[u8; KEY_SIZE]>;

/// Purpose label a subkey is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Pii,
    Medical,
    Financial,
    Session,
    Backup,
}

impl Purpose {
    pub const ALL: [Purpose; 5] = [
        Purpose::Pii,
        Purpose::Medical,
        Purpose::Financial,
        Purpose::Session,
        Purpose::Backup,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Purpose::Pii => "pii",
            Purpose::Medical => "medical",
            Purpose::Financial => "financial",
            Purpose::Session => "session",
            Purpose::Backup => "backup",
        }
    }

    /// Record fields protected under this purpose by default.
    pub fn default_fields(&self) -> &'static [&'static str] {
        match self {
            Purpose::Pii => &["national_id", "phone", "address", "email", "date_of_birth"],
            Purpose::Medical => &["diagnosis", "treatment", "medications", "allergies"],
            Purpose::Financial => &["account_number", "card_number", "routing_number"],
            Purpose::Session | Purpose::Backup => &[],
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Purpose {
    type Err = DrError;

    fn from_str(s: &str) -> Result<Self> {
        Purpose::ALL
            .iter()
            .copied()
            .find(|p| p.label() == s.to_ascii_lowercase())
            .ok_or_else(|| DrError::Config(format!("unknown key purpose: {}", s)))
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and drills.
    pub fn fast() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Auditable view of a key set: fingerprints only, never raw material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKeySet {
    pub version: u32,
    pub master_fingerprint: String,
    pub purpose_fingerprints: BTreeMap<String, String>,
    pub rotated_at: DateTime<Utc>,
}

/// Outcome of a rotation.
pub struct KeyRotation {
    pub previous: EncryptionKeySet,
    pub current: EncryptionKeySet,
    /// The freshly generated master secret; the operator must store it.
    pub new_master: KeyBytes,
}

impl fmt::Debug for KeyRotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRotation")
            .field("previous", &self.previous)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

struct KeySet {
    version: u32,
    master: KeyBytes,
    subkeys: HashMap<Purpose, KeyBytes>,
    rotated_at: DateTime<Utc>,
}

impl KeySet {
    fn derive(version: u32, master: KeyBytes, params: &KdfParams) -> Result<Self> {
        let mut subkeys = HashMap::with_capacity(Purpose::ALL.len());
        for purpose in Purpose::ALL {
            subkeys.insert(purpose, derive_subkey(&master, purpose, params)?);
        }
        Ok(Self {
            version,
            master,
            subkeys,
            rotated_at: Utc::now(),
        })
    }

    fn describe(&self) -> EncryptionKeySet {
        let purpose_fingerprints = self
            .subkeys
            .iter()
            .map(|(p, k)| (p.label().to_string(), fingerprint(&k[..])))
            .collect();
        EncryptionKeySet {
            version: self.version,
            master_fingerprint: fingerprint(&self.master[..]),
            purpose_fingerprints,
            rotated_at: self.rotated_at,
        }
    }

    fn subkey(&self, purpose: Purpose) -> Result<&KeyBytes> {
        self.subkeys
            .get(&purpose)
            .ok_or_else(|| DrError::Config(format!("no subkey for purpose {}", purpose)))
    }
}

fn derive_subkey(master: &KeyBytes, purpose: Purpose, params: &KdfParams) -> Result<KeyBytes> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| DrError::Config(format!("invalid KDF parameters: {}", e)))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let salt = format!("keepsafe/{}", purpose.label());
    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    argon
        .hash_password_into(&master[..], salt.as_bytes(), &mut out[..])
        .map_err(|e| DrError::Config(format!("key derivation failed: {}", e)))?;
    Ok(out)
}

/// Short SHA-256 fingerprint of key material.
pub fn fingerprint(key: &[u8]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..8])
}

/// Holds the current key set plus archived sets kept for decrypting older blobs.
pub struct KeyManager {
    params: KdfParams,
    current: RwLock<Arc<KeySet>>,
    archived: RwLock<BTreeMap<u32, Arc<KeySet>>>,
}

impl KeyManager {
    /// Derive key set version 1 from `master`.
    pub fn new(master: KeyBytes, params: KdfParams) -> Result<Self> {
        Self::with_version(master, 1, params)
    }

    pub fn with_version(master: KeyBytes, version: u32, params: KdfParams) -> Result<Self> {
        let set = KeySet::derive(version, master, &params)?;
        Ok(Self {
            params,
            current: RwLock::new(Arc::new(set)),
            archived: RwLock::new(BTreeMap::new()),
        })
    }

    /// Parse a 64-character hex master secret.
    pub fn from_hex(hex_key: &str, params: KdfParams) -> Result<Self> {
        Self::new(parse_master_hex(hex_key)?, params)
    }

    /// Fresh random master secret.
    pub fn generate(params: KdfParams) -> Result<Self> {
        Self::new(random_master(), params)
    }

    /// Retain an older master so blobs sealed under `version` stay readable.
    pub fn archive(&self, version: u32, master: KeyBytes) -> Result<()> {
        if version == self.version() {
            return Err(DrError::InvalidState(format!(
                "key version {} is the current version",
                version
            )));
        }
        let set = KeySet::derive(version, master, &self.params)?;
        self.archived.write().insert(version, Arc::new(set));
        Ok(())
    }

    /// Archive a `version:hex` pair as printed after a rotation.
    pub fn archive_hex(&self, entry: &str) -> Result<()> {
        let (version, hex_key) = entry
            .split_once(':')
            .ok_or_else(|| DrError::Config("archived key must be VERSION:HEX".into()))?;
        let version = version
            .trim()
            .parse()
            .map_err(|_| DrError::Config(format!("invalid archived key version: {}", version)))?;
        self.archive(version, parse_master_hex(hex_key)?)
    }

    pub fn version(&self) -> u32 {
        self.current.read().version
    }

    /// Run `f` with the current subkey for `purpose`.
    pub fn with_key<R>(&self, purpose: Purpose, f: impl FnOnce(u32, &[u8; KEY_SIZE]) -> R) -> Result<R> {
        let set = self.current.read().clone();
        let key = set.subkey(purpose)?;
        Ok(f(set.version, key))
    }

    /// Run `f` with the subkey for `purpose` from key set `version`.
    pub fn with_key_version<R>(
        &self,
        version: u32,
        purpose: Purpose,
        f: impl FnOnce(&[u8; KEY_SIZE]) -> R,
    ) -> Result<R> {
        let set = {
            let current = self.current.read();
            if current.version == version {
                current.clone()
            } else {
                self.archived
                    .read()
                    .get(&version)
                    .cloned()
                    .ok_or_else(|| DrError::Decryption(format!("unknown key version {}", version)))?
            }
        };
        let key = set.subkey(purpose)?;
        Ok(f(key))
    }

    pub fn fingerprints(&self) -> EncryptionKeySet {
        self.current.read().describe()
    }

    /// Archived versions still held in memory.
    pub fn archived_versions(&self) -> Vec<u32> {
        self.archived.read().keys().copied().collect()
    }

    /// Replace the master secret and rederive every subkey.
    ///
    /// Existing blobs are not re-encrypted; the previous set is archived.
    pub fn rotate(&self) -> Result<KeyRotation> {
        let new_master = random_master();
        let mut current = self.current.write();
        let next = KeySet::derive(current.version + 1, new_master.clone(), &self.params)?;

        let previous = current.describe();
        let old = std::mem::replace(&mut *current, Arc::new(next));
        self.archived.write().insert(old.version, old);
        let described = current.describe();

        info!(
            old_version = previous.version,
            new_version = described.version,
            old_master = %previous.master_fingerprint,
            new_master = %described.master_fingerprint,
            "Rotated encryption keys"
        );

        Ok(KeyRotation {
            previous,
            current: described,
            new_master,
        })
    }
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("version", &self.version())
            .field("archived", &self.archived_versions())
            .finish()
    }
}

pub fn parse_master_hex(hex_key: &str) -> Result<KeyBytes> {
    let bytes = Zeroizing::new(
        hex::decode(hex_key.trim())
            .map_err(|e| DrError::Config(format!("invalid hex master key: {}", e)))?,
    );
    if bytes.len() != KEY_SIZE {
        return Err(DrError::Config(format!(
            "master key must be {} bytes ({} hex chars), got {} bytes",
            KEY_SIZE,
            KEY_SIZE * 2,
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn random_master() -> KeyBytes {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut key[..]);
    key
}
