//! Field Cipher
//!
//! AES-256-GCM with 128-bit random nonces and detached 128-bit tags. Every
//! result is a self-describing [`EncryptedBlob`]; the purpose label (and any
//! caller context such as a field name) is bound as associated data.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce, Tag};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use super::keys::{KeyManager, Purpose, KEY_SIZE};
use crate::error::{DrError, Result};

type Aes256Gcm128 = AesGcm<Aes256, U16>;

pub const NONCE_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;
pub const FORMAT_VERSION: u8 = 1;

/// Blob layout:
/// - Magic: 4 bytes "KSEB"
/// - Format version: 1 byte
/// - Key version: 4 bytes (LE)
/// - Nonce: 16 bytes
/// - Tag: 16 bytes
/// - Name length: 2 bytes (LE), then name bytes
/// - Ciphertext: remainder
const BLOB_MAGIC: &[u8] = b"KSEB";
const BLOB_HEADER_LEN: usize = 4 + 1 + 4 + NONCE_SIZE + TAG_SIZE + 2;

/// Prefix marking an encrypted record field.
pub const FIELD_PREFIX: &str = "enc:v1:";

/// Substituted for a field that fails to decrypt during bulk decryption.
pub const DECRYPTION_ERROR_MARKER: &str = "[DECRYPTION_ERROR]";

/// A structured record: field name to value.
pub type Record = BTreeMap<String, String>;

/// Ciphertext plus everything needed to decrypt it with the right purpose key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub format_version: u8,
    pub key_version: u32,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
    pub name: Option<String>,
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let name = self.name.as_deref().unwrap_or("").as_bytes();
        let mut out = Vec::with_capacity(BLOB_HEADER_LEN + name.len() + self.ciphertext.len());
        out.extend_from_slice(BLOB_MAGIC);
        out.push(self.format_version);
        out.extend_from_slice(&self.key_version.to_le_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < BLOB_HEADER_LEN {
            return Err(DrError::Decryption("blob shorter than header".into()));
        }
        if &data[..4] != BLOB_MAGIC {
            return Err(DrError::Decryption("invalid blob magic".into()));
        }
        let format_version = data[4];
        let key_version = u32::from_le_bytes([data[5], data[6], data[7], data[8]]);

        let mut offset = 9;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[offset..offset + NONCE_SIZE]);
        offset += NONCE_SIZE;
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&data[offset..offset + TAG_SIZE]);
        offset += TAG_SIZE;

        let name_len = u16::from_le_bytes([data[offset], data[offset + 1]]) as usize;
        offset += 2;
        if data.len() < offset + name_len {
            return Err(DrError::Decryption("blob name truncated".into()));
        }
        let name = if name_len == 0 {
            None
        } else {
            Some(
                String::from_utf8(data[offset..offset + name_len].to_vec())
                    .map_err(|_| DrError::Decryption("blob name is not UTF-8".into()))?,
            )
        };
        offset += name_len;

        Ok(Self {
            format_version,
            key_version,
            nonce,
            tag,
            name,
            ciphertext: data[offset..].to_vec(),
        })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| DrError::Decryption(format!("invalid base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

fn associated_data(purpose: Purpose, context: &[u8]) -> Vec<u8> {
    let label = purpose.label().as_bytes();
    let mut aad = Vec::with_capacity(label.len() + 1 + context.len());
    aad.extend_from_slice(label);
    aad.push(0);
    aad.extend_from_slice(context);
    aad
}

fn cipher_for(key: &[u8; KEY_SIZE]) -> Result<Aes256Gcm128> {
    Aes256Gcm128::new_from_slice(key).map_err(|e| DrError::Config(format!("invalid cipher key: {}", e)))
}

/// Authenticated encryption of payloads and record fields.
#[derive(Debug, Clone)]
pub struct FieldCipher {
    keys: Arc<KeyManager>,
}

impl FieldCipher {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn encrypt(&self, plaintext: &[u8], purpose: Purpose) -> Result<EncryptedBlob> {
        self.seal(plaintext, purpose, None, &[])
    }

    /// Encrypt and record `name` in the blob; the name is authenticated.
    pub fn encrypt_named(&self, plaintext: &[u8], purpose: Purpose, name: &str) -> Result<EncryptedBlob> {
        self.seal(plaintext, purpose, Some(name), name.as_bytes())
    }

    /// Encrypt with caller-supplied associated data that must be presented again to decrypt.
    pub fn seal_with_context(&self, plaintext: &[u8], purpose: Purpose, context: &[u8]) -> Result<EncryptedBlob> {
        self.seal(plaintext, purpose, None, context)
    }

    fn seal(&self, plaintext: &[u8], purpose: Purpose, name: Option<&str>, context: &[u8]) -> Result<EncryptedBlob> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let aad = associated_data(purpose, context);

        let (key_version, sealed) = self.keys.with_key(purpose, |version, key| {
            let cipher = cipher_for(key)?;
            let mut buffer = plaintext.to_vec();
            let tag = cipher
                .encrypt_in_place_detached(Nonce::<U16>::from_slice(&nonce), &aad, &mut buffer)
                .map_err(|_| DrError::Config("encryption failed".into()))?;
            Ok::<_, DrError>((version, (buffer, tag)))
        })??;
        let (ciphertext, tag) = sealed;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(tag.as_slice());

        Ok(EncryptedBlob {
            format_version: FORMAT_VERSION,
            key_version,
            nonce,
            tag: tag_bytes,
            name: name.map(str::to_string),
            ciphertext,
        })
    }

    /// Decrypt a blob; the tag is verified before any plaintext is returned.
    pub fn decrypt(&self, blob: &EncryptedBlob, purpose: Purpose) -> Result<Vec<u8>> {
        let context = blob.name.as_deref().unwrap_or("").as_bytes().to_vec();
        self.open(blob, purpose, &context)
    }

    pub fn open_with_context(&self, blob: &EncryptedBlob, purpose: Purpose, context: &[u8]) -> Result<Vec<u8>> {
        self.open(blob, purpose, context)
    }

    fn open(&self, blob: &EncryptedBlob, purpose: Purpose, context: &[u8]) -> Result<Vec<u8>> {
        if blob.format_version != FORMAT_VERSION {
            return Err(DrError::Decryption(format!(
                "unsupported blob format version {}",
                blob.format_version
            )));
        }
        let aad = associated_data(purpose, context);

        self.keys.with_key_version(blob.key_version, purpose, |key| {
            let cipher = cipher_for(key)?;
            let mut buffer = blob.ciphertext.clone();
            cipher
                .decrypt_in_place_detached(
                    Nonce::<U16>::from_slice(&blob.nonce),
                    &aad,
                    &mut buffer,
                    Tag::<U16>::from_slice(&blob.tag),
                )
                .map_err(|_| DrError::Decryption("authentication tag mismatch".into()))?;
            Ok(buffer)
        })?
    }

    /// Encrypt a file to `dst` in blob form, recording the original file name.
    pub fn encrypt_file(&self, src: &Path, dst: &Path, purpose: Purpose) -> Result<()> {
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let plaintext = fs::read(src)?;
        let blob = self.encrypt_named(&plaintext, purpose, &name)?;
        fs::write(dst, blob.to_bytes())?;
        Ok(())
    }

    /// Decrypt a blob file to `dst`. Any failure is returned; nothing degrades.
    pub fn decrypt_file(&self, src: &Path, dst: &Path, purpose: Purpose) -> Result<()> {
        let data = fs::read(src)?;
        let blob = EncryptedBlob::from_bytes(&data)?;
        let plaintext = self.decrypt(&blob, purpose)?;
        fs::write(dst, plaintext)?;
        Ok(())
    }

    /// Encrypt the purpose's default field set.
    pub fn encrypt_fields(&self, record: &Record, purpose: Purpose) -> Result<Record> {
        self.encrypt_field_set(record, purpose, purpose.default_fields())
    }

    pub fn encrypt_field_set(&self, record: &Record, purpose: Purpose, fields: &[&str]) -> Result<Record> {
        let mut out = record.clone();
        for field in fields {
            if let Some(value) = record.get(*field) {
                if value.starts_with(FIELD_PREFIX) {
                    continue;
                }
                let blob = self.encrypt_named(value.as_bytes(), purpose, field)?;
                out.insert(field.to_string(), format!("{}{}", FIELD_PREFIX, blob.to_base64()));
            }
        }
        Ok(out)
    }

    /// Bulk decrypt: a field that fails is replaced by [`DECRYPTION_ERROR_MARKER`].
    pub fn decrypt_fields(&self, record: &Record, purpose: Purpose) -> Record {
        record
            .iter()
            .map(|(field, value)| {
                let plain = match self.decrypt_field(field, value, purpose) {
                    Ok(plain) => plain,
                    Err(e) => {
                        warn!(field = %field, purpose = %purpose, "Field decryption failed: {}", e);
                        DECRYPTION_ERROR_MARKER.to_string()
                    }
                };
                (field.clone(), plain)
            })
            .collect()
    }

    /// All-or-nothing decrypt for paths where a corrupt field is fatal.
    pub fn decrypt_fields_strict(&self, record: &Record, purpose: Purpose) -> Result<Record> {
        record
            .iter()
            .map(|(field, value)| Ok((field.clone(), self.decrypt_field(field, value, purpose)?)))
            .collect()
    }

    fn decrypt_field(&self, field: &str, value: &str, purpose: Purpose) -> Result<String> {
        let Some(encoded) = value.strip_prefix(FIELD_PREFIX) else {
            return Ok(value.to_string());
        };
        let blob = EncryptedBlob::from_base64(encoded)?;
        if blob.name.as_deref() != Some(field) {
            return Err(DrError::Decryption(format!("blob belongs to another field than {}", field)));
        }
        let plaintext = self.decrypt(&blob, purpose)?;
        String::from_utf8(plaintext).map_err(|_| DrError::Decryption("field is not UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::KdfParams;
    use zeroize::Zeroizing;

    fn cipher() -> FieldCipher {
        let keys = KeyManager::new(Zeroizing::new([42u8; KEY_SIZE]), KdfParams::fast()).unwrap();
        FieldCipher::new(Arc::new(keys))
    }

    #[test]
    fn test_encrypt_decrypt() {
        let c = cipher();
        let blob = c.encrypt(b"payload", Purpose::Backup).unwrap();
        assert_eq!(blob.format_version, FORMAT_VERSION);
        assert_ne!(blob.ciphertext, b"payload");
        assert_eq!(c.decrypt(&blob, Purpose::Backup).unwrap(), b"payload");
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let c = cipher();
        let a = c.encrypt(b"same", Purpose::Pii).unwrap();
        let b = c.encrypt(b"same", Purpose::Pii).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_flipped_nonce_or_tag_bits_fail() {
        let c = cipher();
        let blob = c.encrypt(b"sensitive", Purpose::Financial).unwrap();

        for bit in 0..(NONCE_SIZE * 8) {
            let mut bad = blob.clone();
            bad.nonce[bit / 8] ^= 1 << (bit % 8);
            assert!(matches!(c.decrypt(&bad, Purpose::Financial), Err(DrError::Decryption(_))));
        }
        for bit in 0..(TAG_SIZE * 8) {
            let mut bad = blob.clone();
            bad.tag[bit / 8] ^= 1 << (bit % 8);
            assert!(matches!(c.decrypt(&bad, Purpose::Financial), Err(DrError::Decryption(_))));
        }
    }

    #[test]
    fn test_wrong_purpose_fails() {
        let c = cipher();
        let blob = c.encrypt(b"x", Purpose::Pii).unwrap();
        assert!(c.decrypt(&blob, Purpose::Medical).is_err());
    }

    #[test]
    fn test_blob_bytes_are_self_describing() {
        let c = cipher();
        let blob = c.encrypt_named(b"file body", Purpose::Backup, "database.dump").unwrap();
        let parsed = EncryptedBlob::from_bytes(&blob.to_bytes()).unwrap();
        assert_eq!(parsed, blob);
        assert_eq!(parsed.name.as_deref(), Some("database.dump"));
        assert_eq!(c.decrypt(&parsed, Purpose::Backup).unwrap(), b"file body");
    }

    #[test]
    fn test_truncated_blob_rejected() {
        assert!(EncryptedBlob::from_bytes(b"KSEB").is_err());
        assert!(EncryptedBlob::from_bytes(&[0u8; BLOB_HEADER_LEN]).is_err());
    }

    #[test]
    fn test_field_degrades_on_tampered_tag() {
        let c = cipher();
        let mut record = Record::new();
        record.insert("national_id".into(), "123-45-6789".into());
        record.insert("phone".into(), "555-0100".into());
        record.insert("name".into(), "Jane".into());

        let encrypted = c.encrypt_fields(&record, Purpose::Pii).unwrap();
        assert!(encrypted["national_id"].starts_with(FIELD_PREFIX));
        assert_eq!(encrypted["name"], "Jane");
        assert_eq!(c.decrypt_fields(&encrypted, Purpose::Pii), record);

        let encoded = encrypted["national_id"].strip_prefix(FIELD_PREFIX).unwrap();
        let mut blob = EncryptedBlob::from_base64(encoded).unwrap();
        blob.tag[0] ^= 0x01;
        let mut tampered = encrypted.clone();
        tampered.insert("national_id".into(), format!("{}{}", FIELD_PREFIX, blob.to_base64()));

        let decrypted = c.decrypt_fields(&tampered, Purpose::Pii);
        assert_eq!(decrypted["national_id"], DECRYPTION_ERROR_MARKER);
        assert_eq!(decrypted["phone"], "555-0100");
        assert_eq!(decrypted["name"], "Jane");

        assert!(matches!(
            c.decrypt_fields_strict(&tampered, Purpose::Pii),
            Err(DrError::Decryption(_))
        ));
    }

    #[test]
    fn test_swapped_fields_rejected() {
        let c = cipher();
        let mut record = Record::new();
        record.insert("national_id".into(), "123-45-6789".into());
        record.insert("phone".into(), "555-0100".into());
        let mut encrypted = c.encrypt_fields(&record, Purpose::Pii).unwrap();
        let phone = encrypted["phone"].clone();
        encrypted.insert("national_id".into(), phone);

        let decrypted = c.decrypt_fields(&encrypted, Purpose::Pii);
        assert_eq!(decrypted["national_id"], DECRYPTION_ERROR_MARKER);
    }

    #[test]
    fn test_archived_key_still_decrypts() {
        let c = cipher();
        let blob = c.encrypt(b"old", Purpose::Backup).unwrap();
        c.keys().rotate().unwrap();
        assert_eq!(c.decrypt(&blob, Purpose::Backup).unwrap(), b"old");
        assert_eq!(c.encrypt(b"new", Purpose::Backup).unwrap().key_version, 2);
    }
}
