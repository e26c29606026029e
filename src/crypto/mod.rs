//! Encryption Service
//!
//! Purpose-scoped key derivation, AEAD payload and field encryption, and
//! session tokens built on top of them.

mod cipher;
mod keys;
mod token;

pub use cipher::{
    EncryptedBlob, FieldCipher, Record, DECRYPTION_ERROR_MARKER, FIELD_PREFIX, FORMAT_VERSION,
    NONCE_SIZE, TAG_SIZE,
};
pub use keys::{
    fingerprint, parse_master_hex, EncryptionKeySet, KdfParams, KeyBytes, KeyManager, KeyRotation,
    Purpose, KEY_SIZE,
};
pub use token::{lifetime_minutes, SessionClaims, SessionTokenCodec};
