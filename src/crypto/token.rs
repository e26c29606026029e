//! Session Tokens
//!
//! Opaque, time-bounded tokens sealed under the session key. The expiry is
//! carried in a cleartext header that is authenticated as associated data,
//! so an expired token is rejected before any decryption is attempted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cipher::{EncryptedBlob, FieldCipher, FORMAT_VERSION, NONCE_SIZE, TAG_SIZE};
use super::keys::Purpose;
use crate::error::{DrError, Result};

/// Header: format version (1) + expiry unix seconds (8) + key version (4).
const HEADER_LEN: usize = 1 + 8 + 4;

/// Decrypted token contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub subject: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub nonce: String,
}

impl SessionClaims {
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }
}

/// Token lifetime from a minute count, rejecting values chrono cannot hold.
pub fn lifetime_minutes(minutes: i64) -> Result<Duration> {
    Duration::try_minutes(minutes)
        .ok_or_else(|| DrError::Config(format!("token lifetime of {} minutes is out of range", minutes)))
}

/// Issues and verifies session tokens.
#[derive(Debug, Clone)]
pub struct SessionTokenCodec {
    cipher: FieldCipher,
}

impl SessionTokenCodec {
    pub fn new(cipher: FieldCipher) -> Self {
        Self { cipher }
    }

    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String> {
        self.issue_at(subject, ttl, Utc::now())
    }

    pub fn issue_at(&self, subject: &str, ttl: Duration, now: DateTime<Utc>) -> Result<String> {
        let expires = now
            .checked_add_signed(ttl)
            .ok_or_else(|| DrError::Config(format!("token lifetime {} is out of range", ttl)))?;
        let mut nonce = [0u8; 16];
        OsRng.fill_bytes(&mut nonce);
        let claims = SessionClaims {
            subject: subject.to_string(),
            issued_at: now.timestamp(),
            expires_at: expires.timestamp(),
            nonce: hex::encode(nonce),
        };
        let payload = serde_json::to_vec(&claims)?;

        let expiry = claims.expires_at.to_le_bytes();
        let blob = self.cipher.seal_with_context(&payload, Purpose::Session, &expiry)?;

        let mut out = Vec::with_capacity(HEADER_LEN + NONCE_SIZE + TAG_SIZE + blob.ciphertext.len());
        out.push(blob.format_version);
        out.extend_from_slice(&expiry);
        out.extend_from_slice(&blob.key_version.to_le_bytes());
        out.extend_from_slice(&blob.nonce);
        out.extend_from_slice(&blob.tag);
        out.extend_from_slice(&blob.ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims> {
        self.verify_at(token, Utc::now())
    }

    /// Returns `ExpiredToken` for a past expiry regardless of payload validity
    /// and `TamperedToken` for any framing or authentication failure.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| DrError::TamperedToken)?;
        if bytes.len() < HEADER_LEN + NONCE_SIZE + TAG_SIZE {
            return Err(DrError::TamperedToken);
        }
        if bytes[0] != FORMAT_VERSION {
            return Err(DrError::TamperedToken);
        }

        let mut expiry = [0u8; 8];
        expiry.copy_from_slice(&bytes[1..9]);
        let expires_at = i64::from_le_bytes(expiry);
        if expires_at < now.timestamp() {
            debug!(expires_at, "Rejecting expired session token");
            return Err(DrError::ExpiredToken);
        }

        let key_version = u32::from_le_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + NONCE_SIZE]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&bytes[HEADER_LEN + NONCE_SIZE..HEADER_LEN + NONCE_SIZE + TAG_SIZE]);

        let blob = EncryptedBlob {
            format_version: bytes[0],
            key_version,
            nonce,
            tag,
            name: None,
            ciphertext: bytes[HEADER_LEN + NONCE_SIZE + TAG_SIZE..].to_vec(),
        };

        let payload = self
            .cipher
            .open_with_context(&blob, Purpose::Session, &expiry)
            .map_err(|e| {
                debug!("Session token failed to open: {}", e);
                DrError::TamperedToken
            })?;

        let claims: SessionClaims = serde_json::from_slice(&payload).map_err(|_| DrError::TamperedToken)?;
        if claims.expires_at != expires_at {
            return Err(DrError::TamperedToken);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{KdfParams, KeyManager, KEY_SIZE};
    use std::sync::Arc;
    use zeroize::Zeroizing;

    fn codec() -> SessionTokenCodec {
        let keys = KeyManager::new(Zeroizing::new([9u8; KEY_SIZE]), KdfParams::fast()).unwrap();
        SessionTokenCodec::new(FieldCipher::new(Arc::new(keys)))
    }

    #[test]
    fn test_issue_and_verify() {
        let c = codec();
        let token = c.issue("user-17", Duration::minutes(30)).unwrap();
        let claims = c.verify(&token).unwrap();
        assert_eq!(claims.subject, "user-17");
        assert_eq!(claims.expires_at - claims.issued_at, 30 * 60);
    }

    #[test]
    fn test_expired_token() {
        let c = codec();
        let issued = Utc::now() - Duration::hours(2);
        let token = c.issue_at("user-1", Duration::hours(1), issued).unwrap();
        assert!(matches!(c.verify(&token), Err(DrError::ExpiredToken)));
    }

    #[test]
    fn test_expired_wins_over_tampering() {
        let c = codec();
        let issued = Utc::now() - Duration::hours(2);
        let token = c.issue_at("user-1", Duration::hours(1), issued).unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = URL_SAFE_NO_PAD.encode(bytes);
        assert!(matches!(c.verify(&tampered), Err(DrError::ExpiredToken)));
    }

    #[test]
    fn test_tampered_ciphertext() {
        let c = codec();
        let token = c.issue("user-2", Duration::minutes(5)).unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            c.verify(&URL_SAFE_NO_PAD.encode(bytes)),
            Err(DrError::TamperedToken)
        ));
    }

    #[test]
    fn test_extended_expiry_is_detected() {
        let c = codec();
        let token = c.issue("user-3", Duration::minutes(5)).unwrap();
        let mut bytes = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let extended = (Utc::now() + Duration::days(365)).timestamp();
        bytes[1..9].copy_from_slice(&extended.to_le_bytes());
        assert!(matches!(
            c.verify(&URL_SAFE_NO_PAD.encode(bytes)),
            Err(DrError::TamperedToken)
        ));
    }

    #[test]
    fn test_out_of_range_lifetime_is_rejected() {
        let c = codec();
        assert!(matches!(c.issue("ops", Duration::MAX), Err(DrError::Config(_))));
        assert!(matches!(c.issue("ops", Duration::MIN), Err(DrError::Config(_))));
        assert!(matches!(lifetime_minutes(i64::MAX), Err(DrError::Config(_))));
        assert_eq!(lifetime_minutes(90).unwrap(), Duration::minutes(90));
    }

    #[test]
    fn test_garbage_is_tampered() {
        let c = codec();
        assert!(matches!(c.verify("not a token!"), Err(DrError::TamperedToken)));
        assert!(matches!(c.verify("AAAA"), Err(DrError::TamperedToken)));
    }
}
