//! Opaque slot tokens.
//!
//! A token binds a `(business, schedule)` pair so clients can come back with a
//! reservation request without ever seeing or supplying raw identifiers.
//! Layout before base64url: `[12-byte nonce][ChaCha20-Poly1305 ciphertext + tag]`,
//! plaintext `"{business}:{schedule}"`. A fresh nonce per call makes two
//! encodings of the same pair unlinkable.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::BookingError;
use crate::model::ScheduleKey;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SEPARATOR: char = ':';

pub const KEY_LEN: usize = 32;

/// Client-facing handle; only [`SlotTokenCodec`] can read it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotToken(String);

impl SlotToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SlotToken {
    fn from(s: String) -> Self {
        SlotToken(s)
    }
}

impl fmt::Display for SlotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// A part to encode was empty or contained the separator.
    InvalidPart,
    /// Not base64url, or too short to hold nonce and tag.
    Malformed,
    /// Authentication tag did not verify.
    Unauthenticated,
    /// Decrypted, but not exactly two non-empty parts.
    BadPayload,
    /// Parts decoded but are not valid identifiers.
    BadIdentifier,
    /// The cipher refused to encrypt.
    Encrypt,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenError::InvalidPart => write!(f, "token parts must be non-empty and free of '{SEPARATOR}'"),
            TokenError::Malformed => write!(f, "malformed slot token"),
            TokenError::Unauthenticated => write!(f, "slot token failed authentication"),
            TokenError::BadPayload => write!(f, "slot token payload is not a business/schedule pair"),
            TokenError::BadIdentifier => write!(f, "slot token carries an invalid identifier"),
            TokenError::Encrypt => write!(f, "slot token encryption failed"),
        }
    }
}

impl std::error::Error for TokenError {}

impl From<TokenError> for BookingError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Encrypt => BookingError::Internal(e.to_string()),
            other => BookingError::InvalidInput(other.to_string()),
        }
    }
}

pub struct SlotTokenCodec {
    cipher: ChaCha20Poly1305,
}

impl fmt::Debug for SlotTokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTokenCodec").finish_non_exhaustive()
    }
}

impl SlotTokenCodec {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Codec with a random key. Tokens do not survive a restart.
    pub fn ephemeral() -> Self {
        Self::new(&generate_key())
    }

    pub fn encode(&self, business: &str, schedule: &str) -> Result<SlotToken, TokenError> {
        for part in [business, schedule] {
            if part.is_empty() || part.contains(SEPARATOR) {
                return Err(TokenError::InvalidPart);
            }
        }
        let plaintext = format!("{business}{SEPARATOR}{schedule}");

        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| TokenError::Encrypt)?;

        let mut raw = Vec::with_capacity(NONCE_LEN + sealed.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);
        Ok(SlotToken(URL_SAFE_NO_PAD.encode(raw)))
    }

    pub fn decode(&self, token: &SlotToken) -> Result<(String, String), TokenError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.as_str())
            .map_err(|_| TokenError::Malformed)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(TokenError::Malformed);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| TokenError::Unauthenticated)?;
        let text = String::from_utf8(plaintext).map_err(|_| TokenError::BadPayload)?;

        let mut parts = text.split(SEPARATOR);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(b), Some(s), None) if !b.is_empty() && !s.is_empty() => {
                Ok((b.to_string(), s.to_string()))
            }
            _ => Err(TokenError::BadPayload),
        }
    }

    pub fn encode_key(&self, key: ScheduleKey) -> Result<SlotToken, TokenError> {
        self.encode(&key.business_id.to_string(), &key.schedule_id.to_string())
    }

    pub fn decode_key(&self, token: &SlotToken) -> Result<ScheduleKey, TokenError> {
        let (business, schedule) = self.decode(token)?;
        let business_id = Ulid::from_string(&business).map_err(|_| TokenError::BadIdentifier)?;
        let schedule_id = Ulid::from_string(&schedule).map_err(|_| TokenError::BadIdentifier)?;
        Ok(ScheduleKey {
            business_id,
            schedule_id,
        })
    }
}

pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Parse a base64url (unpadded) 32-byte key, as found in configuration.
pub fn parse_key(encoded: &str) -> Option<[u8; KEY_LEN]> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded.trim()).ok()?;
    bytes.try_into().ok()
}
