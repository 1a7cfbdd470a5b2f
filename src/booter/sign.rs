//! Opaque signed blob references.
//!
//! The HTTP layer hands out URLs containing blob references, and cannot
//! trust that a reference coming back hasn't been tampered with. It
//! also keeps no table of handed-out references. Authenticated
//! encryption under a per-process key squares that circle: a token is
//! `nonce(24) || secretbox(reference)`, URL-safe base64 encoded, and
//! any modified token fails to open.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;
use rand::RngCore;
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

/// All token failures collapse into this one error so a caller cannot
/// distinguish a truncated token from a forged one.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignError {
    #[error("invalid signed reference")]
    Invalid,

    #[error("could not seal reference")]
    Seal,
}

/// Seals blob references into URL-safe tokens and opens them again.
///
/// The key is generated fresh at startup and never leaves the process;
/// tokens are only meant to outlive a single boot attempt.
pub struct UrlSigner {
    cipher: XSalsa20Poly1305,
}

impl UrlSigner {
    /// Create a signer with a fresh random key.
    pub fn new() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        Self::from_key(&key)
    }

    /// Create a signer with a fixed key.
    pub fn from_key(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(GenericArray::from_slice(key)),
        }
    }

    /// Seal a blob reference into a token.
    pub fn encode(&self, id: &str) -> Result<String, SignError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), id.as_bytes())
            .map_err(|_| SignError::Seal)?;

        let mut raw = Vec::with_capacity(NONCE_LEN + sealed.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);
        Ok(URL_SAFE.encode(raw))
    }

    /// Open a token back into the blob reference it was sealed from.
    pub fn decode(&self, token: &str) -> Result<String, SignError> {
        let raw = URL_SAFE.decode(token).map_err(|_| SignError::Invalid)?;
        if raw.len() < NONCE_LEN {
            return Err(SignError::Invalid);
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(GenericArray::from_slice(nonce), sealed)
            .map_err(|_| SignError::Invalid)?;
        String::from_utf8(plain).map_err(|_| SignError::Invalid)
    }
}

impl Default for UrlSigner {
    fn default() -> Self {
        Self::new()
    }
}
