// src/core/protocol/cipher.rs

//! The optional symmetric payload cipher.
//!
//! When a cluster-wide pre-shared key is configured, every frame payload is
//! authenticated-encrypted with ChaCha20-Poly1305. The frame header always
//! stays in plaintext; only the payload is sealed. An empty payload is sent
//! as-is so that zero-length frames stay zero-length on the wire.

use crate::core::SentraError;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

/// Length of the nonce prepended to every sealed payload.
pub const NONCE_LEN: usize = 12;
/// Poly1305 authentication tag length.
pub const TAG_LEN: usize = 16;
/// Bytes the cipher adds on top of the plaintext length.
pub const CIPHER_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// A cheaply cloneable AEAD context derived from the 32-character cluster key.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher").finish_non_exhaustive()
    }
}

impl PayloadCipher {
    /// Builds a cipher from the configured cluster key. The key must be
    /// exactly 32 ASCII characters; its bytes are used as the AEAD key.
    pub fn from_key(key: &str) -> Result<Self, SentraError> {
        if key.len() != 32 || !key.is_ascii() {
            return Err(SentraError::InvalidKey(format!(
                "expected 32 ASCII characters, got {}",
                key.len()
            )));
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        Ok(Self { cipher })
    }

    /// Seals a plaintext payload. Output layout: `nonce ‖ ciphertext ‖ tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SentraError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let mut out = Vec::with_capacity(plaintext.len() + CIPHER_OVERHEAD);
        out.extend_from_slice(&nonce);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SentraError::Internal("payload encryption failed".into()))?;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Opens a sealed payload, authenticating it in the process.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SentraError> {
        if sealed.len() < CIPHER_OVERHEAD {
            return Err(SentraError::BadAuth);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SentraError::BadAuth)
    }
}
