//! Record encryption
//!
//! XChaCha20-Poly1305 with a random 192-bit nonce per write. The record's
//! storage key is passed as associated data, so a ciphertext copied under a
//! different key fails authentication instead of decrypting.
//!
//! Output layout: `nonce(24) || ciphertext || tag(16)`.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{EngineError, EngineResult};

/// Key length in bytes
pub const KEY_SIZE: usize = 32;
/// Nonce length in bytes
pub const NONCE_SIZE: usize = 24;
/// Authentication tag length in bytes
pub const TAG_SIZE: usize = 16;
/// Bytes added to every plaintext
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// AEAD bound to one 256-bit key. Cheap to clone and safe to share.
#[derive(Clone)]
pub struct Cipher {
    aead: XChaCha20Poly1305,
}

impl Cipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self { aead: XChaCha20Poly1305::new(Key::from_slice(key)) }
    }

    /// Fresh random key from the OS generator.
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        key
    }

    pub fn encrypt(&self, record_key: &[u8], plaintext: &[u8]) -> EngineResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .aead
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: record_key })
            .map_err(|_| EngineError::Encryption {
                reason: format!("plaintext of {} bytes rejected", plaintext.len()),
            })?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, record_key: &[u8], ciphertext: &[u8]) -> EngineResult<Vec<u8>> {
        if ciphertext.len() < OVERHEAD {
            return Err(EngineError::Decryption { key_len: record_key.len() });
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        self.aead
            .decrypt(XNonce::from_slice(nonce), Payload { msg: sealed, aad: record_key })
            .map_err(|_| EngineError::Decryption { key_len: record_key.len() })
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(..)")
    }
}
