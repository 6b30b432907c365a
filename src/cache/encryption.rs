//! Payload encryption using AES-256-GCM
//!
//! Ciphertext layout is `<12-byte nonce><ciphertext+tag>`; a fresh random
//! nonce is drawn for every payload.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::config::ENCRYPTION_KEY_SIZE;
use crate::error::{Error, Result};

/// Nonce size for AES-256-GCM (96 bits)
const NONCE_SIZE: usize = 12;

/// Symmetric cipher for remote payloads
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl PayloadCipher {
    /// Create a cipher from a raw 256-bit key
    pub fn new(key: &[u8; ENCRYPTION_KEY_SIZE]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::Encryption(format!("Failed to create cipher: {e}")))?;
        Ok(Self { cipher })
    }

    /// Encrypt a payload
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Bytes> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Encryption(format!("Encryption failed: {e}")))?;

        let mut out = BytesMut::with_capacity(NONCE_SIZE + ciphertext.len());
        out.put_slice(&nonce_bytes);
        out.put_slice(&ciphertext);
        Ok(out.freeze())
    }

    /// Decrypt a payload produced by [`PayloadCipher::encrypt`]
    pub fn decrypt(&self, payload: &[u8]) -> Result<Bytes> {
        if payload.len() < NONCE_SIZE {
            return Err(Error::Encryption("Encrypted payload shorter than nonce".into()));
        }

        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| Error::Encryption(format!("Decryption failed: {e}")))?;

        Ok(Bytes::from(plaintext))
    }
}

impl std::fmt::Debug for PayloadCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCipher").finish_non_exhaustive()
    }
}
