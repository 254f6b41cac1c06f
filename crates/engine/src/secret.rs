//! Secret box used to keep proxy passwords encrypted at rest.
//!
//! [`KeyedSecretBox`] seals with AES-256-GCM under a key hashed from
//! `ENCRYPTION_KEY`. Layout: `nonce (12) || ciphertext+tag`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha3::{Digest, Sha3_256};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecretError {
    #[error("ciphertext is truncated")]
    Truncated,
    #[error("ciphertext failed authentication")]
    Tampered,
    #[error("encryption failed")]
    Seal,
    #[error("decrypted secret is not valid UTF-8")]
    Encoding,
}

pub trait SecretBox: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, SecretError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<String, SecretError>;
}

/// Pass-through box for deployments without `ENCRYPTION_KEY`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainSecretBox;

impl SecretBox for PlainSecretBox {
    fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, SecretError> {
        Ok(plaintext.as_bytes().to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<String, SecretError> {
        String::from_utf8(ciphertext.to_vec()).map_err(|_| SecretError::Encoding)
    }
}

#[derive(Clone)]
pub struct KeyedSecretBox {
    cipher: Aes256Gcm,
}

impl KeyedSecretBox {
    pub fn new(key_material: &str) -> Self {
        Self {
            cipher: Aes256Gcm::new(&derive_key(key_material).into()),
        }
    }
}

fn derive_key(source: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    key.copy_from_slice(&Sha3_256::digest(source.trim().as_bytes()));
    key
}

impl SecretBox for KeyedSecretBox {
    fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>, SecretError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| SecretError::Seal)?;

        let mut packed = Vec::with_capacity(NONCE_LEN + sealed.len());
        packed.extend_from_slice(&nonce_bytes);
        packed.extend_from_slice(&sealed);
        Ok(packed)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<String, SecretError> {
        if ciphertext.len() < NONCE_LEN + GCM_TAG_LEN {
            return Err(SecretError::Truncated);
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| SecretError::Tampered)?;
        String::from_utf8(plain).map_err(|_| SecretError::Encoding)
    }
}
