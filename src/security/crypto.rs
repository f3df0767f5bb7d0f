//! Credential encryption at rest
//!
//! Format: `base64(nonce):base64(tag):base64(ciphertext)` with
//! ChaCha20-Poly1305. The key is SHA-256 of the configured key material.

use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Malformed encrypted value: {0}")]
    Format(&'static str),

    #[error("Decryption failed: authentication tag mismatch")]
    Authentication,

    #[error("Encryption failed")]
    Encryption,
}

pub struct CredentialCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl CredentialCipher {
    /// Derive the key from `key_material`
    pub fn from_key_material(key_material: &str) -> Self {
        let digest = Sha256::digest(key_material.as_bytes());
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&digest);
        Self { key }
    }

    /// Random per-process key. Anything encrypted with it is unreadable after restart.
    pub fn ephemeral() -> Self {
        warn!("ENCRYPTION_KEY not set, using an ephemeral key; stored credentials will not survive a restart");
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rand::rngs::OsRng.fill_bytes(&mut *key);
        Self { key }
    }

    pub fn from_config(key_material: Option<&str>) -> Self {
        match key_material {
            Some(material) => Self::from_key_material(material),
            None => Self::ephemeral(),
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let cipher =
            ChaCha20Poly1305::new_from_slice(&*self.key).map_err(|_| CryptoError::Encryption)?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;

        // The AEAD output is ciphertext || tag
        if sealed.len() < TAG_LEN {
            return Err(CryptoError::Encryption);
        }
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}:{}:{}",
            STANDARD.encode(nonce),
            STANDARD.encode(tag),
            STANDARD.encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, blob: &str) -> Result<Zeroizing<String>, CryptoError> {
        let mut parts = blob.split(':');
        let (nonce_b64, tag_b64, ciphertext_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(n), Some(t), Some(c), None) => (n, t, c),
                _ => return Err(CryptoError::Format("expected iv:authTag:ciphertext")),
            };

        let nonce = STANDARD
            .decode(nonce_b64)
            .map_err(|_| CryptoError::Format("iv is not valid base64"))?;
        let tag = STANDARD
            .decode(tag_b64)
            .map_err(|_| CryptoError::Format("authTag is not valid base64"))?;
        let ciphertext = STANDARD
            .decode(ciphertext_b64)
            .map_err(|_| CryptoError::Format("ciphertext is not valid base64"))?;

        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Format("iv has wrong length"));
        }
        if tag.len() != TAG_LEN {
            return Err(CryptoError::Format("authTag has wrong length"));
        }

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let cipher = ChaCha20Poly1305::new_from_slice(&*self.key)
            .map_err(|_| CryptoError::Authentication)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
                .map_err(|_| CryptoError::Authentication)?,
        );

        String::from_utf8(plaintext.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::Format("plaintext is not UTF-8"))
    }
}
