//! At-rest sealing for vendor credentials.
//!
//! Secrets are encrypted with AES-256-GCM under a key derived from the
//! process master key via HKDF-SHA256. The derivation is salted with the
//! owning record's id, so a sealed value cannot be replayed onto another
//! record.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

const NONCE_LEN: usize = 12;
const KEY_INFO: &[u8] = b"stagelight.credential-sealing.v1";

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("malformed sealed value")]
    Malformed,
}

/// Seals and unseals secrets under a process-wide master key.
#[derive(Clone)]
pub struct Sealer {
    master_key: [u8; 32],
}

impl Sealer {
    pub fn new(master_key: [u8; 32]) -> Self {
        Self { master_key }
    }

    fn derive_key(&self, owner: Uuid) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(Some(owner.as_bytes()), &self.master_key);
        let mut key = [0u8; 32];
        hk.expand(KEY_INFO, &mut key)
            .expect("HKDF expand must succeed for 32 byte output");
        key
    }

    /// Seal a secret for storage. Output is `base64(nonce || ciphertext)`.
    pub fn seal(&self, owner: Uuid, plaintext: &str) -> Result<String, SealError> {
        let key = self.derive_key(owner);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| SealError::Encrypt)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(envelope))
    }

    /// Recover the plaintext secret from a sealed value.
    pub fn unseal(&self, owner: Uuid, sealed: &str) -> Result<String, SealError> {
        let envelope = BASE64.decode(sealed).map_err(|_| SealError::Malformed)?;
        if envelope.len() <= NONCE_LEN {
            return Err(SealError::Malformed);
        }
        let (nonce, ciphertext) = envelope.split_at(NONCE_LEN);

        let key = self.derive_key(owner);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|_| SealError::Malformed)
    }
}
