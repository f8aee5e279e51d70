//! Encryption envelope: ChaCha20-Poly1305 with a rotating key ring.
//!
//! The sender always seals with the primary key. Receivers trial-decrypt
//! against every installed key so that key rotation can proceed without a
//! flag day: install everywhere, switch primary everywhere, then remove.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use thiserror::Error;
use zeroize::ZeroizeOnDrop;

/// Key size in bytes (256-bit ChaCha20-Poly1305 keys).
pub const KEY_SIZE: usize = 32;

/// Nonce size in bytes prepended to every sealed payload.
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size appended by the AEAD.
pub const TAG_SIZE: usize = 16;

/// A shared secret key with zeroize-on-drop semantics.
#[derive(Clone, PartialEq, Eq, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn try_from_slice(slice: &[u8]) -> Result<Self, KeyringError> {
        if slice.len() != KEY_SIZE {
            return Err(KeyringError::InvalidKeyLength(slice.len()));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey").finish_non_exhaustive()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyringError {
    #[error("invalid key length: expected {KEY_SIZE} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("key is not installed")]
    KeyNotInstalled,
    #[error("cannot remove the primary key")]
    RemovePrimary,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("payload truncated")]
    Truncated,
    #[error("no installed keys could decrypt the message")]
    NoDecryptionKey,
    #[error("encryption failed")]
    SealFailed,
}

/// Installed encryption keys. The first key is the primary used for
/// sealing; all keys are candidates for opening.
#[derive(Clone)]
pub struct Keyring {
    keys: Vec<SecretKey>,
}

impl Keyring {
    #[must_use]
    pub fn new(primary: SecretKey) -> Self {
        Self {
            keys: vec![primary],
        }
    }

    #[must_use]
    pub fn from_keys(primary: SecretKey, secondary: Vec<SecretKey>) -> Self {
        let mut ring = Self::new(primary);
        for key in secondary {
            let _ = ring.install(key);
        }
        ring
    }

    /// Install a key as a decryption candidate. Installing an already
    /// present key is a no-op.
    pub fn install(&mut self, key: SecretKey) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    /// Promote an installed key to primary.
    pub fn use_key(&mut self, key: &SecretKey) -> Result<(), KeyringError> {
        let idx = self
            .keys
            .iter()
            .position(|k| k == key)
            .ok_or(KeyringError::KeyNotInstalled)?;
        self.keys.swap(0, idx);
        Ok(())
    }

    /// Remove an installed key. The primary key cannot be removed.
    pub fn remove(&mut self, key: &SecretKey) -> Result<(), KeyringError> {
        let idx = self
            .keys
            .iter()
            .position(|k| k == key)
            .ok_or(KeyringError::KeyNotInstalled)?;
        if idx == 0 {
            return Err(KeyringError::RemovePrimary);
        }
        self.keys.remove(idx);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Seal a payload with the primary key: random nonce, then ciphertext
    /// with the authentication tag. The label bytes are bound as AAD.
    pub fn seal(&self, plain: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.keys[0].bytes));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plain, aad })
            .map_err(|_| CryptoError::SealFailed)?;

        let mut buf = Vec::with_capacity(NONCE_SIZE + sealed.len());
        buf.extend_from_slice(&nonce);
        buf.extend_from_slice(&sealed);
        Ok(buf)
    }

    /// Open a sealed payload by trial decryption across the ring.
    pub fn open(&self, buf: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if buf.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Truncated);
        }
        let (nonce, sealed) = buf.split_at(NONCE_SIZE);
        for key in &self.keys {
            let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.bytes));
            if let Ok(plain) =
                cipher.decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad })
            {
                return Ok(plain);
            }
        }
        Err(CryptoError::NoDecryptionKey)
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("keys", &self.keys.len())
            .finish()
    }
}
