//! Session-key encryption of message bodies.
//!
//! Every conversation gets a fresh random 256-bit [`SessionKey`]. Bodies are
//! sealed with ChaCha20-Poly1305 so tampering is detected before any plaintext
//! is returned.
//!
//! All ciphertext travels as standard padded base64; use [`encode_transport`]
//! and [`decode_transport`] in both directions.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Session key length in bytes.
pub const SESSION_KEY_LEN: usize = 32;

/// Nonce size for ChaCha20Poly1305.
const NONCE_SIZE: usize = 12;

/// Poly1305 tag size.
const TAG_SIZE: usize = 16;

/// Errors that can occur during symmetric encryption.
#[derive(Error, Debug)]
pub enum SymmetricError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("Invalid transport encoding")]
    InvalidEncoding,

    #[error("Invalid session key length: {0}")]
    InvalidKeyLength(usize),
}

/// Ephemeral symmetric key for one conversation.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

impl SessionKey {
    /// Fresh key from the OS random source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Rebuilds a key from unwrapped bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SymmetricError> {
        let arr: [u8; SESSION_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| SymmetricError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

/// Symmetric encryption of message bodies under a [`SessionKey`].
pub trait SessionKeyCipher: Send + Sync {
    /// Mints a new session key.
    fn generate_key(&self) -> SessionKey {
        SessionKey::generate()
    }

    fn encrypt(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, SymmetricError>;

    fn decrypt(&self, key: &SessionKey, ciphertext: &[u8]) -> Result<Vec<u8>, SymmetricError>;

    /// Encrypts UTF-8 text and returns the transport (base64) form.
    fn encrypt_text(&self, key: &SessionKey, plaintext: &str) -> Result<String, SymmetricError> {
        let sealed = self.encrypt(key, plaintext.as_bytes())?;
        Ok(encode_transport(&sealed))
    }

    /// Inverse of [`SessionKeyCipher::encrypt_text`].
    fn decrypt_text(&self, key: &SessionKey, encoded: &str) -> Result<String, SymmetricError> {
        let sealed = decode_transport(encoded)?;
        let plain = self.decrypt(key, &sealed)?;
        String::from_utf8(plain).map_err(|_| SymmetricError::DecryptionFailed)
    }
}

/// ChaCha20-Poly1305 with a random nonce per message.
///
/// Output format: nonce (12 bytes) || ciphertext (variable, includes auth tag)
#[derive(Debug, Default, Clone, Copy)]
pub struct ChaChaSessionCipher;

impl ChaChaSessionCipher {
    pub fn new() -> Self {
        Self
    }
}

impl SessionKeyCipher for ChaChaSessionCipher {
    fn encrypt(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, SymmetricError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|_| SymmetricError::EncryptionFailed)?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| SymmetricError::EncryptionFailed)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, key: &SessionKey, data: &[u8]) -> Result<Vec<u8>, SymmetricError> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SymmetricError::CiphertextTooShort);
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);

        let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|_| SymmetricError::DecryptionFailed)?;

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SymmetricError::DecryptionFailed)
    }
}

/// Canonical binary-to-text encoding for everything on the wire.
pub fn encode_transport(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Inverse of [`encode_transport`].
pub fn decode_transport(text: &str) -> Result<Vec<u8>, SymmetricError> {
    BASE64
        .decode(text.as_bytes())
        .map_err(|_| SymmetricError::InvalidEncoding)
}
