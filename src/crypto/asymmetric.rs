//! Asymmetric wrapping of session keys.
//!
//! Sealed-box construction over X25519:
//! 1. Generate ephemeral X25519 key pair
//! 2. Perform ECDH with recipient's public key
//! 3. Derive symmetric key using HKDF-SHA256
//! 4. Encrypt payload with ChaCha20Poly1305
//!
//! Only short payloads (session keys) go through here. Message bodies use
//! [`crate::crypto::symmetric`].

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// HKDF info string for key derivation.
const HKDF_INFO: &[u8] = b"SEALCHAT-V1-WRAP";

/// Nonce size for ChaCha20Poly1305.
const NONCE_SIZE: usize = 12;

/// Poly1305 tag size.
const TAG_SIZE: usize = 16;

/// Largest payload accepted for wrapping.
pub const MAX_PLAINTEXT_LEN: usize = 512;

/// Errors that can occur during asymmetric encryption operations.
#[derive(Error, Debug)]
pub enum AsymmetricError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Invalid ciphertext: too short")]
    CiphertextTooShort,

    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

impl AsymmetricError {
    /// True when the failure happened while opening a ciphertext.
    pub fn is_decryption(&self) -> bool {
        matches!(
            self,
            AsymmetricError::DecryptionFailed | AsymmetricError::CiphertextTooShort
        )
    }
}

/// Public-key encryption of short payloads.
pub trait AsymmetricCipher: Send + Sync {
    /// Encrypts `plaintext` so only the holder of `recipient`'s secret can read it.
    fn encrypt(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, AsymmetricError>;

    /// Inverse of [`AsymmetricCipher::encrypt`].
    fn decrypt(&self, secret: &StaticSecret, ciphertext: &[u8]) -> Result<Vec<u8>, AsymmetricError>;
}

/// X25519 + HKDF + ChaCha20Poly1305 sealed box.
///
/// Format: ephemeral_public (32) || nonce (12) || ciphertext (variable, includes tag)
#[derive(Debug, Default, Clone, Copy)]
pub struct SealedBoxCipher;

impl SealedBoxCipher {
    pub fn new() -> Self {
        Self
    }
}

/// Derives the per-box symmetric key, binding both public keys into the salt.
fn derive_box_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &PublicKey,
    recipient_public: &PublicKey,
) -> Result<[u8; 32], AsymmetricError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public.as_bytes());
    salt[32..].copy_from_slice(recipient_public.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut key = [0u8; 32];
    hk.expand(HKDF_INFO, &mut key)
        .map_err(|_| AsymmetricError::KeyDerivationFailed)?;
    Ok(key)
}

impl AsymmetricCipher for SealedBoxCipher {
    fn encrypt(&self, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, AsymmetricError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(AsymmetricError::PayloadTooLarge {
                len: plaintext.len(),
                max: MAX_PLAINTEXT_LEN,
            });
        }

        // Generate ephemeral key pair
        let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral_secret);

        let shared_secret = ephemeral_secret.diffie_hellman(recipient);
        let key = derive_box_key(shared_secret.as_bytes(), &ephemeral_public, recipient)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);

        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|_| AsymmetricError::KeyDerivationFailed)?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| AsymmetricError::EncryptionFailed("AEAD seal failed".to_string()))?;

        let mut result = Vec::with_capacity(32 + NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(ephemeral_public.as_bytes());
        result.extend_from_slice(&nonce_bytes);
        result.extend(ciphertext);
        Ok(result)
    }

    fn decrypt(&self, secret: &StaticSecret, ciphertext: &[u8]) -> Result<Vec<u8>, AsymmetricError> {
        // Minimum: 32 (public key) + 12 (nonce) + 16 (auth tag)
        if ciphertext.len() < 32 + NONCE_SIZE + TAG_SIZE {
            return Err(AsymmetricError::CiphertextTooShort);
        }

        let mut ephemeral_bytes = [0u8; 32];
        ephemeral_bytes.copy_from_slice(&ciphertext[..32]);
        let ephemeral_public = PublicKey::from(ephemeral_bytes);
        let nonce = Nonce::from_slice(&ciphertext[32..32 + NONCE_SIZE]);
        let sealed = &ciphertext[32 + NONCE_SIZE..];

        let recipient_public = PublicKey::from(secret);
        let shared_secret = secret.diffie_hellman(&ephemeral_public);
        let key = derive_box_key(shared_secret.as_bytes(), &ephemeral_public, &recipient_public)?;

        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|_| AsymmetricError::KeyDerivationFailed)?;

        cipher
            .decrypt(nonce, sealed)
            .map_err(|_| AsymmetricError::DecryptionFailed)
    }
}
