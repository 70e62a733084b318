//! Cryptographic primitives for sealchat.
//!
//! This module provides:
//! - Identity key pairs (X25519) and their PEM form
//! - Asymmetric wrapping of short payloads (X25519 + HKDF + ChaCha20Poly1305)
//! - Authenticated message-body encryption under per-conversation session keys
//! - Session key negotiation with per-participant fan-out

pub mod asymmetric;
pub mod keys;
pub mod negotiator;
pub mod symmetric;

pub use asymmetric::{AsymmetricCipher, AsymmetricError, SealedBoxCipher, MAX_PLAINTEXT_LEN};
pub use keys::{
    decode_public_key_pem, decode_secret_key_pem, encode_public_key_pem, encode_secret_key_pem,
    fingerprint, load_public_key, KeyError, KeyPair,
};
pub use negotiator::{
    DirectKeys, FanOutNegotiator, GroupKeys, NegotiationError, SessionKeyNegotiator,
    WrappedSessionKey,
};
pub use symmetric::{
    decode_transport, encode_transport, ChaChaSessionCipher, SessionKey, SessionKeyCipher,
    SymmetricError, SESSION_KEY_LEN,
};
