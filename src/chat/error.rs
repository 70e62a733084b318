//! Chat error types.

use thiserror::Error;

use crate::crypto::{AsymmetricError, NegotiationError, SymmetricError};
use crate::directory::DirectoryError;
use crate::keystore::KeyStoreError;

/// Errors that can occur during chat operations.
///
/// Messages never carry key material or plaintext.
#[derive(Error, Debug)]
pub enum ChatError {
    /// The transport refused or dropped the connection.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A participant's public key could not be resolved.
    #[error("Public key lookup for {participant} failed: {source}")]
    DirectoryLookupFailed {
        /// Participant whose key was requested.
        participant: String,
        /// Underlying directory failure.
        #[source]
        source: DirectoryError,
    },

    /// No private key is stored locally for this identity.
    #[error("No private key stored for {0}")]
    PrivateKeyMissing(String),

    /// A cryptographic operation rejected its input while encrypting.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// A cryptographic operation rejected its input while decrypting.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// The local participant has no wrapped key in a group message.
    #[error("{0} is not among the recipients of this message")]
    RecipientNotInFanOut(String),

    /// A frame or payload could not be (de)serialized.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Transport error after the connection was established.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The channel or session has been closed.
    #[error("Channel closed")]
    Closed,

    /// Local key store failure.
    #[error("Key store error: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ChatError {
    /// Short category label, safe to log.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::ConnectionError(_) => "connection",
            ChatError::DirectoryLookupFailed { .. } => "directory",
            ChatError::PrivateKeyMissing(_) => "private-key-missing",
            ChatError::EncryptionFailed(_) => "encryption",
            ChatError::DecryptionFailed(_) => "decryption",
            ChatError::RecipientNotInFanOut(_) => "not-in-fan-out",
            ChatError::SerializationFailed(_) => "serialization",
            ChatError::TransportError(_) => "transport",
            ChatError::Closed => "closed",
            ChatError::KeyStore(_) => "key-store",
            ChatError::IoError(_) => "io",
        }
    }
}

impl From<SymmetricError> for ChatError {
    fn from(e: SymmetricError) -> Self {
        match e {
            SymmetricError::EncryptionFailed => ChatError::EncryptionFailed(e.to_string()),
            _ => ChatError::DecryptionFailed(e.to_string()),
        }
    }
}

impl From<AsymmetricError> for ChatError {
    fn from(e: AsymmetricError) -> Self {
        if e.is_decryption() {
            ChatError::DecryptionFailed(e.to_string())
        } else {
            ChatError::EncryptionFailed(e.to_string())
        }
    }
}

impl From<NegotiationError> for ChatError {
    fn from(e: NegotiationError) -> Self {
        ChatError::EncryptionFailed(e.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::SerializationFailed(e.to_string())
    }
}
