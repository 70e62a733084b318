//! Session key negotiation.
//!
//! A negotiation mints one [`SessionKey`] and wraps it for every participant:
//! 1. Generate a random session key
//! 2. Wrap it under the sender's own public key (so the sender can re-read history)
//! 3. Wrap it under each recipient's public key
//!
//! Recipients pick their copy by identifier; ordering carries no meaning.

use std::sync::Arc;

use thiserror::Error;
use x25519_dalek::PublicKey;

use super::asymmetric::{AsymmetricCipher, AsymmetricError};
use super::symmetric::{encode_transport, SessionKey, SessionKeyCipher};

/// Errors for negotiation.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("No recipients specified")]
    NoRecipients,

    #[error("Wrapping session key for {participant} failed: {source}")]
    WrapFailed {
        participant: String,
        #[source]
        source: AsymmetricError,
    },
}

/// A session key wrapped for one participant, in transport encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedSessionKey {
    pub recipient_id: String,
    pub ciphertext: String,
}

/// Result of a direct negotiation.
#[derive(Debug, Clone)]
pub struct DirectKeys {
    pub session_key: SessionKey,
    pub sender_wrapped: WrappedSessionKey,
    pub peer_wrapped: WrappedSessionKey,
}

/// Result of a group negotiation.
#[derive(Debug, Clone)]
pub struct GroupKeys {
    pub session_key: SessionKey,
    pub sender_wrapped: WrappedSessionKey,
    pub member_wrapped: Vec<WrappedSessionKey>,
}

/// Mints session keys and wraps them for the participants of a conversation.
pub trait SessionKeyNegotiator: Send + Sync {
    fn create_for_direct(
        &self,
        local_id: &str,
        local_public: &PublicKey,
        peer_id: &str,
        peer_public: &PublicKey,
    ) -> Result<DirectKeys, NegotiationError>;

    fn create_for_group(
        &self,
        local_id: &str,
        local_public: &PublicKey,
        members: &[(String, PublicKey)],
    ) -> Result<GroupKeys, NegotiationError>;
}

/// Default negotiator: one fresh key, one wrap per participant.
#[derive(Clone)]
pub struct FanOutNegotiator {
    asymmetric: Arc<dyn AsymmetricCipher>,
    symmetric: Arc<dyn SessionKeyCipher>,
}

impl FanOutNegotiator {
    pub fn new(asymmetric: Arc<dyn AsymmetricCipher>, symmetric: Arc<dyn SessionKeyCipher>) -> Self {
        Self {
            asymmetric,
            symmetric,
        }
    }

    /// Wraps a session key for a single participant.
    fn wrap(
        &self,
        key: &SessionKey,
        participant: &str,
        public: &PublicKey,
    ) -> Result<WrappedSessionKey, NegotiationError> {
        let sealed = self
            .asymmetric
            .encrypt(public, key.as_bytes())
            .map_err(|source| NegotiationError::WrapFailed {
                participant: participant.to_string(),
                source,
            })?;

        Ok(WrappedSessionKey {
            recipient_id: participant.to_string(),
            ciphertext: encode_transport(&sealed),
        })
    }
}

impl SessionKeyNegotiator for FanOutNegotiator {
    fn create_for_direct(
        &self,
        local_id: &str,
        local_public: &PublicKey,
        peer_id: &str,
        peer_public: &PublicKey,
    ) -> Result<DirectKeys, NegotiationError> {
        let session_key = self.symmetric.generate_key();
        let sender_wrapped = self.wrap(&session_key, local_id, local_public)?;
        let peer_wrapped = self.wrap(&session_key, peer_id, peer_public)?;

        Ok(DirectKeys {
            session_key,
            sender_wrapped,
            peer_wrapped,
        })
    }

    fn create_for_group(
        &self,
        local_id: &str,
        local_public: &PublicKey,
        members: &[(String, PublicKey)],
    ) -> Result<GroupKeys, NegotiationError> {
        if members.is_empty() {
            return Err(NegotiationError::NoRecipients);
        }

        let session_key = self.symmetric.generate_key();
        let sender_wrapped = self.wrap(&session_key, local_id, local_public)?;

        let member_wrapped = members
            .iter()
            .map(|(id, public)| self.wrap(&session_key, id, public))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GroupKeys {
            session_key,
            sender_wrapped,
            member_wrapped,
        })
    }
}
