//! Who a conversation is with.
//!
//! [`Recipients`] is everything that differs between a direct and a group
//! conversation: the join/presence/message events, how a fresh session key
//! is wrapped, and which wrapped copy of an inbound message is ours.

use async_trait::async_trait;
use serde_json::Value;
use x25519_dalek::PublicKey;

use crate::chat::error::ChatError;
use crate::chat::protocol::{
    ConfirmGroup, ConfirmPrivate, DirectSessionKeys, EncryptedSessionKeys, GroupRecipientKey,
    GroupSessionKeys, JoinGroup, JoinPrivate, ReceivedMessage, SendGroupMessage,
    SendPrivateMessage, CONFIRM_CONNECTION_GROUP, CONFIRM_CONNECTION_PRIVATE, JOIN_GROUP,
    JOIN_PRIVATE, SEND_MESSAGE_GROUP, SEND_MESSAGE_PRIVATE,
};
use crate::crypto::{SessionKey, SessionKeyNegotiator};
use crate::directory::PublicKeyDirectory;

/// An event name with its JSON payload.
pub type OutboundEvent = (&'static str, Value);

/// Key material a session uses for every message it sends.
#[derive(Debug, Clone)]
pub struct OutgoingKeys {
    pub session_key: SessionKey,
    pub bundle: EncryptedSessionKeys,
}

#[async_trait]
pub trait Recipients: Send + Sync + 'static {
    /// Group relays echo messages back to their sender.
    const DISCARDS_OWN_ECHO: bool;

    /// Announcement sent right after connecting.
    fn join_event(&self, local_id: &str) -> Result<OutboundEvent, ChatError>;

    /// Answer to a `who-is-connected` probe.
    fn presence_reply(&self, local_id: &str) -> Result<OutboundEvent, ChatError>;

    /// Mint a session key and wrap it for everyone in the conversation.
    async fn wrap(
        &self,
        local_id: &str,
        local_public: &PublicKey,
        directory: &dyn PublicKeyDirectory,
        negotiator: &dyn SessionKeyNegotiator,
    ) -> Result<OutgoingKeys, ChatError>;

    /// The `send-message.*` event for one encrypted body.
    fn message_event(
        &self,
        local_id: &str,
        encrypted_message: String,
        bundle: &EncryptedSessionKeys,
    ) -> Result<OutboundEvent, ChatError>;

    /// The wrapped copy of the session key addressed to `local_id`.
    fn resolve_my_wrapped_key<'a>(
        &self,
        local_id: &str,
        message: &'a ReceivedMessage,
    ) -> Result<&'a str, ChatError>;
}

async fn lookup(
    directory: &dyn PublicKeyDirectory,
    participant: &str,
) -> Result<PublicKey, ChatError> {
    directory
        .find_public_key(participant)
        .await
        .map_err(|source| ChatError::DirectoryLookupFailed {
            participant: participant.to_string(),
            source,
        })
}

/// One-to-one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Direct {
    friend_id: String,
}

impl Direct {
    pub fn new(friend_id: impl Into<String>) -> Self {
        Self {
            friend_id: friend_id.into(),
        }
    }

    pub fn friend_id(&self) -> &str {
        &self.friend_id
    }
}

#[async_trait]
impl Recipients for Direct {
    const DISCARDS_OWN_ECHO: bool = false;

    fn join_event(&self, local_id: &str) -> Result<OutboundEvent, ChatError> {
        let payload = JoinPrivate {
            id: local_id.to_string(),
            friend_id: self.friend_id.clone(),
        };
        Ok((JOIN_PRIVATE, serde_json::to_value(payload)?))
    }

    fn presence_reply(&self, local_id: &str) -> Result<OutboundEvent, ChatError> {
        let payload = ConfirmPrivate {
            id: local_id.to_string(),
            friend_id: self.friend_id.clone(),
        };
        Ok((CONFIRM_CONNECTION_PRIVATE, serde_json::to_value(payload)?))
    }

    async fn wrap(
        &self,
        local_id: &str,
        local_public: &PublicKey,
        directory: &dyn PublicKeyDirectory,
        negotiator: &dyn SessionKeyNegotiator,
    ) -> Result<OutgoingKeys, ChatError> {
        let peer_public = lookup(directory, &self.friend_id).await?;
        let keys =
            negotiator.create_for_direct(local_id, local_public, &self.friend_id, &peer_public)?;

        Ok(OutgoingKeys {
            session_key: keys.session_key,
            bundle: EncryptedSessionKeys::Direct(DirectSessionKeys {
                sender_encrypted_session_key: keys.sender_wrapped.ciphertext,
                recipient_encrypted_session_key: keys.peer_wrapped.ciphertext,
            }),
        })
    }

    fn message_event(
        &self,
        local_id: &str,
        encrypted_message: String,
        bundle: &EncryptedSessionKeys,
    ) -> Result<OutboundEvent, ChatError> {
        let EncryptedSessionKeys::Direct(keys) = bundle else {
            return Err(ChatError::EncryptionFailed(
                "group key bundle in a direct conversation".to_string(),
            ));
        };
        let payload = SendPrivateMessage {
            id: local_id.to_string(),
            friend_id: self.friend_id.clone(),
            encrypted_message,
            encrypted_session_keys: keys.clone(),
        };
        Ok((SEND_MESSAGE_PRIVATE, serde_json::to_value(payload)?))
    }

    fn resolve_my_wrapped_key<'a>(
        &self,
        local_id: &str,
        message: &'a ReceivedMessage,
    ) -> Result<&'a str, ChatError> {
        match &message.encrypted_session_keys {
            EncryptedSessionKeys::Direct(keys) if message.sender_id == local_id => {
                Ok(keys.sender_encrypted_session_key.as_str())
            }
            EncryptedSessionKeys::Direct(keys) => Ok(keys.recipient_encrypted_session_key.as_str()),
            EncryptedSessionKeys::Group(_) => Err(ChatError::DecryptionFailed(
                "group key bundle in a direct conversation".to_string(),
            )),
        }
    }
}

/// Group conversation over a fixed participant set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    group_id: String,
    participant_ids: Vec<String>,
}

impl Group {
    pub fn new(group_id: impl Into<String>, participant_ids: Vec<String>) -> Self {
        Self {
            group_id: group_id.into(),
            participant_ids,
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn participant_ids(&self) -> &[String] {
        &self.participant_ids
    }

    /// Participants other than `local_id`, without duplicates.
    fn members<'a>(&'a self, local_id: &str) -> Vec<&'a str> {
        let mut members: Vec<&str> = Vec::with_capacity(self.participant_ids.len());
        for id in &self.participant_ids {
            if id != local_id && !members.contains(&id.as_str()) {
                members.push(id);
            }
        }
        members
    }
}

#[async_trait]
impl Recipients for Group {
    const DISCARDS_OWN_ECHO: bool = true;

    fn join_event(&self, local_id: &str) -> Result<OutboundEvent, ChatError> {
        let payload = JoinGroup {
            id: local_id.to_string(),
            group_id: self.group_id.clone(),
        };
        Ok((JOIN_GROUP, serde_json::to_value(payload)?))
    }

    fn presence_reply(&self, local_id: &str) -> Result<OutboundEvent, ChatError> {
        let payload = ConfirmGroup {
            id: local_id.to_string(),
            group_id: self.group_id.clone(),
            participants_ids: self.participant_ids.clone(),
        };
        Ok((CONFIRM_CONNECTION_GROUP, serde_json::to_value(payload)?))
    }

    async fn wrap(
        &self,
        local_id: &str,
        local_public: &PublicKey,
        directory: &dyn PublicKeyDirectory,
        negotiator: &dyn SessionKeyNegotiator,
    ) -> Result<OutgoingKeys, ChatError> {
        let mut members = Vec::new();
        for id in self.members(local_id) {
            let public = lookup(directory, id).await?;
            members.push((id.to_string(), public));
        }

        let keys = negotiator.create_for_group(local_id, local_public, &members)?;
        let recipients = keys
            .member_wrapped
            .into_iter()
            .map(|wrapped| GroupRecipientKey {
                id: wrapped.recipient_id,
                encrypted_session_key: wrapped.ciphertext,
            })
            .collect();

        Ok(OutgoingKeys {
            session_key: keys.session_key,
            bundle: EncryptedSessionKeys::Group(GroupSessionKeys {
                sender_encrypted_session_key: keys.sender_wrapped.ciphertext,
                recipients,
            }),
        })
    }

    fn message_event(
        &self,
        local_id: &str,
        encrypted_message: String,
        bundle: &EncryptedSessionKeys,
    ) -> Result<OutboundEvent, ChatError> {
        let EncryptedSessionKeys::Group(keys) = bundle else {
            return Err(ChatError::EncryptionFailed(
                "direct key bundle in a group conversation".to_string(),
            ));
        };
        let payload = SendGroupMessage {
            id: local_id.to_string(),
            group_id: self.group_id.clone(),
            encrypted_message,
            encrypted_session_keys: keys.clone(),
        };
        Ok((SEND_MESSAGE_GROUP, serde_json::to_value(payload)?))
    }

    fn resolve_my_wrapped_key<'a>(
        &self,
        local_id: &str,
        message: &'a ReceivedMessage,
    ) -> Result<&'a str, ChatError> {
        match &message.encrypted_session_keys {
            EncryptedSessionKeys::Group(keys) => keys
                .for_recipient(local_id)
                .ok_or_else(|| ChatError::RecipientNotInFanOut(local_id.to_string())),
            EncryptedSessionKeys::Direct(_) => Err(ChatError::DecryptionFailed(
                "direct key bundle in a group conversation".to_string(),
            )),
        }
    }
}
