//! Wrapped session keys and the inbound message envelope.

use serde::{Deserialize, Serialize};

/// Key bundle of a direct message: one copy per side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectSessionKeys {
    pub sender_encrypted_session_key: String,
    pub recipient_encrypted_session_key: String,
}

/// One member's copy inside a group bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecipientKey {
    pub id: String,
    pub encrypted_session_key: String,
}

/// Key bundle of a group message: the sender's copy plus one per member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSessionKeys {
    pub sender_encrypted_session_key: String,
    pub recipients: Vec<GroupRecipientKey>,
}

impl GroupSessionKeys {
    /// The copy addressed to `participant_id`, if the sender included one.
    pub fn for_recipient(&self, participant_id: &str) -> Option<&str> {
        self.recipients
            .iter()
            .find(|r| r.id == participant_id)
            .map(|r| r.encrypted_session_key.as_str())
    }
}

/// Either bundle, as found on an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncryptedSessionKeys {
    Direct(DirectSessionKeys),
    Group(GroupSessionKeys),
}

impl EncryptedSessionKeys {
    pub fn sender_copy(&self) -> &str {
        match self {
            EncryptedSessionKeys::Direct(keys) => &keys.sender_encrypted_session_key,
            EncryptedSessionKeys::Group(keys) => &keys.sender_encrypted_session_key,
        }
    }
}

/// Payload of a `receive-message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub sender_id: String,
    pub encrypted_message: String,
    pub encrypted_session_keys: EncryptedSessionKeys,
}
