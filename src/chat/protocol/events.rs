//! Event names and client-originated payloads.

use serde::{Deserialize, Serialize};

use super::envelope::{DirectSessionKeys, GroupSessionKeys};

/// Client announces a direct conversation.
pub const JOIN_PRIVATE: &str = "join.private";
/// Client announces a group conversation.
pub const JOIN_GROUP: &str = "join.group";
/// Relay asks connected clients to confirm presence.
pub const WHO_IS_CONNECTED: &str = "who-is-connected";
/// Presence confirmation for a direct conversation.
pub const CONFIRM_CONNECTION_PRIVATE: &str = "confirm-connection.private";
/// Presence confirmation for a group conversation.
pub const CONFIRM_CONNECTION_GROUP: &str = "confirm-connection.group";
/// Relay tells a direct participant that the peer is online.
pub const I_AM_CONNECTED: &str = "i-am-connected";
/// Encrypted direct message from a client.
pub const SEND_MESSAGE_PRIVATE: &str = "send-message.private";
/// Encrypted group message from a client.
pub const SEND_MESSAGE_GROUP: &str = "send-message.group";
/// Encrypted message delivered by the relay.
pub const RECEIVE_MESSAGE: &str = "receive-message";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPrivate {
    pub id: String,
    pub friend_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinGroup {
    pub id: String,
    pub group_id: String,
}

/// Presence confirmation carries the full conversation identifier.
pub type ConfirmPrivate = JoinPrivate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmGroup {
    pub id: String,
    pub group_id: String,
    pub participants_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPrivateMessage {
    pub id: String,
    pub friend_id: String,
    pub encrypted_message: String,
    pub encrypted_session_keys: DirectSessionKeys,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendGroupMessage {
    pub id: String,
    pub group_id: String,
    pub encrypted_message: String,
    pub encrypted_session_keys: GroupSessionKeys,
}
