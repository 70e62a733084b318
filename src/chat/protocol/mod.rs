//! Wire contract between chat clients and the relay.
//!
//! - **Event names** shared by clients and the relay
//! - **Payloads** for presence, join and message events (camelCase JSON)
//! - **Wrapped key bundles** carried next to every encrypted message

mod envelope;
mod events;

pub use envelope::{
    DirectSessionKeys, EncryptedSessionKeys, GroupRecipientKey, GroupSessionKeys, ReceivedMessage,
};
pub use events::{
    ConfirmGroup, ConfirmPrivate, JoinGroup, JoinPrivate, SendGroupMessage, SendPrivateMessage,
    CONFIRM_CONNECTION_GROUP, CONFIRM_CONNECTION_PRIVATE, I_AM_CONNECTED, JOIN_GROUP, JOIN_PRIVATE,
    RECEIVE_MESSAGE, SEND_MESSAGE_GROUP, SEND_MESSAGE_PRIVATE, WHO_IS_CONNECTED,
};
