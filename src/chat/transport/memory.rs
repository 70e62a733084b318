//! In-process relay.
//!
//! [`MemoryRelay`] plays the server side of the chat protocol for tests and
//! demos: it keeps rooms, answers joins with presence probes and forwards
//! encrypted messages as `receive-message`. It never looks inside them.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

use crate::chat::error::ChatError;
use crate::chat::protocol::{
    ConfirmPrivate, JoinGroup, JoinPrivate, CONFIRM_CONNECTION_GROUP, CONFIRM_CONNECTION_PRIVATE,
    I_AM_CONNECTED, JOIN_GROUP, JOIN_PRIVATE, RECEIVE_MESSAGE, SEND_MESSAGE_GROUP,
    SEND_MESSAGE_PRIVATE, WHO_IS_CONNECTED,
};
use crate::chat::transport::{Frame, Link, LinkEvent, Transport};

type ConnId = u64;

struct Client {
    tx: mpsc::UnboundedSender<LinkEvent>,
    user_id: Option<String>,
}

#[derive(Default)]
struct RelayState {
    next_id: ConnId,
    refusing: Option<String>,
    clients: HashMap<ConnId, Client>,
    rooms: HashMap<String, BTreeSet<ConnId>>,
    received: Vec<(Option<String>, Frame)>,
}

impl RelayState {
    fn push(&self, conn: ConnId, event: LinkEvent) {
        if let Some(client) = self.clients.get(&conn) {
            let _ = client.tx.send(event);
        }
    }

    fn broadcast(&self, room: &str, frame: &Frame, skip: Option<ConnId>) {
        let Some(members) = self.rooms.get(room) else {
            return;
        };
        for conn in members {
            if Some(*conn) != skip {
                self.push(*conn, LinkEvent::Frame(frame.clone()));
            }
        }
    }

    fn join(&mut self, conn: ConnId, user_id: String, room: String) {
        if let Some(client) = self.clients.get_mut(&conn) {
            client.user_id = Some(user_id);
        }
        self.rooms.entry(room.clone()).or_default().insert(conn);
        self.broadcast(&room, &Frame::bare(WHO_IS_CONNECTED), Some(conn));
    }

    fn leave(&mut self, conn: ConnId) {
        self.clients.remove(&conn);
        for members in self.rooms.values_mut() {
            members.remove(&conn);
        }
        self.rooms.retain(|_, members| !members.is_empty());
    }
}

fn direct_room(a: &str, b: &str) -> String {
    if a <= b {
        format!("direct:{}:{}", a, b)
    } else {
        format!("direct:{}:{}", b, a)
    }
}

fn group_room(group_id: &str) -> String {
    format!("group:{}", group_id)
}

/// Shared in-process relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose links connect to this relay.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            relay: self.clone(),
        }
    }

    /// Make every later connect attempt fail with `reason`.
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.lock().refusing = Some(reason.into());
    }

    pub fn accept_connections(&self) {
        self.lock().refusing = None;
    }

    /// Number of open links.
    pub fn connected(&self) -> usize {
        self.lock().clients.len()
    }

    /// Every frame clients sent so far, with the sender's joined id.
    pub fn received_frames(&self) -> Vec<(Option<String>, Frame)> {
        self.lock().received.clone()
    }

    /// Frames of one event type that clients sent.
    pub fn received_events(&self, event: &str) -> Vec<Frame> {
        self.lock()
            .received
            .iter()
            .filter(|(_, frame)| frame.event == event)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Push a frame to every link that joined as `user_id`.
    pub fn deliver(&self, user_id: &str, frame: Frame) -> usize {
        let state = self.lock();
        let targets: Vec<ConnId> = state
            .clients
            .iter()
            .filter(|(_, c)| c.user_id.as_deref() == Some(user_id))
            .map(|(id, _)| *id)
            .collect();
        for conn in &targets {
            state.push(*conn, LinkEvent::Frame(frame.clone()));
        }
        targets.len()
    }

    /// Drop every link as if the server went away.
    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        for client in state.clients.values() {
            let _ = client.tx.send(LinkEvent::Disconnected);
        }
        state.clients.clear();
        state.rooms.clear();
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn connect(&self) -> (ConnId, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let conn = state.next_id;
        state.next_id += 1;

        match state.refusing.clone() {
            Some(reason) => {
                let _ = tx.send(LinkEvent::ConnectError(reason));
            }
            None => {
                let _ = tx.send(LinkEvent::Connected);
                state.clients.insert(conn, Client { tx, user_id: None });
            }
        }
        (conn, rx)
    }

    fn handle(&self, conn: ConnId, frame: Frame) -> Result<(), ChatError> {
        let mut state = self.lock();
        if !state.clients.contains_key(&conn) {
            return Err(ChatError::TransportError("Link is not connected".to_string()));
        }
        let sender = state.clients.get(&conn).and_then(|c| c.user_id.clone());
        state.received.push((sender, frame.clone()));

        match frame.event.as_str() {
            JOIN_PRIVATE => {
                let join: JoinPrivate = serde_json::from_value(frame.payload)?;
                let room = direct_room(&join.id, &join.friend_id);
                state.join(conn, join.id, room);
            }
            JOIN_GROUP => {
                let join: JoinGroup = serde_json::from_value(frame.payload)?;
                state.join(conn, join.id, group_room(&join.group_id));
            }
            CONFIRM_CONNECTION_PRIVATE => {
                let confirm: ConfirmPrivate = serde_json::from_value(frame.payload)?;
                let room = direct_room(&confirm.id, &confirm.friend_id);
                state.broadcast(&room, &Frame::bare(I_AM_CONNECTED), Some(conn));
            }
            CONFIRM_CONNECTION_GROUP => {}
            SEND_MESSAGE_PRIVATE => {
                let payload = &frame.payload;
                let (Some(id), Some(friend_id)) = (payload["id"].as_str(), payload["friendId"].as_str())
                else {
                    return Err(ChatError::SerializationFailed(
                        "send-message.private without id/friendId".to_string(),
                    ));
                };
                let outgoing = forwarded(id, payload);
                state.broadcast(&direct_room(id, friend_id), &outgoing, Some(conn));
            }
            SEND_MESSAGE_GROUP => {
                let payload = &frame.payload;
                let (Some(id), Some(group_id)) = (payload["id"].as_str(), payload["groupId"].as_str())
                else {
                    return Err(ChatError::SerializationFailed(
                        "send-message.group without id/groupId".to_string(),
                    ));
                };
                let outgoing = forwarded(id, payload);
                state.broadcast(&group_room(group_id), &outgoing, None);
            }
            other => debug!(event = other, "relay ignoring event"),
        }
        Ok(())
    }
}

fn forwarded(sender_id: &str, payload: &serde_json::Value) -> Frame {
    Frame::new(
        RECEIVE_MESSAGE,
        json!({
            "senderId": sender_id,
            "encryptedMessage": payload["encryptedMessage"],
            "encryptedSessionKeys": payload["encryptedSessionKeys"],
        }),
    )
}

/// Transport backed by a [`MemoryRelay`].
#[derive(Clone)]
pub struct MemoryTransport {
    relay: MemoryRelay,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<Box<dyn Link>, ChatError> {
        let (conn, rx) = self.relay.connect();
        Ok(Box::new(MemoryLink {
            conn,
            relay: self.relay.clone(),
            rx: AsyncMutex::new(rx),
        }))
    }
}

struct MemoryLink {
    conn: ConnId,
    relay: MemoryRelay,
    rx: AsyncMutex<mpsc::UnboundedReceiver<LinkEvent>>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, frame: Frame) -> Result<(), ChatError> {
        let event = frame.event.clone();
        self.relay.handle(self.conn, frame).map_err(|e| {
            warn!(event = %event, error = %e, "relay rejected frame");
            e
        })
    }

    async fn recv(&self) -> Option<LinkEvent> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), ChatError> {
        self.relay.lock().leave(self.conn);
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.relay.lock().leave(self.conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_joined(relay: &MemoryRelay, id: &str, friend: &str) -> Box<dyn Link> {
        let link = relay.transport().open().await.unwrap();
        assert_eq!(link.recv().await, Some(LinkEvent::Connected));
        link.send(Frame::new(JOIN_PRIVATE, json!({"id": id, "friendId": friend})))
            .await
            .unwrap();
        link
    }

    #[tokio::test]
    async fn test_presence_probe_and_confirmation() {
        let relay = MemoryRelay::new();
        let alice = open_joined(&relay, "alice", "bob").await;
        let bob = open_joined(&relay, "bob", "alice").await;

        // Alice was already in the room, so Bob's join probes her.
        assert_eq!(
            alice.recv().await,
            Some(LinkEvent::Frame(Frame::bare(WHO_IS_CONNECTED)))
        );
        alice
            .send(Frame::new(
                CONFIRM_CONNECTION_PRIVATE,
                json!({"id": "alice", "friendId": "bob"}),
            ))
            .await
            .unwrap();
        assert_eq!(
            bob.recv().await,
            Some(LinkEvent::Frame(Frame::bare(I_AM_CONNECTED)))
        );
        assert_eq!(relay.connected(), 2);
    }

    #[tokio::test]
    async fn test_direct_message_not_echoed() {
        let relay = MemoryRelay::new();
        let alice = open_joined(&relay, "alice", "bob").await;
        let bob = open_joined(&relay, "bob", "alice").await;
        let _probe = alice.recv().await;

        alice
            .send(Frame::new(
                SEND_MESSAGE_PRIVATE,
                json!({
                    "id": "alice",
                    "friendId": "bob",
                    "encryptedMessage": "m",
                    "encryptedSessionKeys": {"senderEncryptedSessionKey": "s", "recipientEncryptedSessionKey": "r"}
                }),
            ))
            .await
            .unwrap();

        match bob.recv().await {
            Some(LinkEvent::Frame(frame)) => {
                assert_eq!(frame.event, RECEIVE_MESSAGE);
                assert_eq!(frame.payload["senderId"], "alice");
                assert_eq!(frame.payload["encryptedMessage"], "m");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(relay.received_events(SEND_MESSAGE_PRIVATE).len(), 1);
    }

    #[tokio::test]
    async fn test_group_message_echoed_to_sender() {
        let relay = MemoryRelay::new();
        let link = relay.transport().open().await.unwrap();
        assert_eq!(link.recv().await, Some(LinkEvent::Connected));
        link.send(Frame::new(JOIN_GROUP, json!({"id": "alice", "groupId": "g1"})))
            .await
            .unwrap();
        link.send(Frame::new(
            SEND_MESSAGE_GROUP,
            json!({"id": "alice", "groupId": "g1", "encryptedMessage": "m", "encryptedSessionKeys": {}}),
        ))
        .await
        .unwrap();

        match link.recv().await {
            Some(LinkEvent::Frame(frame)) => assert_eq!(frame.payload["senderId"], "alice"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let relay = MemoryRelay::new();
        relay.refuse_connections("server down");

        let link = relay.transport().open().await.unwrap();
        assert_eq!(
            link.recv().await,
            Some(LinkEvent::ConnectError("server down".to_string()))
        );
        assert!(link.send(Frame::bare(JOIN_PRIVATE)).await.is_err());
        assert_eq!(relay.connected(), 0);
    }

    #[tokio::test]
    async fn test_dropped_link_leaves_rooms() {
        let relay = MemoryRelay::new();
        let alice = open_joined(&relay, "alice", "bob").await;
        assert_eq!(relay.connected(), 1);
        drop(alice);
        assert_eq!(relay.connected(), 0);
        assert_eq!(relay.deliver("alice", Frame::bare(WHO_IS_CONNECTED)), 0);
    }
}
