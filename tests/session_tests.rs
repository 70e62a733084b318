//! End-to-end conversations over the in-process relay.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use x25519_dalek::PublicKey;

use sealchat::chat::protocol::{JOIN_GROUP, JOIN_PRIVATE, RECEIVE_MESSAGE, SEND_MESSAGE_GROUP, SEND_MESSAGE_PRIVATE};
use sealchat::chat::{
    ChatError, ChatSession, Frame, IncomingMessage, MemoryRelay, SessionConfig, SessionPhase,
    SessionServices,
};
use sealchat::crypto::{
    decode_transport, encode_transport, ChaChaSessionCipher, DirectKeys, FanOutNegotiator,
    GroupKeys, NegotiationError, SealedBoxCipher, SessionKeyNegotiator,
};
use sealchat::{KeyPairManager, StaticDirectory};

// ============================================================================
// Harness
// ============================================================================

struct Net {
    relay: MemoryRelay,
    directory: Arc<StaticDirectory>,
}

impl Net {
    fn new() -> Self {
        Self {
            relay: MemoryRelay::new(),
            directory: Arc::new(StaticDirectory::new()),
        }
    }

    /// A device for `id` with a stored, published key pair.
    fn device(&self, id: &str) -> KeyPairManager {
        let keys = KeyPairManager::in_memory();
        let key_pair = keys.ensure(id).unwrap();
        self.directory.publish(id, key_pair.public_key());
        keys
    }

    fn services(&self, keys: KeyPairManager) -> SessionServices {
        SessionServices::new(keys, self.directory.clone(), Arc::new(self.relay.transport()))
    }

    fn direct(&self, local: &str, friend: &str, keys: KeyPairManager) -> ChatSession<sealchat::chat::Direct> {
        ChatSession::direct(local, friend, self.services(keys), SessionConfig::default())
    }

    fn group(&self, local: &str, keys: KeyPairManager) -> ChatSession<sealchat::chat::Group> {
        ChatSession::group(
            local,
            "g1",
            vec!["alice".to_string(), "bob".to_string(), "carol".to_string()],
            self.services(keys),
            SessionConfig::default(),
        )
    }

    async fn wait_for_joins(&self, event: &str, count: usize) {
        wait_until(|| self.relay.received_events(event).len() >= count).await;
    }
}

type Inbox = mpsc::UnboundedReceiver<IncomingMessage>;

fn inbox() -> (impl FnMut(IncomingMessage) + Send + 'static, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |msg| {
        let _ = tx.send(msg);
    }, rx)
}

async fn next_message(rx: &mut Inbox) -> IncomingMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("inbox closed")
}

async fn assert_silent(rx: &mut Inbox) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err(), "unexpected message delivered");
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Negotiator double that counts invocations.
struct CountingNegotiator {
    inner: FanOutNegotiator,
    calls: AtomicUsize,
}

impl CountingNegotiator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: FanOutNegotiator::new(
                Arc::new(SealedBoxCipher::new()),
                Arc::new(ChaChaSessionCipher::new()),
            ),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SessionKeyNegotiator for CountingNegotiator {
    fn create_for_direct(
        &self,
        local_id: &str,
        local_public: &PublicKey,
        peer_id: &str,
        peer_public: &PublicKey,
    ) -> Result<DirectKeys, NegotiationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .create_for_direct(local_id, local_public, peer_id, peer_public)
    }

    fn create_for_group(
        &self,
        local_id: &str,
        local_public: &PublicKey,
        members: &[(String, PublicKey)],
    ) -> Result<GroupKeys, NegotiationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.create_for_group(local_id, local_public, members)
    }
}

// ============================================================================
// Direct conversations
// ============================================================================

#[tokio::test]
async fn test_direct_round_trip() {
    let net = Net::new();
    let alice = net.direct("alice", "bob", net.device("alice"));
    let bob = net.direct("bob", "alice", net.device("bob"));

    let (alice_cb, mut alice_inbox) = inbox();
    let (bob_cb, mut bob_inbox) = inbox();
    alice.join(alice_cb).await.unwrap();
    bob.join(bob_cb).await.unwrap();
    net.wait_for_joins(JOIN_PRIVATE, 2).await;

    alice.send_message("hola bob 👋 ¿qué tal?").await.unwrap();
    let received = next_message(&mut bob_inbox).await;
    assert_eq!(received.sender_id, "alice");
    assert_eq!(received.text, "hola bob 👋 ¿qué tal?");

    bob.send_message("").await.unwrap();
    let reply = next_message(&mut alice_inbox).await;
    assert_eq!(reply.sender_id, "bob");
    assert_eq!(reply.text, "");

    assert_eq!(alice.phase(), SessionPhase::Active);
    assert_eq!(bob.phase(), SessionPhase::Active);
}

#[tokio::test]
async fn test_presence_marks_friend_online() {
    let net = Net::new();
    let alice = net.direct("alice", "bob", net.device("alice"));
    let bob = net.direct("bob", "alice", net.device("bob"));

    alice.join(|_| {}).await.unwrap();
    net.wait_for_joins(JOIN_PRIVATE, 1).await;
    bob.join(|_| {}).await.unwrap();

    // Alice answers the relay's probe, which tells Bob she is online.
    wait_until(|| bob.is_friend_online()).await;
}

#[tokio::test]
async fn test_messages_delivered_in_order() {
    let net = Net::new();
    let alice = net.direct("alice", "bob", net.device("alice"));
    let bob = net.direct("bob", "alice", net.device("bob"));

    let (bob_cb, mut bob_inbox) = inbox();
    alice.join(|_| {}).await.unwrap();
    bob.join(bob_cb).await.unwrap();
    net.wait_for_joins(JOIN_PRIVATE, 2).await;

    for i in 0..20 {
        alice.send_message(&format!("message {}", i)).await.unwrap();
    }
    for i in 0..20 {
        assert_eq!(next_message(&mut bob_inbox).await.text, format!("message {}", i));
    }
}

#[tokio::test]
async fn test_missing_private_key_drops_message() {
    let net = Net::new();
    let alice = net.direct("alice", "bob", net.device("alice"));

    // Bob's key is published, but this device never stored it.
    let bob_keys = KeyPairManager::in_memory();
    let bob_pair = bob_keys.generate();
    net.directory.publish("bob", bob_pair.public_key());
    let bob = net.direct("bob", "alice", bob_keys.clone());

    let (bob_cb, mut bob_inbox) = inbox();
    alice.join(|_| {}).await.unwrap();
    bob.join(bob_cb).await.unwrap();
    net.wait_for_joins(JOIN_PRIVATE, 2).await;

    alice.send_message("lost").await.unwrap();
    assert_silent(&mut bob_inbox).await;
    assert_eq!(bob.phase(), SessionPhase::Joined);

    // The session keeps processing once the key shows up.
    bob_keys.store("bob", &bob_pair).unwrap();
    alice.send_message("found").await.unwrap();
    assert_eq!(next_message(&mut bob_inbox).await.text, "found");
}

#[tokio::test]
async fn test_tampered_ciphertext_never_delivered() {
    let net = Net::new();
    let alice = net.direct("alice", "bob", net.device("alice"));
    let bob = net.direct("bob", "alice", net.device("bob"));

    let (bob_cb, mut bob_inbox) = inbox();
    alice.join(|_| {}).await.unwrap();
    bob.join(bob_cb).await.unwrap();
    net.wait_for_joins(JOIN_PRIVATE, 2).await;

    alice.send_message("original").await.unwrap();
    assert_eq!(next_message(&mut bob_inbox).await.text, "original");

    let sent = net.relay.received_events(SEND_MESSAGE_PRIVATE).remove(0).payload;
    let ciphertext = decode_transport(sent["encryptedMessage"].as_str().unwrap()).unwrap();

    for i in 0..ciphertext.len() {
        let mut tampered = ciphertext.clone();
        tampered[i] ^= 0x01;
        net.relay.deliver(
            "bob",
            Frame::new(
                RECEIVE_MESSAGE,
                json!({
                    "senderId": "alice",
                    "encryptedMessage": encode_transport(&tampered),
                    "encryptedSessionKeys": sent["encryptedSessionKeys"].clone(),
                }),
            ),
        );
    }

    alice.send_message("after").await.unwrap();
    assert_eq!(next_message(&mut bob_inbox).await.text, "after");
    assert_silent(&mut bob_inbox).await;
}

#[tokio::test]
async fn test_negotiation_happens_once() {
    let net = Net::new();
    let negotiator = CountingNegotiator::new();
    let services = net
        .services(net.device("alice"))
        .with_negotiator(negotiator.clone());
    let alice = Arc::new(ChatSession::direct("alice", "bob", services, SessionConfig::default()));
    net.device("bob");

    alice.join(|_| {}).await.unwrap();
    alice.send_message("one").await.unwrap();
    alice.send_message("two").await.unwrap();

    // Concurrent sends share the same critical section.
    let (a, b) = tokio::join!(alice.send_message("three"), alice.send_message("four"));
    a.unwrap();
    b.unwrap();

    assert_eq!(negotiator.calls(), 1);

    wait_until(|| net.relay.received_events(SEND_MESSAGE_PRIVATE).len() == 4).await;
    let sent = net.relay.received_events(SEND_MESSAGE_PRIVATE);
    let bundles: Vec<_> = sent
        .iter()
        .map(|f| f.payload["encryptedSessionKeys"].clone())
        .collect();
    assert!(bundles.windows(2).all(|w| w[0] == w[1]));
    assert_ne!(sent[0].payload["encryptedMessage"], sent[1].payload["encryptedMessage"]);
}

#[tokio::test]
async fn test_rejoin_renegotiates_by_default() {
    let net = Net::new();
    let negotiator = CountingNegotiator::new();
    net.device("bob");
    let alice = ChatSession::direct(
        "alice",
        "bob",
        net.services(net.device("alice")).with_negotiator(negotiator.clone()),
        SessionConfig::default(),
    );

    alice.join(|_| {}).await.unwrap();
    alice.send_message("first").await.unwrap();
    alice.close().await.unwrap();
    assert_eq!(alice.phase(), SessionPhase::Closed);
    assert!(!alice.has_session_key().await);

    alice.join(|_| {}).await.unwrap();
    assert_eq!(alice.phase(), SessionPhase::Joined);
    alice.send_message("second").await.unwrap();

    assert_eq!(negotiator.calls(), 2);
}

#[tokio::test]
async fn test_rejoin_can_keep_key() {
    let net = Net::new();
    let negotiator = CountingNegotiator::new();
    net.device("bob");
    let alice = ChatSession::direct(
        "alice",
        "bob",
        net.services(net.device("alice")).with_negotiator(negotiator.clone()),
        SessionConfig::default().keep_key_across_reconnect(),
    );

    alice.join(|_| {}).await.unwrap();
    alice.send_message("first").await.unwrap();
    alice.close().await.unwrap();

    alice.join(|_| {}).await.unwrap();
    assert_eq!(alice.phase(), SessionPhase::Active);
    alice.send_message("second").await.unwrap();

    assert_eq!(negotiator.calls(), 1);
}

#[tokio::test]
async fn test_connect_refused_is_surfaced() {
    let net = Net::new();
    net.relay.refuse_connections("maintenance");
    let alice = net.direct("alice", "bob", net.device("alice"));

    let err = alice.join(|_| {}).await.unwrap_err();
    assert!(matches!(err, ChatError::ConnectionError(ref reason) if reason == "maintenance"));
    assert_eq!(alice.phase(), SessionPhase::Disconnected);

    // Sending without a connection does nothing.
    alice.send_message("ignored").await.unwrap();
    assert!(net.relay.received_frames().is_empty());

    net.relay.accept_connections();
    alice.join(|_| {}).await.unwrap();
    assert_eq!(alice.phase(), SessionPhase::Joined);
}

#[tokio::test]
async fn test_directory_failure_is_surfaced() {
    let net = Net::new();
    net.device("bob");
    let alice = net.direct("alice", "bob", net.device("alice"));
    alice.join(|_| {}).await.unwrap();

    net.directory.set_available(false);
    let err = alice.send_message("hello").await.unwrap_err();
    assert!(matches!(err, ChatError::DirectoryLookupFailed { ref participant, .. } if participant == "bob"));
    assert!(!alice.has_session_key().await);

    net.directory.set_available(true);
    alice.send_message("hello").await.unwrap();
    wait_until(|| net.relay.received_events(SEND_MESSAGE_PRIVATE).len() == 1).await;
}

#[tokio::test]
async fn test_link_drop_is_reported() {
    let net = Net::new();
    net.device("bob");
    let alice = net.direct("alice", "bob", net.device("alice"));
    alice.join(|_| {}).await.unwrap();

    net.relay.disconnect_all();
    wait_until(|| alice.phase() == SessionPhase::Disconnected).await;

    let err = alice.send_message("hello").await.unwrap_err();
    assert!(matches!(err, ChatError::ConnectionError(_)));

    // A fresh join reconnects.
    alice.join(|_| {}).await.unwrap();
    assert_eq!(alice.phase(), SessionPhase::Joined);
}

#[tokio::test]
async fn test_rejoin_after_link_drop_renegotiates() {
    let net = Net::new();
    let negotiator = CountingNegotiator::new();
    let bob_keys = net.device("bob");
    let alice = ChatSession::direct(
        "alice",
        "bob",
        net.services(net.device("alice")).with_negotiator(negotiator.clone()),
        SessionConfig::default(),
    );

    alice.join(|_| {}).await.unwrap();
    alice.send_message("before").await.unwrap();
    assert_eq!(alice.phase(), SessionPhase::Active);

    net.relay.disconnect_all();
    wait_until(|| alice.phase() == SessionPhase::Disconnected).await;

    alice.join(|_| {}).await.unwrap();
    assert_eq!(alice.phase(), SessionPhase::Joined);
    assert!(!alice.has_session_key().await);

    let bob = net.direct("bob", "alice", bob_keys);
    let (bob_cb, mut bob_inbox) = inbox();
    bob.join(bob_cb).await.unwrap();
    net.wait_for_joins(JOIN_PRIVATE, 3).await;

    alice.send_message("after").await.unwrap();
    assert_eq!(negotiator.calls(), 2);
    assert_eq!(alice.phase(), SessionPhase::Active);
    assert_eq!(next_message(&mut bob_inbox).await.text, "after");

    let sent = net.relay.received_events(SEND_MESSAGE_PRIVATE);
    assert_eq!(sent.len(), 2);
    assert_ne!(
        sent[0].payload["encryptedSessionKeys"],
        sent[1].payload["encryptedSessionKeys"]
    );
}

#[tokio::test]
async fn test_rejoin_picks_up_republished_key() {
    let net = Net::new();
    net.device("bob");
    let alice = net.direct("alice", "bob", net.device("alice"));

    alice.join(|_| {}).await.unwrap();
    alice.send_message("to the old key").await.unwrap();
    alice.close().await.unwrap();

    // Bob moves to a new device and publishes a new key.
    let bob = net.direct("bob", "alice", net.device("bob"));
    let (bob_cb, mut bob_inbox) = inbox();
    bob.join(bob_cb).await.unwrap();
    alice.join(|_| {}).await.unwrap();
    net.wait_for_joins(JOIN_PRIVATE, 3).await;

    alice.send_message("to the new key").await.unwrap();
    assert_eq!(next_message(&mut bob_inbox).await.text, "to the new key");
}

#[tokio::test]
async fn test_rejoin_after_link_drop_can_keep_key() {
    let net = Net::new();
    let negotiator = CountingNegotiator::new();
    net.device("bob");
    let alice = ChatSession::direct(
        "alice",
        "bob",
        net.services(net.device("alice")).with_negotiator(negotiator.clone()),
        SessionConfig::default().keep_key_across_reconnect(),
    );

    alice.join(|_| {}).await.unwrap();
    alice.send_message("before").await.unwrap();
    net.relay.disconnect_all();
    wait_until(|| alice.phase() == SessionPhase::Disconnected).await;

    alice.join(|_| {}).await.unwrap();
    assert_eq!(alice.phase(), SessionPhase::Active);
    alice.send_message("after").await.unwrap();
    assert_eq!(negotiator.calls(), 1);
}

// ============================================================================
// Group conversations
// ============================================================================

#[tokio::test]
async fn test_group_fan_out() {
    let net = Net::new();
    let alice = net.group("alice", net.device("alice"));
    let bob = net.group("bob", net.device("bob"));
    let carol = net.group("carol", net.device("carol"));

    let (alice_cb, mut alice_inbox) = inbox();
    let (bob_cb, mut bob_inbox) = inbox();
    let (carol_cb, mut carol_inbox) = inbox();
    alice.join(alice_cb).await.unwrap();
    bob.join(bob_cb).await.unwrap();
    carol.join(carol_cb).await.unwrap();
    net.wait_for_joins(JOIN_GROUP, 3).await;

    alice.send_message("hello team").await.unwrap();

    let to_bob = next_message(&mut bob_inbox).await;
    let to_carol = next_message(&mut carol_inbox).await;
    assert_eq!(to_bob.text, "hello team");
    assert_eq!(to_carol.text, "hello team");
    assert_eq!(to_carol.sender_id, "alice");

    // The relay echoes group messages; the sender must not see its own.
    assert_silent(&mut alice_inbox).await;

    let sent = net.relay.received_events(SEND_MESSAGE_GROUP);
    let keys = &sent[0].payload["encryptedSessionKeys"];
    assert!(keys["senderEncryptedSessionKey"].is_string());
    let recipients: Vec<&str> = keys["recipients"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(recipients, vec!["bob", "carol"]);
}

#[tokio::test]
async fn test_group_member_outside_fan_out_drops() {
    let net = Net::new();
    let alice = ChatSession::group(
        "alice",
        "g1",
        vec!["alice".to_string(), "bob".to_string()],
        net.services(net.device("alice")),
        SessionConfig::default(),
    );
    let bob = net.group("bob", net.device("bob"));
    let carol = net.group("carol", net.device("carol"));

    let (bob_cb, mut bob_inbox) = inbox();
    let (carol_cb, mut carol_inbox) = inbox();
    alice.join(|_| {}).await.unwrap();
    bob.join(bob_cb).await.unwrap();
    carol.join(carol_cb).await.unwrap();
    net.wait_for_joins(JOIN_GROUP, 3).await;

    alice.send_message("bob only").await.unwrap();

    assert_eq!(next_message(&mut bob_inbox).await.text, "bob only");
    assert_silent(&mut carol_inbox).await;
}

#[tokio::test]
async fn test_group_replies_from_every_member() {
    let net = Net::new();
    let alice = net.group("alice", net.device("alice"));
    let bob = net.group("bob", net.device("bob"));
    let carol = net.group("carol", net.device("carol"));

    let (alice_cb, mut alice_inbox) = inbox();
    alice.join(alice_cb).await.unwrap();
    bob.join(|_| {}).await.unwrap();
    carol.join(|_| {}).await.unwrap();
    net.wait_for_joins(JOIN_GROUP, 3).await;

    bob.send_message("from bob").await.unwrap();
    let first = next_message(&mut alice_inbox).await;
    carol.send_message("from carol").await.unwrap();
    let second = next_message(&mut alice_inbox).await;

    assert_eq!((first.sender_id.as_str(), first.text.as_str()), ("bob", "from bob"));
    assert_eq!((second.sender_id.as_str(), second.text.as_str()), ("carol", "from carol"));
}
