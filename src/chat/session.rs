//! Chat session state machine.
//!
//! A [`ChatSession`] drives one conversation: it connects a
//! [`RealtimeChannel`], announces itself, lazily negotiates one outgoing
//! session key and decrypts inbound messages on a single task.
//!
//! ```text
//! Disconnected -> Connecting -> Joined -> Active -> Closed
//!       ^             |                               |
//!       +-- failed ---+            join again --------+
//! ```
//!
//! A dropped link moves the session back to `Disconnected`; joining again
//! opens a new channel.
//!
//! Failures while handling one inbound message drop that message only.
//! Failures while sending are returned to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use crate::chat::channel::{EventStream, RealtimeChannel};
use crate::chat::config::SessionConfig;
use crate::chat::error::ChatError;
use crate::chat::protocol::{ReceivedMessage, I_AM_CONNECTED, RECEIVE_MESSAGE, WHO_IS_CONNECTED};
use crate::chat::recipients::{Direct, Group, OutgoingKeys, Recipients};
use crate::chat::transport::Transport;
use crate::crypto::{
    decode_transport, AsymmetricCipher, ChaChaSessionCipher, FanOutNegotiator, SealedBoxCipher,
    SessionKey, SessionKeyCipher, SessionKeyNegotiator,
};
use crate::directory::{PublicKeyDirectory, SessionCachedDirectory};
use crate::keystore::KeyPairManager;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Joined,
    /// An outgoing session key is established.
    Active,
    Closed,
}

/// Outgoing key material. Set once per session lifetime.
#[derive(Debug, Clone)]
pub enum KeyState {
    Uninitialized,
    Established(OutgoingKeys),
}

impl KeyState {
    pub fn is_established(&self) -> bool {
        matches!(self, KeyState::Established(_))
    }
}

/// A decrypted inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub sender_id: String,
    pub text: String,
}

/// Collaborators a session is built from.
#[derive(Clone)]
pub struct SessionServices {
    pub keys: KeyPairManager,
    pub directory: Arc<dyn PublicKeyDirectory>,
    pub negotiator: Arc<dyn SessionKeyNegotiator>,
    pub cipher: Arc<dyn SessionKeyCipher>,
    pub asymmetric: Arc<dyn AsymmetricCipher>,
    pub transport: Arc<dyn Transport>,
}

impl SessionServices {
    /// Services with the default ciphers and fan-out negotiator.
    pub fn new(
        keys: KeyPairManager,
        directory: Arc<dyn PublicKeyDirectory>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let asymmetric: Arc<dyn AsymmetricCipher> = Arc::new(SealedBoxCipher::new());
        let cipher: Arc<dyn SessionKeyCipher> = Arc::new(ChaChaSessionCipher::new());
        let negotiator = Arc::new(FanOutNegotiator::new(asymmetric.clone(), cipher.clone()));

        Self {
            keys,
            directory,
            negotiator,
            cipher,
            asymmetric,
            transport,
        }
    }

    pub fn with_negotiator(mut self, negotiator: Arc<dyn SessionKeyNegotiator>) -> Self {
        self.negotiator = negotiator;
        self
    }
}

/// State shared with the inbound task.
struct Shared<R> {
    local_id: String,
    recipients: R,
    services: SessionServices,
    phase: Mutex<SessionPhase>,
    friend_online: AtomicBool,
    inbound_keys: Mutex<HashMap<(String, String), SessionKey>>,
}

impl<R: Recipients> Shared<R> {
    fn phase(&self) -> SessionPhase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: SessionPhase) {
        *lock(&self.phase) = phase;
    }

    /// Decrypt one `receive-message` payload. `Ok(None)` means our own echo.
    fn open(&self, payload: serde_json::Value) -> Result<Option<IncomingMessage>, ChatError> {
        let message: ReceivedMessage = serde_json::from_value(payload)?;
        if R::DISCARDS_OWN_ECHO && message.sender_id == self.local_id {
            return Ok(None);
        }

        let secret = self
            .services
            .keys
            .find_private_key(&self.local_id)?
            .ok_or_else(|| ChatError::PrivateKeyMissing(self.local_id.clone()))?;
        let wrapped = self.recipients.resolve_my_wrapped_key(&self.local_id, &message)?;
        let key = self.session_key_for(&message.sender_id, wrapped, &secret)?;
        let text = self.services.cipher.decrypt_text(&key, &message.encrypted_message)?;

        Ok(Some(IncomingMessage {
            sender_id: message.sender_id,
            text,
        }))
    }

    fn session_key_for(
        &self,
        sender_id: &str,
        wrapped: &str,
        secret: &StaticSecret,
    ) -> Result<SessionKey, ChatError> {
        let cache_key = (sender_id.to_string(), wrapped.to_string());
        if let Some(key) = lock(&self.inbound_keys).get(&cache_key) {
            return Ok(key.clone());
        }

        let sealed = decode_transport(wrapped)?;
        let raw = Zeroizing::new(self.services.asymmetric.decrypt(secret, &sealed)?);
        let key = SessionKey::from_slice(&raw)?;
        debug!(sender = sender_id, "unwrapped inbound session key");

        lock(&self.inbound_keys).insert(cache_key, key.clone());
        Ok(key)
    }

    async fn answer_probe(&self, channel: &Weak<RealtimeChannel>) {
        let Some(channel) = channel.upgrade() else {
            return;
        };
        let reply = match self.recipients.presence_reply(&self.local_id) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(kind = e.kind(), "could not build presence reply");
                return;
            }
        };
        if let Err(e) = channel.emit(reply.0, &reply.1).await {
            debug!(kind = e.kind(), "presence reply not sent");
        }
    }

    /// A join that did not complete. A concurrent `close` wins.
    fn join_failed(&self) {
        let mut phase = lock(&self.phase);
        if *phase != SessionPhase::Closed {
            *phase = SessionPhase::Disconnected;
        }
    }

    fn link_ended(&self) {
        self.friend_online.store(false, Ordering::SeqCst);
        let mut phase = lock(&self.phase);
        if *phase != SessionPhase::Closed {
            info!(user = %self.local_id, "conversation link dropped");
            *phase = SessionPhase::Disconnected;
        }
    }
}

async fn run_inbound<R, F>(
    shared: Arc<Shared<R>>,
    channel: Weak<RealtimeChannel>,
    mut events: EventStream,
    mut on_message: F,
) where
    R: Recipients,
    F: FnMut(IncomingMessage) + Send + 'static,
{
    while let Some(frame) = events.next().await {
        match frame.event.as_str() {
            WHO_IS_CONNECTED => shared.answer_probe(&channel).await,
            I_AM_CONNECTED => {
                debug!(user = %shared.local_id, "peer is online");
                shared.friend_online.store(true, Ordering::SeqCst);
            }
            RECEIVE_MESSAGE => match shared.open(frame.payload) {
                Ok(Some(message)) => on_message(message),
                Ok(None) => debug!("own echo discarded"),
                Err(e) => warn!(kind = e.kind(), "dropping inbound message"),
            },
            other => debug!(event = other, "unhandled event"),
        }
    }
    shared.link_ended();
}

/// One conversation, direct or group.
pub struct ChatSession<R: Recipients> {
    shared: Arc<Shared<R>>,
    /// Rebuilt on every join.
    directory: Mutex<Arc<SessionCachedDirectory>>,
    config: SessionConfig,
    channel: Mutex<Option<Arc<RealtimeChannel>>>,
    inbound: Mutex<Option<JoinHandle<()>>>,
    outgoing: tokio::sync::Mutex<KeyState>,
    joining: tokio::sync::Mutex<()>,
}

impl ChatSession<Direct> {
    /// A one-to-one conversation with `friend_id`.
    pub fn direct(
        local_id: impl Into<String>,
        friend_id: impl Into<String>,
        services: SessionServices,
        config: SessionConfig,
    ) -> Self {
        Self::new(local_id, Direct::new(friend_id), services, config)
    }

    /// Whether the relay reported the friend online since the last join.
    pub fn is_friend_online(&self) -> bool {
        self.shared.friend_online.load(Ordering::SeqCst)
    }
}

impl ChatSession<Group> {
    /// A conversation in `group_id` among `participant_ids`.
    pub fn group(
        local_id: impl Into<String>,
        group_id: impl Into<String>,
        participant_ids: Vec<String>,
        services: SessionServices,
        config: SessionConfig,
    ) -> Self {
        Self::new(local_id, Group::new(group_id, participant_ids), services, config)
    }
}

impl<R: Recipients> ChatSession<R> {
    pub fn new(
        local_id: impl Into<String>,
        recipients: R,
        services: SessionServices,
        config: SessionConfig,
    ) -> Self {
        let directory = Arc::new(SessionCachedDirectory::new(services.directory.clone()));
        Self {
            shared: Arc::new(Shared {
                local_id: local_id.into(),
                recipients,
                services,
                phase: Mutex::new(SessionPhase::Disconnected),
                friend_online: AtomicBool::new(false),
                inbound_keys: Mutex::new(HashMap::new()),
            }),
            directory: Mutex::new(directory),
            config,
            channel: Mutex::new(None),
            inbound: Mutex::new(None),
            outgoing: tokio::sync::Mutex::new(KeyState::Uninitialized),
            joining: tokio::sync::Mutex::new(()),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    pub fn recipients(&self) -> &R {
        &self.shared.recipients
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    /// Whether an outgoing session key has been negotiated.
    pub async fn has_session_key(&self) -> bool {
        self.outgoing.lock().await.is_established()
    }

    /// Connect, subscribe and announce the conversation.
    ///
    /// Resolves once the channel is connected; it does not wait for key
    /// negotiation. Concurrent calls are serialized: a caller arriving while
    /// another join is in flight waits for it. Calling it on a joined session
    /// is a no-op and keeps the existing callback.
    ///
    /// Joining after the link dropped or after `close` starts a new channel.
    /// With `renegotiate_on_reconnect` set, the next send then negotiates a
    /// new session key.
    pub async fn join<F>(&self, on_message: F) -> Result<(), ChatError>
    where
        F: FnMut(IncomingMessage) + Send + 'static,
    {
        let _joining = self.joining.lock().await;
        {
            let mut phase = lock(&self.shared.phase);
            match *phase {
                SessionPhase::Joined | SessionPhase::Active => {
                    debug!(user = %self.shared.local_id, "already joined");
                    return Ok(());
                }
                SessionPhase::Connecting | SessionPhase::Disconnected | SessionPhase::Closed => {
                    *phase = SessionPhase::Connecting;
                }
            }
        }
        info!(user = %self.shared.local_id, "joining conversation");
        self.release_previous_channel().await;

        let connected =
            RealtimeChannel::connect(&*self.shared.services.transport, &self.config).await;
        let channel = match connected {
            Ok(channel) => Arc::new(channel),
            Err(e) => {
                warn!(user = %self.shared.local_id, kind = e.kind(), "join failed");
                self.shared.join_failed();
                return Err(e);
            }
        };

        let events = channel.on_any(&[WHO_IS_CONNECTED, I_AM_CONNECTED, RECEIVE_MESSAGE]);
        let task = tokio::spawn(run_inbound(
            self.shared.clone(),
            Arc::downgrade(&channel),
            events,
            on_message,
        ));

        let announced = match self.shared.recipients.join_event(&self.shared.local_id) {
            Ok((event, payload)) => channel.emit(event, &payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = announced {
            task.abort();
            let _ = channel.close().await;
            self.shared.join_failed();
            return Err(e);
        }

        let established = self.has_session_key().await;
        let task = {
            let mut phase = lock(&self.shared.phase);
            if *phase == SessionPhase::Closed {
                Some(task)
            } else {
                *lock(&self.channel) = Some(channel.clone());
                *lock(&self.inbound) = Some(task);
                *phase = if established {
                    SessionPhase::Active
                } else {
                    SessionPhase::Joined
                };
                None
            }
        };

        // Closed while connecting.
        if let Some(task) = task {
            info!(user = %self.shared.local_id, "session closed during join");
            task.abort();
            let _ = channel.close().await;
            return Err(ChatError::Closed);
        }
        Ok(())
    }

    /// Drop what an earlier join left behind before opening a new channel.
    async fn release_previous_channel(&self) {
        let channel = lock(&self.channel).take();
        let inbound = lock(&self.inbound).take();
        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
        if let Some(task) = inbound {
            task.abort();
        }

        if self.config.renegotiate_on_reconnect {
            let mut state = self.outgoing.lock().await;
            if state.is_established() {
                debug!(user = %self.shared.local_id, "discarding session key of previous channel");
            }
            *state = KeyState::Uninitialized;
        }
        *lock(&self.directory) =
            Arc::new(SessionCachedDirectory::new(self.shared.services.directory.clone()));
    }

    /// Encrypt and send one message.
    ///
    /// A session that never joined ignores the call. The first send negotiates
    /// the session key; later sends reuse it.
    pub async fn send_message(&self, text: &str) -> Result<(), ChatError> {
        let Some(channel) = lock(&self.channel).clone() else {
            debug!(user = %self.shared.local_id, "not joined, message not sent");
            return Ok(());
        };
        if !channel.is_connected() {
            return Err(ChatError::ConnectionError("Link dropped".to_string()));
        }

        let keys = self.outgoing_keys().await?;
        let encrypted = self.shared.services.cipher.encrypt_text(&keys.session_key, text)?;
        let (event, payload) =
            self.shared
                .recipients
                .message_event(&self.shared.local_id, encrypted, &keys.bundle)?;
        channel.emit(event, &payload).await
    }

    /// Negotiate-if-absent, as one critical section.
    async fn outgoing_keys(&self) -> Result<OutgoingKeys, ChatError> {
        let mut state = self.outgoing.lock().await;
        if let KeyState::Established(keys) = &*state {
            return Ok(keys.clone());
        }

        let local_id = &self.shared.local_id;
        let key_pair = self
            .shared
            .services
            .keys
            .find_key_pair(local_id)?
            .ok_or_else(|| ChatError::PrivateKeyMissing(local_id.clone()))?;

        let directory = lock(&self.directory).clone();
        let keys = self
            .shared
            .recipients
            .wrap(
                local_id,
                key_pair.public_key(),
                &*directory,
                &*self.shared.services.negotiator,
            )
            .await?;
        info!(user = %local_id, "negotiated session key");

        *state = KeyState::Established(keys.clone());
        let mut phase = lock(&self.shared.phase);
        if *phase == SessionPhase::Joined {
            *phase = SessionPhase::Active;
        }
        Ok(keys)
    }

    /// Leave the conversation and release the channel. Idempotent.
    pub async fn close(&self) -> Result<(), ChatError> {
        self.shared.set_phase(SessionPhase::Closed);
        self.shared.friend_online.store(false, Ordering::SeqCst);

        let channel = lock(&self.channel).take();
        let inbound = lock(&self.inbound).take();

        let result = match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };
        if let Some(task) = inbound {
            let _ = task.await;
        }

        if self.config.renegotiate_on_reconnect {
            *self.outgoing.lock().await = KeyState::Uninitialized;
        }
        info!(user = %self.shared.local_id, "left conversation");
        result
    }
}

impl<R: Recipients> Drop for ChatSession<R> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.inbound).take() {
            task.abort();
        }
    }
}
