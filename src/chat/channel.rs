//! Realtime channel over one transport link.
//!
//! `connect` resolves on the first connect outcome the link reports. After
//! that a reader task routes inbound frames to subscriptions and a writer task
//! drains the outbound queue, so `emit` never waits on the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chat::config::SessionConfig;
use crate::chat::error::ChatError;
use crate::chat::transport::{Frame, Link, LinkEvent, Transport};

struct Subscription {
    events: Vec<String>,
    tx: mpsc::UnboundedSender<Frame>,
}

type Subscriptions = Arc<Mutex<Vec<Subscription>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Frames for one subscription, in arrival order.
///
/// Ends when the channel closes or the link drops.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

/// One connected link with named-event subscriptions.
pub struct RealtimeChannel {
    link: Arc<dyn Link>,
    subscriptions: Subscriptions,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    link_alive: Arc<AtomicBool>,
}

impl RealtimeChannel {
    /// Open a link and wait for it to connect.
    ///
    /// Fails with `ConnectionError` if the link reports a connect error,
    /// ends first, or says nothing within the configured timeout.
    pub async fn connect(
        transport: &dyn Transport,
        config: &SessionConfig,
    ) -> Result<Self, ChatError> {
        let link: Arc<dyn Link> = Arc::from(transport.open().await?);

        let outcome = tokio::time::timeout(config.connect_timeout(), wait_connected(&*link)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = link.close().await;
                return Err(e);
            }
            Err(_) => {
                let _ = link.close().await;
                return Err(ChatError::ConnectionError(format!(
                    "No connect outcome within {} ms",
                    config.connect_timeout_ms
                )));
            }
        }
        info!("channel connected");

        let subscriptions: Subscriptions = Arc::new(Mutex::new(Vec::new()));
        let link_alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(config.event_buffer.max(1));

        let reader = tokio::spawn(read_loop(
            link.clone(),
            subscriptions.clone(),
            link_alive.clone(),
        ));
        let writer = tokio::spawn(write_loop(link.clone(), rx));

        Ok(Self {
            link,
            subscriptions,
            outbound: Mutex::new(Some(tx)),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            link_alive,
        })
    }

    /// Subscribe to one event name.
    pub fn on(&self, event: &str) -> EventStream {
        self.on_any(&[event])
    }

    /// Subscribe to several event names through one ordered stream.
    pub fn on_any(&self, events: &[&str]) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.is_connected() {
            // Dropping tx ends the stream right away.
            return EventStream { rx };
        }
        lock(&self.subscriptions).push(Subscription {
            events: events.iter().map(|e| e.to_string()).collect(),
            tx,
        });
        EventStream { rx }
    }

    /// Queue a frame for sending.
    pub async fn emit<P: Serialize>(&self, event: &str, payload: &P) -> Result<(), ChatError> {
        let frame = Frame::new(event, serde_json::to_value(payload)?);
        let sender = lock(&self.outbound).clone().ok_or(ChatError::Closed)?;
        sender.send(frame).await.map_err(|_| ChatError::Closed)
    }

    /// Whether the channel is open and its link has not dropped.
    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.link_alive.load(Ordering::SeqCst)
    }

    /// Flush queued frames, stop both tasks and close the link. Idempotent.
    pub async fn close(&self) -> Result<(), ChatError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Dropping the sender lets the writer drain and finish.
        drop(lock(&self.outbound).take());
        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        lock(&self.subscriptions).clear();

        debug!("channel closed");
        self.link.close().await
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        if let Some(writer) = lock(&self.writer).take() {
            writer.abort();
        }
    }
}

async fn wait_connected(link: &dyn Link) -> Result<(), ChatError> {
    loop {
        match link.recv().await {
            Some(LinkEvent::Connected) => return Ok(()),
            Some(LinkEvent::ConnectError(reason)) => {
                warn!(reason = %reason, "connect refused");
                return Err(ChatError::ConnectionError(reason));
            }
            Some(LinkEvent::Frame(frame)) => {
                debug!(event = %frame.event, "frame before connect ignored");
            }
            Some(LinkEvent::Disconnected) | None => {
                return Err(ChatError::ConnectionError(
                    "Link closed before connecting".to_string(),
                ));
            }
        }
    }
}

async fn read_loop(link: Arc<dyn Link>, subscriptions: Subscriptions, alive: Arc<AtomicBool>) {
    loop {
        match link.recv().await {
            Some(LinkEvent::Frame(frame)) => dispatch(&subscriptions, frame),
            Some(LinkEvent::Connected) | Some(LinkEvent::ConnectError(_)) => {}
            Some(LinkEvent::Disconnected) | None => break,
        }
    }
    info!("channel link dropped");
    alive.store(false, Ordering::SeqCst);
    lock(&subscriptions).clear();
}

fn dispatch(subscriptions: &Subscriptions, frame: Frame) {
    let mut subs = lock(subscriptions);
    let mut delivered = false;
    subs.retain(|sub| {
        if !sub.events.iter().any(|e| *e == frame.event) {
            return !sub.tx.is_closed();
        }
        delivered = true;
        sub.tx.send(frame.clone()).is_ok()
    });
    if !delivered {
        debug!(event = %frame.event, "no subscriber for frame");
    }
}

async fn write_loop(link: Arc<dyn Link>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let event = frame.event.clone();
        if let Err(e) = link.send(frame).await {
            warn!(event = %event, error = %e, "failed to send frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::protocol::{JOIN_PRIVATE, RECEIVE_MESSAGE, WHO_IS_CONNECTED};
    use crate::chat::transport::MemoryRelay;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct SilentTransport;

    struct SilentLink;

    #[async_trait]
    impl Transport for SilentTransport {
        async fn open(&self) -> Result<Box<dyn Link>, ChatError> {
            Ok(Box::new(SilentLink))
        }
    }

    #[async_trait]
    impl Link for SilentLink {
        async fn send(&self, _frame: Frame) -> Result<(), ChatError> {
            Ok(())
        }

        async fn recv(&self) -> Option<LinkEvent> {
            std::future::pending().await
        }

        async fn close(&self) -> Result<(), ChatError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_connect_and_subscribe() {
        let relay = MemoryRelay::new();
        let config = SessionConfig::default();

        let alice = RealtimeChannel::connect(&relay.transport(), &config).await.unwrap();
        let mut probes = alice.on(WHO_IS_CONNECTED);
        alice
            .emit(JOIN_PRIVATE, &json!({"id": "alice", "friendId": "bob"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let bob = RealtimeChannel::connect(&relay.transport(), &config).await.unwrap();
        bob.emit(JOIN_PRIVATE, &json!({"id": "bob", "friendId": "alice"}))
            .await
            .unwrap();

        let frame = probes.next().await.unwrap();
        assert_eq!(frame.event, WHO_IS_CONNECTED);
        assert!(alice.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let relay = MemoryRelay::new();
        relay.refuse_connections("nope");

        let err = RealtimeChannel::connect(&relay.transport(), &SessionConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::ConnectionError(reason) if reason == "nope"));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let config = SessionConfig::default().with_connect_timeout(Duration::from_millis(20));
        let err = RealtimeChannel::connect(&SilentTransport, &config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ChatError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_streams() {
        let relay = MemoryRelay::new();
        let channel = RealtimeChannel::connect(&relay.transport(), &SessionConfig::default())
            .await
            .unwrap();
        let mut stream = channel.on(RECEIVE_MESSAGE);

        channel.close().await.unwrap();
        channel.close().await.unwrap();

        assert!(stream.next().await.is_none());
        assert!(!channel.is_connected());
        assert!(matches!(
            channel.emit(JOIN_PRIVATE, &json!({})).await,
            Err(ChatError::Closed)
        ));
        assert_eq!(relay.connected(), 0);
    }

    #[tokio::test]
    async fn test_link_drop_ends_streams() {
        let relay = MemoryRelay::new();
        let channel = RealtimeChannel::connect(&relay.transport(), &SessionConfig::default())
            .await
            .unwrap();
        let mut stream = channel.on_any(&[RECEIVE_MESSAGE, WHO_IS_CONNECTED]);

        relay.disconnect_all();

        assert!(stream.next().await.is_none());
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_merged_stream_keeps_order() {
        let relay = MemoryRelay::new();
        let channel = RealtimeChannel::connect(&relay.transport(), &SessionConfig::default())
            .await
            .unwrap();
        channel
            .emit(JOIN_PRIVATE, &json!({"id": "alice", "friendId": "bob"}))
            .await
            .unwrap();
        let mut stream = channel.on_any(&[RECEIVE_MESSAGE, WHO_IS_CONNECTED]);

        // Give the writer a moment to hand the join to the relay.
        tokio::time::sleep(Duration::from_millis(10)).await;
        relay.deliver("alice", Frame::bare(WHO_IS_CONNECTED));
        relay.deliver("alice", Frame::new(RECEIVE_MESSAGE, json!({"n": 1})));
        relay.deliver("alice", Frame::bare(WHO_IS_CONNECTED));

        assert_eq!(stream.next().await.unwrap().event, WHO_IS_CONNECTED);
        assert_eq!(stream.next().await.unwrap().event, RECEIVE_MESSAGE);
        assert_eq!(stream.next().await.unwrap().event, WHO_IS_CONNECTED);
    }
}
