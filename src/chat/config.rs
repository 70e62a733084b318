//! Chat session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default time allowed for the transport to report a connect outcome.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default capacity of the outbound queue. Subscriptions are unbounded.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Default maximum frame size accepted from a stream transport (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Configuration for a chat session and its channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// How long `join` waits for the first connect / connect-error event.
    pub connect_timeout_ms: u64,

    /// Drop the outgoing session key whenever a new channel replaces the old
    /// one, after `close` or after the link dropped. The first send on the new
    /// channel negotiates a fresh key.
    pub renegotiate_on_reconnect: bool,

    /// Capacity of the outbound queue.
    pub event_buffer: usize,

    /// Largest frame accepted by stream transports. Applied to the TCP
    /// transport built by `ClientConfig::tcp_transport`.
    pub max_frame_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            renegotiate_on_reconnect: true,
            event_buffer: DEFAULT_EVENT_BUFFER,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Keep the negotiated key across reconnects.
    pub fn keep_key_across_reconnect(mut self) -> Self {
        self.renegotiate_on_reconnect = false;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
