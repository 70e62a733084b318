//! # Encrypted conversations
//!
//! Realtime direct and group chat where the relay only ever sees ciphertext.
//!
//! ## Security Model
//!
//! - **One session key per conversation lifetime**, minted on the first send
//! - **Fan-out wrapping**: every participant (sender included) gets the
//!   session key sealed under their own X25519 public key
//! - **Authenticated bodies**: ChaCha20-Poly1305, tampering is detected
//! - **Per-message failure isolation**: an unreadable inbound message is
//!   dropped without disturbing the session

mod channel;
mod config;
mod error;
pub mod history;
pub mod protocol;
mod recipients;
mod session;
pub mod transport;

pub use channel::{EventStream, RealtimeChannel};
pub use config::{SessionConfig, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_EVENT_BUFFER, DEFAULT_MAX_FRAME_LEN};
pub use error::ChatError;
pub use history::{decrypt_history, decrypt_stored_message, StoredMessage};
pub use recipients::{Direct, Group, OutboundEvent, OutgoingKeys, Recipients};
pub use session::{ChatSession, IncomingMessage, KeyState, SessionPhase, SessionServices};
pub use transport::{Frame, Link, LinkEvent, MemoryRelay, MemoryTransport, TcpTransport, Transport};
