//! # sealchat - end-to-end encrypted chat sessions
//!
//! sealchat lets two or more parties chat over a realtime relay that only
//! ever sees ciphertext.
//!
//! ## Overview
//!
//! - Each user owns an X25519 identity key pair, stored locally
//! - Public keys are resolved through a directory service
//! - A conversation mints **one session key** on its first send
//! - The session key is **wrapped** for every participant (sender included)
//!   and travels next to each encrypted message
//! - Message bodies use ChaCha20-Poly1305, so tampering is detected
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sealchat::chat::{ChatSession, MemoryRelay, SessionConfig, SessionServices};
//! use sealchat::{KeyPairManager, StaticDirectory};
//!
//! # async fn run() -> Result<(), sealchat::ChatError> {
//! let relay = MemoryRelay::new();
//! let directory = Arc::new(StaticDirectory::new());
//! let keys = KeyPairManager::in_memory();
//!
//! let alice = keys.ensure("alice")?;
//! directory.publish("alice", alice.public_key());
//!
//! let services = SessionServices::new(keys, directory, Arc::new(relay.transport()));
//! let session = ChatSession::direct("alice", "bob", services, SessionConfig::default());
//!
//! session.join(|msg| println!("{}: {}", msg.sender_id, msg.text)).await?;
//! session.send_message("hello bob").await?;
//! session.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Identity keys, key wrapping, body encryption, negotiation
//! - [`keystore`]: Local private key storage
//! - [`directory`]: Public key lookup
//! - [`chat`]: Wire protocol, transports, channel and sessions
//! - [`config`]: Client configuration file

pub mod chat;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod keystore;

pub use chat::{ChatError, ChatSession, IncomingMessage, SessionConfig, SessionPhase, SessionServices};
pub use config::{ClientConfig, ConfigError};
pub use crypto::{KeyPair, SessionKey};
pub use directory::{DirectoryError, PublicKeyDirectory, SessionCachedDirectory, StaticDirectory};
pub use keystore::{FileKeyStore, KeyPairManager, KeyStoreError, MemoryKeyStore, PrivateKeyStore};
