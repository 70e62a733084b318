//! Command module - Strategy pattern for CLI commands.
//!
//! Each command is a separate module implementing the `CommandExecutor` trait.

mod fingerprint;
mod keygen;
mod public_key;

pub use fingerprint::FingerprintCommand;
pub use keygen::KeygenCommand;
pub use public_key::PublicKeyCommand;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use sealchat::{ClientConfig, FileKeyStore, KeyPairManager};

/// Trait for command execution - Strategy pattern.
///
/// Each command struct holds its parsed arguments and implements
/// this trait to define its execution logic.
pub trait CommandExecutor {
    /// Executes the command with its parsed arguments.
    fn execute(&self) -> Result<()>;
}

/// Key manager over `store`, or over the configured key store.
pub(crate) fn open_key_manager(store: Option<&Path>) -> Result<(KeyPairManager, PathBuf)> {
    let path = match store {
        Some(path) => path.to_path_buf(),
        None => ClientConfig::load()
            .context("Failed to load configuration")?
            .resolved_key_store_path()
            .context("Failed to resolve key store path")?,
    };

    let manager = KeyPairManager::new(std::sync::Arc::new(FileKeyStore::new(path.clone())));
    Ok((manager, path))
}
