//! Key generation command.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use sealchat::crypto::fingerprint;

use super::{open_key_manager, CommandExecutor};

/// Generate and store an identity key pair for a user.
#[derive(Args, Debug)]
pub struct KeygenCommand {
    /// User id the key pair belongs to
    #[arg(short, long)]
    pub user: String,

    /// Key store file (defaults to the configured store, ~/.sealchat/keys.json)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Replace an existing key pair for this user
    #[arg(long)]
    pub force: bool,
}

impl CommandExecutor for KeygenCommand {
    fn execute(&self) -> Result<()> {
        let (manager, path) = open_key_manager(self.store.as_deref())?;

        let existing = manager
            .find_key_pair(&self.user)
            .context("Failed to read key store")?;
        if existing.is_some() && !self.force {
            bail!(
                "A key pair for '{}' already exists in {}. Use --force to replace it \
                 (messages wrapped for the old key become unreadable).",
                self.user,
                path.display()
            );
        }

        let key_pair = manager.generate();
        manager
            .store(&self.user, &key_pair)
            .context("Failed to store key pair")?;

        eprintln!("Key pair for '{}' stored in {}", self.user, path.display());
        eprintln!("Fingerprint: {}", fingerprint(key_pair.public_key()));
        eprintln!();
        eprintln!("Publish this public key to the directory:");
        print!("{}", key_pair.public_key_pem());

        Ok(())
    }
}
