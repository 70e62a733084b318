//! Print a stored public key.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use super::{open_key_manager, CommandExecutor};

/// Print the PEM public key stored for a user.
#[derive(Args, Debug)]
pub struct PublicKeyCommand {
    /// User id to look up
    #[arg(short, long)]
    pub user: String,

    /// Key store file (defaults to the configured store)
    #[arg(long)]
    pub store: Option<PathBuf>,
}

impl CommandExecutor for PublicKeyCommand {
    fn execute(&self) -> Result<()> {
        let (manager, path) = open_key_manager(self.store.as_deref())?;
        let key_pair = manager
            .find_key_pair(&self.user)
            .context("Failed to read key store")?
            .with_context(|| {
                format!("No key pair for '{}' in {}", self.user, path.display())
            })?;

        print!("{}", key_pair.public_key_pem());
        Ok(())
    }
}
