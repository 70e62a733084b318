//! Fingerprint command - display key fingerprints for verification.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use sealchat::crypto::{fingerprint, load_public_key};

use super::{open_key_manager, CommandExecutor};

/// Display a public key's fingerprint for out-of-band verification.
///
/// Compare fingerprints with your contact over a separate channel
/// (phone call, in person) before trusting a directory entry.
#[derive(Args, Debug)]
#[command(group(clap::ArgGroup::new("source").required(true).args(["user", "key"])))]
pub struct FingerprintCommand {
    /// Fingerprint of the key stored for this user
    #[arg(short, long)]
    pub user: Option<String>,

    /// Fingerprint of a PEM public key file
    #[arg(short, long)]
    pub key: Option<PathBuf>,

    /// Key store file (with --user)
    #[arg(long)]
    pub store: Option<PathBuf>,
}

impl CommandExecutor for FingerprintCommand {
    fn execute(&self) -> Result<()> {
        let (label, public_key) = match (&self.user, &self.key) {
            (_, Some(path)) => {
                let key = load_public_key(path)
                    .with_context(|| format!("Failed to load {}", path.display()))?;
                (path.display().to_string(), key)
            }
            (Some(user), None) => {
                let (manager, path) = open_key_manager(self.store.as_deref())?;
                let key_pair = manager
                    .find_key_pair(user)
                    .context("Failed to read key store")?
                    .with_context(|| format!("No key pair for '{}' in {}", user, path.display()))?;
                (user.clone(), *key_pair.public_key())
            }
            (None, None) => anyhow::bail!("Pass --user or --key"),
        };

        println!("Key: {}", label);
        println!("Fingerprint: {}", fingerprint(&public_key));
        Ok(())
    }
}
