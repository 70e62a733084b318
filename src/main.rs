//! sealchat - end-to-end encrypted chat sessions
//!
//! Key management CLI: generate identities, print and fingerprint public keys.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{CommandExecutor, FingerprintCommand, KeygenCommand, PublicKeyCommand};

/// sealchat - end-to-end encrypted chat sessions
///
/// Identity keys live in a local key store (~/.sealchat/keys.json by default).
/// Only public keys ever leave this machine.
#[derive(Parser)]
#[command(name = "sealchat")]
#[command(version)]
#[command(about = "End-to-end encrypted chat: identity key management")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and store an identity key pair
    Keygen(KeygenCommand),

    /// Print a user's stored public key (PEM)
    PublicKey(PublicKeyCommand),

    /// Show a public key fingerprint for out-of-band verification
    Fingerprint(FingerprintCommand),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen(cmd) => cmd.execute(),
        Commands::PublicKey(cmd) => cmd.execute(),
        Commands::Fingerprint(cmd) => cmd.execute(),
    }
}
