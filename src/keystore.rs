//! Local storage of identity key pairs.
//!
//! The private key of each local user lives only on this device. Two stores are
//! provided:
//! - [`FileKeyStore`]: JSON file with base64 entries, indexed by user id
//! - [`MemoryKeyStore`]: process-local map, for tests and throwaway identities
//!
//! [`KeyPairManager`] sits on top and is what chat sessions talk to.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::keys::{decode_key_bytes, KeyError, KeyPair};

/// Errors that can occur during key store operations.
#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid key data for {user}: {source}")]
    InvalidKeyData {
        user: String,
        #[source]
        source: KeyError,
    },

    #[error("Stored public key for {0} does not match its private key")]
    KeyMismatch(String),

    #[error("Unsupported store version: {0}")]
    UnsupportedVersion(u8),

    #[error("Key store lock poisoned")]
    Poisoned,
}

/// Persistence backend for identity key pairs.
///
/// Absence of an entry is a normal state (`Ok(None)`), never an error.
pub trait PrivateKeyStore: Send + Sync {
    fn get(&self, user_id: &str) -> Result<Option<KeyPair>, KeyStoreError>;

    /// Stores `key_pair` for `user_id`, replacing any previous entry.
    fn set(&self, user_id: &str, key_pair: &KeyPair) -> Result<(), KeyStoreError>;

    /// Removes the entry. Returns whether one existed.
    fn remove(&self, user_id: &str) -> Result<bool, KeyStoreError>;
}

// ============================================================================
// File store
// ============================================================================

const STORE_VERSION: u8 = 1;

/// A single user's entry.
#[derive(Serialize, Deserialize, Clone)]
struct KeyEntry {
    /// Base64-encoded private key bytes
    private: String,
    /// Base64-encoded public key bytes
    public: String,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: u8,
    users: HashMap<String, KeyEntry>,
}

impl Default for KeyFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            users: HashMap::new(),
        }
    }
}

/// JSON key file on local disk.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<KeyFile, KeyStoreError> {
        if !self.path.exists() {
            return Ok(KeyFile::default());
        }

        let content = fs::read_to_string(&self.path)?;
        let file: KeyFile = serde_json::from_str(&content)?;
        if file.version != STORE_VERSION {
            return Err(KeyStoreError::UnsupportedVersion(file.version));
        }
        Ok(file)
    }

    fn write(&self, file: &KeyFile) -> Result<(), KeyStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(file)?;
        fs::write(&self.path, content)?;

        // Set restrictive permissions (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }
}

fn decode_entry(user_id: &str, entry: &KeyEntry) -> Result<KeyPair, KeyStoreError> {
    let invalid = |source| KeyStoreError::InvalidKeyData {
        user: user_id.to_string(),
        source,
    };

    let secret = StaticSecret::from(decode_key_bytes(&entry.private).map_err(invalid)?);
    let public = PublicKey::from(decode_key_bytes(&entry.public).map_err(invalid)?);

    let key_pair = KeyPair::from_secret(secret);
    if key_pair.public_key().as_bytes() != public.as_bytes() {
        return Err(KeyStoreError::KeyMismatch(user_id.to_string()));
    }
    Ok(key_pair)
}

impl PrivateKeyStore for FileKeyStore {
    fn get(&self, user_id: &str) -> Result<Option<KeyPair>, KeyStoreError> {
        let file = self.read()?;
        file.users
            .get(user_id)
            .map(|entry| decode_entry(user_id, entry))
            .transpose()
    }

    fn set(&self, user_id: &str, key_pair: &KeyPair) -> Result<(), KeyStoreError> {
        let mut file = self.read()?;
        file.users.insert(
            user_id.to_string(),
            KeyEntry {
                private: BASE64.encode(key_pair.secret_key().as_bytes()),
                public: BASE64.encode(key_pair.public_key().as_bytes()),
            },
        );
        self.write(&file)
    }

    fn remove(&self, user_id: &str) -> Result<bool, KeyStoreError> {
        let mut file = self.read()?;
        let existed = file.users.remove(user_id).is_some();
        if existed {
            self.write(&file)?;
        }
        Ok(existed)
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// In-memory key store.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, KeyPair>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PrivateKeyStore for MemoryKeyStore {
    fn get(&self, user_id: &str) -> Result<Option<KeyPair>, KeyStoreError> {
        let keys = self.keys.read().map_err(|_| KeyStoreError::Poisoned)?;
        Ok(keys.get(user_id).cloned())
    }

    fn set(&self, user_id: &str, key_pair: &KeyPair) -> Result<(), KeyStoreError> {
        let mut keys = self.keys.write().map_err(|_| KeyStoreError::Poisoned)?;
        keys.insert(user_id.to_string(), key_pair.clone());
        Ok(())
    }

    fn remove(&self, user_id: &str) -> Result<bool, KeyStoreError> {
        let mut keys = self.keys.write().map_err(|_| KeyStoreError::Poisoned)?;
        Ok(keys.remove(user_id).is_some())
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Generates, stores and retrieves local identity key pairs.
#[derive(Clone)]
pub struct KeyPairManager {
    store: Arc<dyn PrivateKeyStore>,
}

impl KeyPairManager {
    pub fn new(store: Arc<dyn PrivateKeyStore>) -> Self {
        Self { store }
    }

    /// Manager backed by a fresh [`MemoryKeyStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKeyStore::new()))
    }

    /// Generates a new key pair without storing it.
    pub fn generate(&self) -> KeyPair {
        KeyPair::generate()
    }

    /// Persists `key_pair` for `user_id`, overwriting any previous one.
    pub fn store(&self, user_id: &str, key_pair: &KeyPair) -> Result<(), KeyStoreError> {
        self.store.set(user_id, key_pair)?;
        debug!(user = user_id, "stored identity key pair");
        Ok(())
    }

    /// Private key for `user_id`, or `None` if this device never stored one.
    pub fn find_private_key(&self, user_id: &str) -> Result<Option<StaticSecret>, KeyStoreError> {
        Ok(self.store.get(user_id)?.map(KeyPair::into_secret_key))
    }

    pub fn find_key_pair(&self, user_id: &str) -> Result<Option<KeyPair>, KeyStoreError> {
        self.store.get(user_id)
    }

    /// Returns the stored key pair, generating and storing one if absent.
    pub fn ensure(&self, user_id: &str) -> Result<KeyPair, KeyStoreError> {
        if let Some(existing) = self.store.get(user_id)? {
            return Ok(existing);
        }

        let key_pair = self.generate();
        self.store(user_id, &key_pair)?;
        info!(user = user_id, "generated new identity key pair");
        Ok(key_pair)
    }

    /// Deletes the local key pair (explicit logout / key reset).
    pub fn reset(&self, user_id: &str) -> Result<bool, KeyStoreError> {
        let existed = self.store.remove(user_id)?;
        if existed {
            info!(user = user_id, "removed identity key pair");
        }
        Ok(existed)
    }
}
