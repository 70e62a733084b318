//! Public key directory lookups.
//!
//! The directory is an external service mapping a participant id to the PEM
//! public key they published. Sessions never keep its answers beyond their own
//! lifetime: each join wraps the shared directory in a fresh
//! [`SessionCachedDirectory`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use x25519_dalek::PublicKey;

use crate::crypto::keys::{decode_public_key_pem, encode_public_key_pem};

/// Errors returned by directory lookups.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("No public key published for {0}")]
    NotFound(String),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Directory returned an invalid key for {0}")]
    InvalidKey(String),
}

/// Resolves participant ids to their currently published public key.
#[async_trait]
pub trait PublicKeyDirectory: Send + Sync {
    async fn find_public_key(&self, participant_id: &str) -> Result<PublicKey, DirectoryError>;
}

/// Parses the PEM string a directory hands back.
pub fn parse_published_key(participant_id: &str, pem: &str) -> Result<PublicKey, DirectoryError> {
    decode_public_key_pem(pem).map_err(|_| DirectoryError::InvalidKey(participant_id.to_string()))
}

// ============================================================================
// Static directory
// ============================================================================

/// In-memory directory of published PEM keys.
#[derive(Default)]
pub struct StaticDirectory {
    keys: RwLock<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes (or replaces) a participant's public key.
    pub fn publish(&self, participant_id: &str, key: &PublicKey) {
        self.publish_pem(participant_id, encode_public_key_pem(key));
    }

    pub fn publish_pem(&self, participant_id: &str, pem: String) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(participant_id.to_string(), pem);
        }
    }

    /// Simulates an outage: every lookup fails with `Unavailable` until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }
}

#[async_trait]
impl PublicKeyDirectory for StaticDirectory {
    async fn find_public_key(&self, participant_id: &str) -> Result<PublicKey, DirectoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("directory offline".to_string()));
        }

        let pem = {
            let keys = self
                .keys
                .read()
                .map_err(|_| DirectoryError::Unavailable("lock poisoned".to_string()))?;
            keys.get(participant_id).cloned()
        };

        match pem {
            Some(pem) => parse_published_key(participant_id, &pem),
            None => Err(DirectoryError::NotFound(participant_id.to_string())),
        }
    }
}

// ============================================================================
// Session cache
// ============================================================================

/// Read-through cache scoped to one chat session.
pub struct SessionCachedDirectory {
    inner: Arc<dyn PublicKeyDirectory>,
    cache: Mutex<HashMap<String, PublicKey>>,
}

impl SessionCachedDirectory {
    pub fn new(inner: Arc<dyn PublicKeyDirectory>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of distinct keys fetched so far.
    pub async fn cached(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[async_trait]
impl PublicKeyDirectory for SessionCachedDirectory {
    async fn find_public_key(&self, participant_id: &str) -> Result<PublicKey, DirectoryError> {
        if let Some(key) = self.cache.lock().await.get(participant_id) {
            return Ok(*key);
        }

        let key = self.inner.find_public_key(participant_id).await?;
        self.cache.lock().await.insert(participant_id.to_string(), key);
        Ok(key)
    }
}

// ============================================================================
// HTTP directory
// ============================================================================

#[cfg(feature = "http-directory")]
pub use http::HttpDirectory;

#[cfg(feature = "http-directory")]
mod http {
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde::Deserialize;
    use x25519_dalek::PublicKey;

    use super::{parse_published_key, DirectoryError, PublicKeyDirectory};

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct PublishedKey {
        public_key: String,
    }

    /// Directory served over HTTP: `GET {base}/users/{id}/public-key`.
    #[derive(Clone)]
    pub struct HttpDirectory {
        base_url: String,
        client: reqwest::Client,
    }

    impl HttpDirectory {
        pub fn new(base_url: impl Into<String>) -> Result<Self, DirectoryError> {
            let client = reqwest::Client::builder()
                .use_rustls_tls()
                .build()
                .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;
            Ok(Self {
                base_url: base_url.into().trim_end_matches('/').to_string(),
                client,
            })
        }

        fn key_url(&self, participant_id: &str) -> String {
            format!("{}/users/{}/public-key", self.base_url, participant_id)
        }
    }

    #[async_trait]
    impl PublicKeyDirectory for HttpDirectory {
        async fn find_public_key(&self, participant_id: &str) -> Result<PublicKey, DirectoryError> {
            let resp = self
                .client
                .get(self.key_url(participant_id))
                .send()
                .await
                .map_err(|e| DirectoryError::Unavailable(e.to_string()))?;

            match resp.status() {
                StatusCode::OK => {
                    let body: PublishedKey = resp
                        .json()
                        .await
                        .map_err(|_| DirectoryError::InvalidKey(participant_id.to_string()))?;
                    parse_published_key(participant_id, &body.public_key)
                }
                StatusCode::NOT_FOUND => Err(DirectoryError::NotFound(participant_id.to_string())),
                other => Err(DirectoryError::Unavailable(format!("status={}", other))),
            }
        }
    }
}
