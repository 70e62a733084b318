//! Decryption of persisted conversation history.
//!
//! The backend stores each message as sent: the encrypted body plus the JSON
//! of its wrapped key bundle. Authors read their own messages through the
//! sender copy; everyone else needs their recipient copy.

use serde::{Deserialize, Serialize};
use tracing::warn;
use x25519_dalek::StaticSecret;
use zeroize::Zeroizing;

use crate::chat::error::ChatError;
use crate::chat::protocol::EncryptedSessionKeys;
use crate::crypto::{decode_transport, AsymmetricCipher, SessionKey, SessionKeyCipher};
use crate::keystore::KeyPairManager;

/// A message as persisted by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub from_user_id: String,
    /// Transport-encoded ciphertext.
    pub content: String,
    /// JSON of the wrapped key bundle.
    pub public_credentials: String,
}

/// Decrypt one stored message for `local_id`.
pub fn decrypt_stored_message(
    local_id: &str,
    secret: &StaticSecret,
    message: &StoredMessage,
    asymmetric: &dyn AsymmetricCipher,
    cipher: &dyn SessionKeyCipher,
) -> Result<String, ChatError> {
    let bundle: EncryptedSessionKeys = serde_json::from_str(&message.public_credentials)?;

    let wrapped = if message.from_user_id == local_id {
        bundle.sender_copy()
    } else {
        match &bundle {
            EncryptedSessionKeys::Direct(keys) => keys.recipient_encrypted_session_key.as_str(),
            EncryptedSessionKeys::Group(keys) => keys
                .for_recipient(local_id)
                .ok_or_else(|| ChatError::RecipientNotInFanOut(local_id.to_string()))?,
        }
    };

    let raw = Zeroizing::new(asymmetric.decrypt(secret, &decode_transport(wrapped)?)?);
    let key = SessionKey::from_slice(&raw)?;
    Ok(cipher.decrypt_text(&key, &message.content)?)
}

/// Decrypt a conversation's history, skipping messages that cannot be read.
///
/// Fails only when `local_id` has no private key on this device.
pub fn decrypt_history(
    local_id: &str,
    keys: &KeyPairManager,
    messages: &[StoredMessage],
    asymmetric: &dyn AsymmetricCipher,
    cipher: &dyn SessionKeyCipher,
) -> Result<Vec<(String, String)>, ChatError> {
    let secret = keys
        .find_private_key(local_id)?
        .ok_or_else(|| ChatError::PrivateKeyMissing(local_id.to_string()))?;

    let mut decrypted = Vec::with_capacity(messages.len());
    for message in messages {
        match decrypt_stored_message(local_id, &secret, message, asymmetric, cipher) {
            Ok(text) => decrypted.push((message.from_user_id.clone(), text)),
            Err(e) => warn!(kind = e.kind(), "skipping unreadable stored message"),
        }
    }
    Ok(decrypted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::protocol::{DirectSessionKeys, GroupRecipientKey, GroupSessionKeys};
    use crate::crypto::{encode_transport, ChaChaSessionCipher, KeyPair, SealedBoxCipher};

    struct Fixture {
        alice: KeyPair,
        bob: KeyPair,
        asym: SealedBoxCipher,
        cipher: ChaChaSessionCipher,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                alice: KeyPair::generate(),
                bob: KeyPair::generate(),
                asym: SealedBoxCipher::new(),
                cipher: ChaChaSessionCipher::new(),
            }
        }

        fn wrap(&self, key: &SessionKey, owner: &KeyPair) -> String {
            encode_transport(&self.asym.encrypt(owner.public_key(), key.as_bytes()).unwrap())
        }

        fn direct_from_alice(&self, text: &str) -> StoredMessage {
            let key = SessionKey::generate();
            let bundle = EncryptedSessionKeys::Direct(DirectSessionKeys {
                sender_encrypted_session_key: self.wrap(&key, &self.alice),
                recipient_encrypted_session_key: self.wrap(&key, &self.bob),
            });
            StoredMessage {
                from_user_id: "alice".to_string(),
                content: self.cipher.encrypt_text(&key, text).unwrap(),
                public_credentials: serde_json::to_string(&bundle).unwrap(),
            }
        }
    }

    #[test]
    fn test_direct_history_both_sides() {
        let f = Fixture::new();
        let stored = f.direct_from_alice("hola");

        let as_author =
            decrypt_stored_message("alice", f.alice.secret_key(), &stored, &f.asym, &f.cipher);
        let as_friend =
            decrypt_stored_message("bob", f.bob.secret_key(), &stored, &f.asym, &f.cipher);

        assert_eq!(as_author.unwrap(), "hola");
        assert_eq!(as_friend.unwrap(), "hola");
    }

    #[test]
    fn test_group_history_missing_copy() {
        let f = Fixture::new();
        let key = SessionKey::generate();
        let bundle = EncryptedSessionKeys::Group(GroupSessionKeys {
            sender_encrypted_session_key: f.wrap(&key, &f.alice),
            recipients: vec![GroupRecipientKey {
                id: "bob".to_string(),
                encrypted_session_key: f.wrap(&key, &f.bob),
            }],
        });
        let stored = StoredMessage {
            from_user_id: "alice".to_string(),
            content: f.cipher.encrypt_text(&key, "team").unwrap(),
            public_credentials: serde_json::to_string(&bundle).unwrap(),
        };

        let carol = KeyPair::generate();
        assert_eq!(
            decrypt_stored_message("bob", f.bob.secret_key(), &stored, &f.asym, &f.cipher).unwrap(),
            "team"
        );
        assert!(matches!(
            decrypt_stored_message("carol", carol.secret_key(), &stored, &f.asym, &f.cipher),
            Err(ChatError::RecipientNotInFanOut(_))
        ));
    }

    #[test]
    fn test_history_skips_unreadable() {
        let f = Fixture::new();
        let keys = KeyPairManager::in_memory();
        keys.store("bob", &f.bob).unwrap();

        let mut broken = f.direct_from_alice("lost");
        broken.public_credentials = "{}".to_string();
        let messages = vec![f.direct_from_alice("one"), broken, f.direct_from_alice("two")];

        let history = decrypt_history("bob", &keys, &messages, &f.asym, &f.cipher).unwrap();
        let texts: Vec<&str> = history.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn test_history_requires_private_key() {
        let f = Fixture::new();
        let keys = KeyPairManager::in_memory();
        let messages = vec![f.direct_from_alice("one")];

        assert!(matches!(
            decrypt_history("bob", &keys, &messages, &f.asym, &f.cipher),
            Err(ChatError::PrivateKeyMissing(_))
        ));
    }
}
