//! In-process HMAC-SHA-256 key ring.
//!
//! [`HmacKeyRing`] is the bundled [`TokenizerOracle`] implementation: it
//! generates random 256-bit keys, signs with HMAC-SHA-256, and keeps every
//! generation it ever produced so that stale-key tokens remain resolvable
//! during rotation. Deployments with an external key service implement
//! [`TokenizerOracle`] against it instead.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use super::error::TokenizerError;
use super::TokenizerOracle;

type HmacSha256 = Hmac<Sha256>;

struct KeyRingState {
    current: String,
    keys: HashMap<String, [u8; 32]>,
}

/// A rotating ring of in-process HMAC keys.
pub struct HmacKeyRing {
    state: RwLock<KeyRingState>,
}

impl HmacKeyRing {
    /// Creates a ring with one freshly generated current key.
    #[must_use]
    pub fn new() -> Self {
        let (id, key) = Self::generate();
        let mut keys = HashMap::new();
        keys.insert(id.clone(), key);
        Self {
            state: RwLock::new(KeyRingState { current: id, keys }),
        }
    }

    /// Generates a new key, makes it current, and returns its id.
    ///
    /// Older keys stay resolvable so existing tokens can be translated.
    pub fn rotate(&self) -> String {
        let (id, key) = Self::generate();
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.keys.insert(id.clone(), key);
        state.current = id.clone();
        id
    }

    /// Returns the current key id.
    #[must_use]
    pub fn current(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .current
            .clone()
    }

    fn generate() -> (String, [u8; 32]) {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        let mut id_bytes = [0u8; 8];
        rand::rngs::OsRng.fill_bytes(&mut id_bytes);
        (hex::encode(id_bytes), key)
    }
}

impl Default for HmacKeyRing {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenizerOracle for HmacKeyRing {
    async fn current_key_id(&self) -> Result<String, TokenizerError> {
        Ok(self.current())
    }

    async fn sign(&self, key_id: &str, payload: &[u8]) -> Result<Vec<u8>, TokenizerError> {
        let key = {
            let state = self
                .state
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state
                .keys
                .get(key_id)
                .copied()
                .ok_or_else(|| TokenizerError::UnknownKey {
                    key_id: key_id.to_string(),
                })?
        };
        let mut mac = HmacSha256::new_from_slice(&key).map_err(|e| TokenizerError::Oracle {
            reason: e.to_string(),
        })?;
        mac.update(payload);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}
