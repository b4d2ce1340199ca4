//! In-memory implementation of [`SecureKeyStore`].
//!
//! Suitable for tests, development, and as a runtime fallback before a
//! platform keystore is wired in.
//!
//! **WARNING**: Data is lost on process exit.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::keychain::SecureKeyStore;
use crate::CryptoError;

/// In-memory key store backed by an ordered map.
#[derive(Default)]
pub struct MemoryKeyStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl SecureKeyStore for MemoryKeyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, data: &[u8]) -> Result<(), CryptoError> {
        self.entries.lock().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CryptoError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CryptoError> {
        Ok(self
            .entries
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
