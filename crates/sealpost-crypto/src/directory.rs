//! Key directory client abstraction.
//!
//! The directory is the server-side registry of public key bundles. It
//! hands out at most one one-time prekey per bundle fetch and forgets it
//! immediately, so the same OTP is never given to two initiators.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::prekeys::{OneTimePreKeyPublic, PeerKeyBundle, PublicKeyBundle};
use crate::CryptoError;

/// Network capability to publish and fetch key bundles.
///
/// Upload, count, and replenish act on the authenticated local account;
/// fetch targets a peer.
#[async_trait]
pub trait KeyDirectoryClient: Send + Sync {
    /// Publish our full public bundle, replacing any previous one.
    async fn upload_bundle(&self, bundle: &PublicKeyBundle) -> Result<(), CryptoError>;

    /// Fetch a peer's bundle, consuming one of their OTPs if any remain.
    async fn fetch_bundle(&self, peer_id: &str) -> Result<Option<PeerKeyBundle>, CryptoError>;

    /// How many of our OTPs the directory still holds.
    async fn one_time_prekey_count(&self) -> Result<u32, CryptoError>;

    /// Append freshly generated OTP public keys to our pool.
    async fn replenish_one_time_prekeys(
        &self,
        prekeys: &[OneTimePreKeyPublic],
    ) -> Result<(), CryptoError>;
}

struct DirectoryEntry {
    bundle: PeerKeyBundle,
    one_time_prekeys: VecDeque<OneTimePreKeyPublic>,
}

/// In-memory key directory shared by every account in a test or dev setup.
#[derive(Default)]
pub struct MemoryKeyDirectory {
    entries: Mutex<HashMap<String, DirectoryEntry>>,
}

impl MemoryKeyDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A client authenticated as `user_id`.
    pub fn client_for(self: &Arc<Self>, user_id: &str) -> MemoryDirectoryClient {
        MemoryDirectoryClient {
            directory: Arc::clone(self),
            user_id: user_id.to_string(),
        }
    }

    /// Remaining OTP count for any account (0 if unknown).
    pub fn remaining_one_time_prekeys(&self, user_id: &str) -> u32 {
        self.entries
            .lock()
            .get(user_id)
            .map_or(0, |entry| count_u32(entry.one_time_prekeys.len()))
    }
}

fn count_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// [`KeyDirectoryClient`] view of a [`MemoryKeyDirectory`] for one account.
pub struct MemoryDirectoryClient {
    directory: Arc<MemoryKeyDirectory>,
    user_id: String,
}

#[async_trait]
impl KeyDirectoryClient for MemoryDirectoryClient {
    async fn upload_bundle(&self, bundle: &PublicKeyBundle) -> Result<(), CryptoError> {
        let entry = DirectoryEntry {
            bundle: bundle.for_peer(None),
            one_time_prekeys: bundle.one_time_prekeys.iter().cloned().collect(),
        };
        self.directory
            .entries
            .lock()
            .insert(self.user_id.clone(), entry);
        tracing::debug!(
            user = %self.user_id,
            one_time_prekeys = bundle.one_time_prekeys.len(),
            "bundle uploaded"
        );
        Ok(())
    }

    async fn fetch_bundle(&self, peer_id: &str) -> Result<Option<PeerKeyBundle>, CryptoError> {
        let mut entries = self.directory.entries.lock();
        let Some(entry) = entries.get_mut(peer_id) else {
            return Ok(None);
        };
        let mut bundle = entry.bundle.clone();
        bundle.one_time_prekey = entry.one_time_prekeys.pop_front();
        Ok(Some(bundle))
    }

    async fn one_time_prekey_count(&self) -> Result<u32, CryptoError> {
        Ok(self.directory.remaining_one_time_prekeys(&self.user_id))
    }

    async fn replenish_one_time_prekeys(
        &self,
        prekeys: &[OneTimePreKeyPublic],
    ) -> Result<(), CryptoError> {
        let mut entries = self.directory.entries.lock();
        let entry = entries.get_mut(&self.user_id).ok_or_else(|| {
            CryptoError::DirectoryError(format!("no bundle uploaded for {}", self.user_id))
        })?;
        entry.one_time_prekeys.extend(prekeys.iter().cloned());
        Ok(())
    }
}
