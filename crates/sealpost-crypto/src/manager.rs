//! Per-peer session lifecycle.
//!
//! [`SessionManager`] is the context object the chat layer talks to. It
//! owns the key store and directory handles plus an in-memory table of
//! sessions. Each peer's entry sits behind its own async mutex, held for
//! the whole load → ratchet → persist → commit sequence, so operations on
//! one peer are strictly serialized while different peers run in parallel.
//!
//! Every session operation also holds a shared guard on the wipe lock;
//! [`SessionManager::clear_all_sessions`] takes it exclusively, so a wipe
//! waits for in-flight operations and nothing is written behind it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::directory::KeyDirectoryClient;
use crate::error::CryptoError;
use crate::keychain::{
    store_key, vault_prefix, SecureKeyStore, VAULT_FAILED, VAULT_HANDSHAKES, VAULT_SENT,
    VAULT_SESSIONS,
};
use crate::prekeys::KeyBundleGenerator;
use crate::ratchet::header::{MessageHeader, FLAG_INITIAL};
use crate::ratchet::session::RatchetSession;
use crate::x3dh;

type PeerSlot = Arc<Mutex<Option<RatchetSession>>>;

/// Result of a successful decrypt attempt, not yet committed.
struct DecryptOutcome {
    session: RatchetSession,
    plaintext: Vec<u8>,
    consumed_prekey: Option<u32>,
    /// Base key of the session this outcome replaces.
    retired_base_key: Option<[u8; 32]>,
}

/// Outcome of encrypting one plaintext for several peers.
#[derive(Debug, Default)]
pub struct FanOut {
    /// Wire bytes per peer that was encrypted for.
    pub delivered: HashMap<String, Vec<u8>>,
    /// Peers that could not be encrypted for, with the reason.
    pub failed: HashMap<String, CryptoError>,
}

pub struct SessionManager {
    store: Arc<dyn SecureKeyStore>,
    directory: Arc<dyn KeyDirectoryClient>,
    keys: KeyBundleGenerator,
    config: Config,
    sessions: parking_lot::Mutex<HashMap<String, PeerSlot>>,
    wipe: RwLock<()>,
    /// Consumed OTPs whose deletion failed; retried on replenishment.
    pending_prekey_removals: parking_lot::Mutex<Vec<u32>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SecureKeyStore>,
        directory: Arc<dyn KeyDirectoryClient>,
        config: Config,
    ) -> Result<Self, CryptoError> {
        config.validate()?;
        let keys = KeyBundleGenerator::new(Arc::clone(&store), Arc::clone(&directory), config.clone());
        Ok(Self {
            store,
            directory,
            keys,
            config,
            sessions: parking_lot::Mutex::new(HashMap::new()),
            wipe: RwLock::new(()),
            pending_prekey_removals: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// The key bundle generator sharing this manager's store and directory.
    pub fn keys(&self) -> &KeyBundleGenerator {
        &self.keys
    }

    /// Generate and publish key material if needed. See
    /// [`KeyBundleGenerator::initialize_keys`].
    pub async fn initialize_keys(&self) -> bool {
        self.keys.initialize_keys().await
    }

    /// Top up one-time prekeys, logging instead of failing.
    ///
    /// Also retries deletion of consumed prekeys that could not be removed
    /// when their handshake was committed. Replenishment problems never
    /// block messaging; the next check retries.
    pub async fn replenish_prekeys(&self) -> usize {
        self.retry_prekey_removals().await;
        match self.keys.check_and_replenish_prekeys().await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                tracing::warn!(error = %e, "one-time prekey replenishment failed; will retry");
                0
            }
        }
    }

    async fn retry_prekey_removals(&self) {
        let pending = std::mem::take(&mut *self.pending_prekey_removals.lock());
        for key_id in pending {
            if let Err(e) = self.keys.remove_one_time_prekey(key_id).await {
                tracing::warn!(key_id, error = %e, "consumed one-time prekey still not removed");
                self.pending_prekey_removals.lock().push(key_id);
            }
        }
    }

    fn slot(&self, peer_id: &str) -> PeerSlot {
        Arc::clone(
            self.sessions
                .lock()
                .entry(peer_id.to_string())
                .or_default(),
        )
    }

    /// Encrypt `plaintext` for `peer_id`, starting a session if needed.
    ///
    /// The plaintext is cached under `message_id` before the session
    /// advances: once the sending chain has moved on, our own message can
    /// no longer be decrypted locally.
    pub async fn encrypt_message(
        &self,
        peer_id: &str,
        message_id: &str,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let _wipe = self.wipe.read().await;
        self.store
            .set(&store_key(VAULT_SENT, message_id), plaintext)
            .await?;
        self.encrypt_for_peer(peer_id, plaintext).await
    }

    /// Pairwise fan-out: one independent ratchet encryption per peer.
    ///
    /// The plaintext is cached once under `message_id` before any session
    /// advances; if that write fails no peer is encrypted for.
    pub async fn encrypt_for_peers(
        &self,
        peer_ids: &[String],
        message_id: &str,
        plaintext: &[u8],
    ) -> Result<FanOut, CryptoError> {
        let _wipe = self.wipe.read().await;
        self.store
            .set(&store_key(VAULT_SENT, message_id), plaintext)
            .await?;

        let results = join_all(
            peer_ids
                .iter()
                .map(|peer_id| self.encrypt_for_peer(peer_id, plaintext)),
        )
        .await;

        let mut fan_out = FanOut::default();
        for (peer_id, result) in peer_ids.iter().zip(results) {
            match result {
                Ok(wire) => {
                    fan_out.delivered.insert(peer_id.clone(), wire);
                }
                Err(e) => {
                    tracing::warn!(peer = %peer_id, error = %e, "fan-out encryption failed");
                    fan_out.failed.insert(peer_id.clone(), e);
                }
            }
        }
        Ok(fan_out)
    }

    async fn encrypt_for_peer(&self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = self.load_snapshot(peer_id).await?;
        }

        let (next, wire) = match guard.as_ref() {
            Some(session) => session.encrypt(plaintext)?,
            None => self.start_session(peer_id).await?.encrypt(plaintext)?,
        };

        self.persist(peer_id, &next).await?;
        tracing::debug!(
            peer = %peer_id,
            counter = next.send_counter() - 1,
            initial = wire[0] & FLAG_INITIAL != 0,
            "message encrypted"
        );
        *guard = Some(next);
        Ok(wire)
    }

    async fn start_session(&self, peer_id: &str) -> Result<RatchetSession, CryptoError> {
        let bundle = self
            .directory
            .fetch_bundle(peer_id)
            .await?
            .ok_or_else(|| CryptoError::BundleUnavailable(peer_id.to_string()))?;
        let local = self.keys.load_local_keys().await?;
        let session = x3dh::initiate(
            peer_id,
            &local,
            &bundle,
            self.config.strict_signature_verification,
        )?;
        tracing::info!(peer = %peer_id, "session initiated via X3DH");
        Ok(session)
    }

    /// Decrypt a wire message from `peer_id`.
    ///
    /// The in-memory session is only replaced after the new state has been
    /// persisted. A message that fails for a reason tied to the message
    /// itself is marked undecryptable under `message_id` and never retried.
    pub async fn decrypt_message(
        &self,
        peer_id: &str,
        message_id: &str,
        wire: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let _wipe = self.wipe.read().await;
        if self.is_undecryptable(message_id).await? {
            return Err(CryptoError::PermanentlyUndecryptable(message_id.to_string()));
        }

        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = self.load_snapshot(peer_id).await?;
        }

        match self.attempt_decrypt(peer_id, guard.as_ref(), wire).await {
            Ok(outcome) => {
                if let Some(base_key) = outcome.retired_base_key {
                    self.retire_base_key(&base_key).await?;
                }
                self.persist(peer_id, &outcome.session).await?;
                tracing::debug!(
                    peer = %peer_id,
                    receive_counter = ?outcome.session.receive_counter(),
                    "message decrypted"
                );
                *guard = Some(outcome.session);
                if let Some(key_id) = outcome.consumed_prekey {
                    self.remove_consumed_prekey(key_id).await;
                }
                Ok(outcome.plaintext)
            }
            Err(e) if e.is_permanent() => {
                tracing::warn!(
                    peer = %peer_id,
                    message = %message_id,
                    error = %e,
                    "message permanently undecryptable"
                );
                self.store
                    .set(&store_key(VAULT_FAILED, message_id), &[1])
                    .await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// The session is already committed; a failed delete is queued rather
    /// than failing a message that can no longer be decrypted again.
    async fn remove_consumed_prekey(&self, key_id: u32) {
        if let Err(e) = self.keys.remove_one_time_prekey(key_id).await {
            tracing::warn!(key_id, error = %e, "consumed one-time prekey not removed; queued");
            self.pending_prekey_removals.lock().push(key_id);
        }
    }

    async fn attempt_decrypt(
        &self,
        peer_id: &str,
        current: Option<&RatchetSession>,
        wire: &[u8],
    ) -> Result<DecryptOutcome, CryptoError> {
        let (header, ciphertext) = MessageHeader::parse(wire)?;

        if let Some(handshake) = header.handshake {
            let current_base = current.and_then(RatchetSession::base_key);
            if current_base != Some(handshake.ephemeral_public) {
                if self.is_retired(&handshake.ephemeral_public).await? {
                    return Err(CryptoError::DuplicateMessage {
                        counter: header.counter,
                    });
                }
                if current.is_some() {
                    tracing::info!(peer = %peer_id, "peer started a new handshake; replacing session");
                }
                let mut outcome = self.bootstrap_responder(peer_id, &header, ciphertext).await?;
                outcome.retired_base_key = current_base;
                return Ok(outcome);
            }
        }

        let session = current
            .ok_or_else(|| CryptoError::SessionError(format!("no session with {peer_id}")))?;
        let (session, plaintext) = session.decrypt(&header, ciphertext, self.config.max_skip)?;
        Ok(DecryptOutcome {
            session,
            plaintext,
            consumed_prekey: None,
            retired_base_key: None,
        })
    }

    /// Responder-side X3DH.
    ///
    /// The header does not say which one-time prekey the initiator used, so
    /// local OTPs are tried in ascending id order, then the 3-DH variant.
    /// The first candidate whose session authenticates the message wins.
    async fn bootstrap_responder(
        &self,
        peer_id: &str,
        header: &MessageHeader,
        ciphertext: &[u8],
    ) -> Result<DecryptOutcome, CryptoError> {
        let local = self
            .keys
            .load_local_keys()
            .await
            .map_err(local_keys_unavailable)?;
        let pending = self.pending_prekey_removals.lock().clone();
        let prekeys: Vec<_> = self
            .keys
            .available_one_time_prekeys()
            .await
            .map_err(local_keys_unavailable)?
            .into_iter()
            .filter(|(key_id, _)| !pending.contains(key_id))
            .collect();

        let candidates = prekeys
            .iter()
            .map(|(key_id, pair)| (Some(*key_id), Some(pair)))
            .chain(std::iter::once((None, None)));

        let mut last_error = None;
        for (key_id, prekey) in candidates {
            let session = x3dh::respond(&local, prekey, header)?;
            match session.decrypt(header, ciphertext, self.config.max_skip) {
                Ok((session, plaintext)) => {
                    tracing::info!(
                        peer = %peer_id,
                        one_time_prekey = ?key_id,
                        "session established from initial message"
                    );
                    return Ok(DecryptOutcome {
                        session,
                        plaintext,
                        consumed_prekey: key_id,
                        retired_base_key: None,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CryptoError::DecryptionError("no handshake candidate authenticated".into())
        }))
    }

    /// Remember the base key of a session being replaced or wiped, so its
    /// initial message can never bootstrap a session again.
    async fn retire_base_key(&self, base_key: &[u8; 32]) -> Result<(), CryptoError> {
        self.store
            .set(&store_key(VAULT_HANDSHAKES, &hex::encode(base_key)), &[1])
            .await
    }

    async fn is_retired(&self, base_key: &[u8; 32]) -> Result<bool, CryptoError> {
        Ok(self
            .store
            .get(&store_key(VAULT_HANDSHAKES, &hex::encode(base_key)))
            .await?
            .is_some())
    }

    async fn persist(&self, peer_id: &str, session: &RatchetSession) -> Result<(), CryptoError> {
        self.store
            .set(&store_key(VAULT_SESSIONS, peer_id), &session.to_snapshot()?)
            .await
    }

    async fn load_snapshot(&self, peer_id: &str) -> Result<Option<RatchetSession>, CryptoError> {
        match self.store.get(&store_key(VAULT_SESSIONS, peer_id)).await? {
            Some(bytes) => Ok(Some(RatchetSession::from_snapshot(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether a session with `peer_id` exists in memory or in the store.
    pub async fn has_session(&self, peer_id: &str) -> Result<bool, CryptoError> {
        let _wipe = self.wipe.read().await;
        let slot = self.sessions.lock().get(peer_id).cloned();
        if let Some(slot) = slot {
            if slot.lock().await.is_some() {
                return Ok(true);
            }
        }
        Ok(self
            .store
            .get(&store_key(VAULT_SESSIONS, peer_id))
            .await?
            .is_some())
    }

    /// A copy of the current session state with `peer_id`, for inspection.
    pub async fn session(&self, peer_id: &str) -> Result<Option<RatchetSession>, CryptoError> {
        let _wipe = self.wipe.read().await;
        let slot = self.sessions.lock().get(peer_id).cloned();
        if let Some(slot) = slot {
            if let Some(session) = slot.lock().await.as_ref() {
                return Ok(Some(session.clone()));
            }
        }
        self.load_snapshot(peer_id).await
    }

    /// Plaintext of a message we sent, by message id.
    pub async fn sent_plaintext(&self, message_id: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        self.store.get(&store_key(VAULT_SENT, message_id)).await
    }

    /// Whether `message_id` has been marked permanently undecryptable.
    pub async fn is_undecryptable(&self, message_id: &str) -> Result<bool, CryptoError> {
        Ok(self
            .store
            .get(&store_key(VAULT_FAILED, message_id))
            .await?
            .is_some())
    }

    /// Wipe the session with one peer.
    pub async fn delete_session(&self, peer_id: &str) -> Result<(), CryptoError> {
        let _wipe = self.wipe.read().await;
        let slot = self.slot(peer_id);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = self.load_snapshot(peer_id).await?;
        }
        if let Some(base_key) = guard.as_ref().and_then(RatchetSession::base_key) {
            self.retire_base_key(&base_key).await?;
        }
        self.store
            .delete(&store_key(VAULT_SESSIONS, peer_id))
            .await?;
        *guard = None;
        tracing::info!(peer = %peer_id, "session deleted");
        Ok(())
    }

    /// Wipe every session and both message caches (logout / account deletion).
    ///
    /// Waits for in-flight session operations and blocks new ones until the
    /// wipe is done. Handshake records survive, so old initial messages stay
    /// rejected.
    pub async fn clear_all_sessions(&self) -> Result<(), CryptoError> {
        let _wipe = self.wipe.write().await;
        // No operation holds a peer slot while the exclusive guard is held.
        self.sessions.lock().clear();

        let mut removed = 0usize;
        for key in self
            .store
            .list_keys_with_prefix(&vault_prefix(VAULT_SESSIONS))
            .await?
        {
            if let Some(bytes) = self.store.get(&key).await? {
                match RatchetSession::from_snapshot(&bytes) {
                    Ok(session) => {
                        if let Some(base_key) = session.base_key() {
                            self.retire_base_key(&base_key).await?;
                        }
                    }
                    Err(e) => tracing::warn!(key = %key, error = %e, "unreadable session snapshot"),
                }
            }
            self.store.delete(&key).await?;
            removed += 1;
        }
        for vault in [VAULT_SENT, VAULT_FAILED] {
            for key in self.store.list_keys_with_prefix(&vault_prefix(vault)).await? {
                self.store.delete(&key).await?;
                removed += 1;
            }
        }
        tracing::info!(removed, "all sessions cleared");
        Ok(())
    }
}

/// Missing or corrupt local key material is a condition of this device,
/// not of the message being handled.
fn local_keys_unavailable(e: CryptoError) -> CryptoError {
    match e {
        CryptoError::StorageError(_) => e,
        other => CryptoError::StorageError(format!("local key material unavailable: {other}")),
    }
}
