//! Key bundle generation, publication, and one-time prekey replenishment.
//!
//! Every private component is written to the [`SecureKeyStore`] before the
//! public bundle is produced. Nothing here logs or returns private bytes.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::dh::DhKeyPair;
use crate::directory::KeyDirectoryClient;
use crate::identity::{signed_prekey_message, Identity};
use crate::keychain::{
    one_time_prekey_name, parse_one_time_prekey_id, store_key, vault_prefix, SecureKeyStore,
    KEY_ED25519_PRIVATE, KEY_GENERATED_FLAG, KEY_NEXT_PREKEY_ID, KEY_SIGNED_PREKEY,
    KEY_SIGNED_PREKEY_SIGNATURE, KEY_SIGNED_PREKEY_TIMESTAMP, KEY_X25519_PRIVATE, VAULT_HANDSHAKES,
    VAULT_IDENTITY, VAULT_PREKEYS,
};
use crate::CryptoError;

/// Set once the freshly generated bundle reached the directory.
const KEY_BUNDLE_PUBLISHED: &str = "bundle_published";

/// Public half of a one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub key_id: u32,
    #[serde(with = "hex::serde")]
    pub public_key: Vec<u8>,
}

/// Our full public bundle, as uploaded to the key directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyBundle {
    /// Ed25519 identity public key.
    #[serde(with = "hex::serde")]
    pub identity_key_public: Vec<u8>,
    /// X25519 identity-DH public key.
    #[serde(with = "hex::serde")]
    pub identity_dh_key_public: Vec<u8>,
    /// X25519 signed prekey (public).
    #[serde(with = "hex::serde")]
    pub signed_prekey_public: Vec<u8>,
    /// Signature over `signed_prekey_public ‖ timestamp` by the identity key.
    #[serde(with = "hex::serde")]
    pub signed_prekey_signature: Vec<u8>,
    /// Signed prekey creation time, Unix milliseconds.
    pub signed_prekey_timestamp: u64,
    pub one_time_prekeys: Vec<OneTimePreKeyPublic>,
}

impl PublicKeyBundle {
    /// The shape a peer sees when fetching this bundle.
    pub fn for_peer(&self, one_time_prekey: Option<OneTimePreKeyPublic>) -> PeerKeyBundle {
        PeerKeyBundle {
            identity_key_public: self.identity_key_public.clone(),
            identity_dh_key_public: self.identity_dh_key_public.clone(),
            signed_prekey_public: self.signed_prekey_public.clone(),
            signed_prekey_signature: self.signed_prekey_signature.clone(),
            signed_prekey_timestamp: self.signed_prekey_timestamp,
            one_time_prekey,
        }
    }
}

/// A peer's bundle as returned by a directory fetch.
///
/// Carries at most one one-time prekey, consumed server-side by the fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerKeyBundle {
    #[serde(with = "hex::serde")]
    pub identity_key_public: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub identity_dh_key_public: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub signed_prekey_public: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub signed_prekey_signature: Vec<u8>,
    pub signed_prekey_timestamp: u64,
    pub one_time_prekey: Option<OneTimePreKeyPublic>,
}

/// Long- and medium-term private material needed for handshakes.
#[derive(Debug)]
pub struct LocalKeys {
    pub identity: Identity,
    pub identity_dh: DhKeyPair,
    pub signed_prekey: DhKeyPair,
    pub signed_prekey_signature: Vec<u8>,
    pub signed_prekey_timestamp: u64,
}

/// Creates, stores, and publishes this device's key material.
pub struct KeyBundleGenerator {
    store: Arc<dyn SecureKeyStore>,
    directory: Arc<dyn KeyDirectoryClient>,
    config: Config,
}

impl KeyBundleGenerator {
    pub fn new(
        store: Arc<dyn SecureKeyStore>,
        directory: Arc<dyn KeyDirectoryClient>,
        config: Config,
    ) -> Self {
        Self {
            store,
            directory,
            config,
        }
    }

    /// Generate if missing, then publish if not yet published.
    ///
    /// Never propagates errors: failures are logged and reported as `false`.
    pub async fn initialize_keys(&self) -> bool {
        match self.initialize_and_publish().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "key initialization failed");
                false
            }
        }
    }

    async fn initialize_and_publish(&self) -> Result<(), CryptoError> {
        let generated = self.generate_keys_if_missing().await?;
        let published_key = store_key(VAULT_PREKEYS, KEY_BUNDLE_PUBLISHED);
        if !generated && self.store.get(&published_key).await?.is_some() {
            tracing::debug!("key bundle already generated and published");
            return Ok(());
        }

        let bundle = self.public_bundle().await?;
        self.directory.upload_bundle(&bundle).await?;
        self.store.set(&published_key, &[1]).await?;
        tracing::info!(
            one_time_prekeys = bundle.one_time_prekeys.len(),
            "key bundle published"
        );
        Ok(())
    }

    /// Create the full key set unless it already exists.
    ///
    /// Returns `true` if new material was generated. The existing set counts
    /// only when both the generation flag and the identity private key are
    /// actually stored.
    pub async fn generate_keys_if_missing(&self) -> Result<bool, CryptoError> {
        let flag = self
            .store
            .get(&store_key(VAULT_IDENTITY, KEY_GENERATED_FLAG))
            .await?;
        let identity = self
            .store
            .get(&store_key(VAULT_IDENTITY, KEY_ED25519_PRIVATE))
            .await?;
        if flag.is_some() && identity.is_some() {
            return Ok(false);
        }

        let identity = Identity::generate();
        let identity_dh = DhKeyPair::generate();
        let signed_prekey = DhKeyPair::generate();
        let timestamp = now_millis();
        let signature =
            identity.sign(&signed_prekey_message(&signed_prekey.public_bytes(), timestamp));

        self.store
            .set(
                &store_key(VAULT_IDENTITY, KEY_ED25519_PRIVATE),
                identity.secret_key_bytes(),
            )
            .await?;
        self.store
            .set(
                &store_key(VAULT_IDENTITY, KEY_X25519_PRIVATE),
                identity_dh.secret_bytes(),
            )
            .await?;
        self.store
            .set(
                &store_key(VAULT_PREKEYS, KEY_SIGNED_PREKEY),
                signed_prekey.secret_bytes(),
            )
            .await?;
        self.store
            .set(
                &store_key(VAULT_PREKEYS, KEY_SIGNED_PREKEY_SIGNATURE),
                &signature.to_bytes(),
            )
            .await?;
        self.store
            .set(
                &store_key(VAULT_PREKEYS, KEY_SIGNED_PREKEY_TIMESTAMP),
                &timestamp.to_be_bytes(),
            )
            .await?;

        self.generate_one_time_prekeys(self.config.one_time_prekey_target)
            .await?;

        self.store
            .set(&store_key(VAULT_IDENTITY, KEY_GENERATED_FLAG), &[1])
            .await?;

        tracing::info!(
            identity = %identity.public_key_hex(),
            one_time_prekeys = self.config.one_time_prekey_target,
            "key material generated"
        );
        Ok(true)
    }

    /// Top up the directory's OTP pool once it drops below the threshold.
    ///
    /// Returns the number of new prekeys uploaded (0 when above threshold).
    pub async fn check_and_replenish_prekeys(&self) -> Result<usize, CryptoError> {
        let remaining = self.directory.one_time_prekey_count().await?;
        if remaining >= self.config.one_time_prekey_threshold {
            tracing::trace!(remaining, "one-time prekey pool above threshold");
            return Ok(0);
        }

        let needed = self.config.one_time_prekey_target.saturating_sub(remaining);
        let fresh = self.generate_one_time_prekeys(needed).await?;
        self.directory.replenish_one_time_prekeys(&fresh).await?;

        tracing::info!(remaining, uploaded = fresh.len(), "one-time prekeys replenished");
        Ok(fresh.len())
    }

    /// Generate `count` OTPs with fresh ids and persist their private halves.
    ///
    /// The id counter is advanced before any key is written, so an
    /// interrupted run can never hand out the same id twice.
    async fn generate_one_time_prekeys(
        &self,
        count: u32,
    ) -> Result<Vec<OneTimePreKeyPublic>, CryptoError> {
        let counter_key = store_key(VAULT_PREKEYS, KEY_NEXT_PREKEY_ID);
        let first_id = match self.store.get(&counter_key).await? {
            Some(bytes) => u32::from_be_bytes(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| CryptoError::PreKeyError("corrupt prekey id counter".into()))?,
            ),
            None => 1,
        };
        let next_id = first_id
            .checked_add(count)
            .ok_or_else(|| CryptoError::PreKeyError("one-time prekey ids exhausted".into()))?;
        self.store.set(&counter_key, &next_id.to_be_bytes()).await?;

        let mut fresh = Vec::with_capacity(count as usize);
        for key_id in first_id..next_id {
            let pair = DhKeyPair::generate();
            self.store
                .set(
                    &store_key(VAULT_PREKEYS, &one_time_prekey_name(key_id)),
                    pair.secret_bytes(),
                )
                .await?;
            fresh.push(OneTimePreKeyPublic {
                key_id,
                public_key: pair.public_bytes().to_vec(),
            });
        }
        Ok(fresh)
    }

    /// Rebuild the public bundle from stored material.
    pub async fn public_bundle(&self) -> Result<PublicKeyBundle, CryptoError> {
        let local = self.load_local_keys().await?;
        let one_time_prekeys = self
            .available_one_time_prekeys()
            .await?
            .into_iter()
            .map(|(key_id, pair)| OneTimePreKeyPublic {
                key_id,
                public_key: pair.public_bytes().to_vec(),
            })
            .collect();

        Ok(PublicKeyBundle {
            identity_key_public: local.identity.public_key_bytes().to_vec(),
            identity_dh_key_public: local.identity_dh.public_bytes().to_vec(),
            signed_prekey_public: local.signed_prekey.public_bytes().to_vec(),
            signed_prekey_signature: local.signed_prekey_signature.clone(),
            signed_prekey_timestamp: local.signed_prekey_timestamp,
            one_time_prekeys,
        })
    }

    /// Load identity and signed-prekey material for a handshake.
    pub async fn load_local_keys(&self) -> Result<LocalKeys, CryptoError> {
        let identity_secret = self
            .require(VAULT_IDENTITY, KEY_ED25519_PRIVATE, "identity key")
            .await?;
        let identity_secret: [u8; 32] = identity_secret
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity key wrong length".into()))?;
        let identity = Identity::from_secret_bytes(&identity_secret);

        let identity_dh = DhKeyPair::from_secret_slice(
            &self
                .require(VAULT_IDENTITY, KEY_X25519_PRIVATE, "identity DH key")
                .await?,
            "identity DH key",
        )?;
        let signed_prekey = DhKeyPair::from_secret_slice(
            &self
                .require(VAULT_PREKEYS, KEY_SIGNED_PREKEY, "signed prekey")
                .await?,
            "signed prekey",
        )?;
        let signed_prekey_signature = self
            .require(VAULT_PREKEYS, KEY_SIGNED_PREKEY_SIGNATURE, "signed prekey signature")
            .await?;
        let timestamp = self
            .require(VAULT_PREKEYS, KEY_SIGNED_PREKEY_TIMESTAMP, "signed prekey timestamp")
            .await?;
        let signed_prekey_timestamp = u64::from_be_bytes(
            timestamp
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::PreKeyError("corrupt signed prekey timestamp".into()))?,
        );

        Ok(LocalKeys {
            identity,
            identity_dh,
            signed_prekey,
            signed_prekey_signature,
            signed_prekey_timestamp,
        })
    }

    async fn require(&self, vault: &str, name: &str, what: &str) -> Result<Vec<u8>, CryptoError> {
        self.store
            .get(&store_key(vault, name))
            .await?
            .ok_or_else(|| CryptoError::PreKeyError(format!("{what} not found")))
    }

    /// Every locally stored OTP, in ascending id order.
    pub async fn available_one_time_prekeys(&self) -> Result<Vec<(u32, DhKeyPair)>, CryptoError> {
        let prefix = store_key(VAULT_PREKEYS, "otp_");
        let mut ids: Vec<u32> = self
            .store
            .list_keys_with_prefix(&prefix)
            .await?
            .iter()
            .filter_map(|key| parse_one_time_prekey_id(key))
            .collect();
        ids.sort_unstable();

        let mut prekeys = Vec::with_capacity(ids.len());
        for key_id in ids {
            if let Some(pair) = self.one_time_prekey(key_id).await? {
                prekeys.push((key_id, pair));
            }
        }
        Ok(prekeys)
    }

    pub async fn one_time_prekey(&self, key_id: u32) -> Result<Option<DhKeyPair>, CryptoError> {
        match self
            .store
            .get(&store_key(VAULT_PREKEYS, &one_time_prekey_name(key_id)))
            .await?
        {
            Some(bytes) => Ok(Some(DhKeyPair::from_secret_slice(
                &bytes,
                "one-time prekey",
            )?)),
            None => Ok(None),
        }
    }

    /// Permanently delete a consumed OTP.
    pub async fn remove_one_time_prekey(&self, key_id: u32) -> Result<(), CryptoError> {
        self.store
            .delete(&store_key(VAULT_PREKEYS, &one_time_prekey_name(key_id)))
            .await?;
        tracing::debug!(key_id, "one-time prekey consumed");
        Ok(())
    }

    /// Remove every identity, prekey and handshake-record entry (account
    /// deletion).
    pub async fn delete_all_keys(&self) -> Result<(), CryptoError> {
        for vault in [VAULT_IDENTITY, VAULT_PREKEYS, VAULT_HANDSHAKES] {
            for key in self.store.list_keys_with_prefix(&vault_prefix(vault)).await? {
                self.store.delete(&key).await?;
            }
        }
        tracing::info!("local key material deleted");
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::directory::MemoryKeyDirectory;
    use crate::memory_store::MemoryKeyStore;

    fn small_config() -> Config {
        Config {
            one_time_prekey_target: 10,
            one_time_prekey_threshold: 4,
            ..Config::default()
        }
    }

    fn generator(
        directory: &Arc<MemoryKeyDirectory>,
        user: &str,
    ) -> (KeyBundleGenerator, Arc<MemoryKeyStore>) {
        let store = Arc::new(MemoryKeyStore::new());
        let generator = KeyBundleGenerator::new(
            store.clone(),
            Arc::new(directory.client_for(user)),
            small_config(),
        );
        (generator, store)
    }

    #[tokio::test]
    async fn initialize_generates_and_publishes() {
        let directory = MemoryKeyDirectory::new();
        let (bob, _store) = generator(&directory, "bob");

        assert!(bob.initialize_keys().await);
        assert_eq!(directory.remaining_one_time_prekeys("bob"), 10);

        let bundle = bob.public_bundle().await.unwrap();
        assert_eq!(bundle.identity_key_public.len(), 32);
        assert_eq!(bundle.identity_dh_key_public.len(), 32);
        assert_eq!(bundle.signed_prekey_signature.len(), 64);
        assert_ne!(bundle.identity_dh_key_public, bundle.signed_prekey_public);

        let message =
            signed_prekey_message(&bundle.signed_prekey_public, bundle.signed_prekey_timestamp);
        assert!(Identity::verify(
            &bundle.identity_key_public,
            &message,
            &bundle.signed_prekey_signature
        )
        .is_ok());
    }

    #[tokio::test]
    async fn reinitialization_is_a_noop() {
        let directory = MemoryKeyDirectory::new();
        let (bob, store) = generator(&directory, "bob");

        assert!(bob.initialize_keys().await);
        let before = bob.public_bundle().await.unwrap();
        let entries = store.len();

        assert!(!bob.generate_keys_if_missing().await.unwrap());
        assert!(bob.initialize_keys().await);
        let after = bob.public_bundle().await.unwrap();

        assert_eq!(before.identity_key_public, after.identity_key_public);
        assert_eq!(before.signed_prekey_public, after.signed_prekey_public);
        assert_eq!(store.len(), entries);
    }

    #[tokio::test]
    async fn flag_without_identity_key_regenerates() {
        let directory = MemoryKeyDirectory::new();
        let (bob, store) = generator(&directory, "bob");
        store
            .set(&store_key(VAULT_IDENTITY, KEY_GENERATED_FLAG), &[1])
            .await
            .unwrap();

        assert!(bob.generate_keys_if_missing().await.unwrap());
        assert!(bob.load_local_keys().await.is_ok());
    }

    #[tokio::test]
    async fn load_without_keys_fails() {
        let directory = MemoryKeyDirectory::new();
        let (bob, _store) = generator(&directory, "bob");
        assert!(matches!(
            bob.load_local_keys().await,
            Err(CryptoError::PreKeyError(_))
        ));
    }

    #[tokio::test]
    async fn replenish_tops_up_with_fresh_ids() {
        let directory = MemoryKeyDirectory::new();
        let (bob, _store) = generator(&directory, "bob");
        let alice = directory.client_for("alice");
        assert!(bob.initialize_keys().await);

        let original: HashSet<u32> = bob
            .public_bundle()
            .await
            .unwrap()
            .one_time_prekeys
            .iter()
            .map(|otp| otp.key_id)
            .collect();

        // Above threshold: nothing to do
        assert_eq!(bob.check_and_replenish_prekeys().await.unwrap(), 0);

        for _ in 0..7 {
            alice.fetch_bundle("bob").await.unwrap().unwrap();
        }
        assert_eq!(directory.remaining_one_time_prekeys("bob"), 3);

        assert_eq!(bob.check_and_replenish_prekeys().await.unwrap(), 7);
        assert_eq!(directory.remaining_one_time_prekeys("bob"), 10);

        let all = bob.available_one_time_prekeys().await.unwrap();
        assert_eq!(all.len(), 17);
        let fresh: Vec<u32> = all
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !original.contains(id))
            .collect();
        assert_eq!(fresh.len(), 7);
        assert!(fresh.iter().all(|id| *id > *original.iter().max().unwrap()));
    }

    #[tokio::test]
    async fn consumed_prekey_is_gone() {
        let directory = MemoryKeyDirectory::new();
        let (bob, _store) = generator(&directory, "bob");
        assert!(bob.initialize_keys().await);

        let (first_id, _) = bob.available_one_time_prekeys().await.unwrap()[0].clone();
        bob.remove_one_time_prekey(first_id).await.unwrap();

        assert!(bob.one_time_prekey(first_id).await.unwrap().is_none());
        assert!(bob
            .public_bundle()
            .await
            .unwrap()
            .one_time_prekeys
            .iter()
            .all(|otp| otp.key_id != first_id));
    }

    #[tokio::test]
    async fn delete_all_keys_wipes_vaults() {
        let directory = MemoryKeyDirectory::new();
        let (bob, store) = generator(&directory, "bob");
        assert!(bob.initialize_keys().await);
        store.set("handshakes/abcd", &[1]).await.unwrap();

        bob.delete_all_keys().await.unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn bundle_json_uses_hex_keys() {
        let bundle = PublicKeyBundle {
            identity_key_public: vec![0xab; 32],
            identity_dh_key_public: vec![0x01; 32],
            signed_prekey_public: vec![0x02; 32],
            signed_prekey_signature: vec![0x03; 64],
            signed_prekey_timestamp: 42,
            one_time_prekeys: vec![OneTimePreKeyPublic {
                key_id: 7,
                public_key: vec![0x04; 32],
            }],
        };
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["identity_key_public"], "ab".repeat(32));
        assert_eq!(json["one_time_prekeys"][0]["key_id"], 7);

        let peer = serde_json::to_value(bundle.for_peer(None)).unwrap();
        assert!(peer["one_time_prekey"].is_null());
        assert!(peer.get("one_time_prekeys").is_none());
    }
}
