use async_trait::async_trait;

use crate::CryptoError;

/// Secure key storage, abstracted over the platform backend.
///
/// Holds every private key and serialized session snapshot. Implementations
/// must give read-after-write consistency on the local device. Keys are
/// namespaced as `"{vault}/{name}"` (see [`store_key`]).
#[async_trait]
pub trait SecureKeyStore: Send + Sync {
    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Store `data` under `key`, replacing any previous value.
    async fn set(&self, key: &str, data: &[u8]) -> Result<(), CryptoError>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CryptoError>;

    /// List every key starting with `prefix` (used for wipes).
    async fn list_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CryptoError>;
}

// Vault and key constants used throughout the crate.

/// Vault for identity keys.
pub const VAULT_IDENTITY: &str = "identity";
/// Ed25519 signing private key.
pub const KEY_ED25519_PRIVATE: &str = "ed25519_private";
/// X25519 identity Diffie-Hellman private key.
pub const KEY_X25519_PRIVATE: &str = "x25519_private";
/// Set once the full key set has been written.
pub const KEY_GENERATED_FLAG: &str = "keys_generated";

/// Vault for prekeys.
pub const VAULT_PREKEYS: &str = "prekeys";
/// Signed prekey private key.
pub const KEY_SIGNED_PREKEY: &str = "signed_prekey";
/// Signature over the signed prekey.
pub const KEY_SIGNED_PREKEY_SIGNATURE: &str = "signed_prekey_signature";
/// Signed prekey creation time (Unix ms, big-endian).
pub const KEY_SIGNED_PREKEY_TIMESTAMP: &str = "signed_prekey_timestamp";
/// Next one-time prekey id to allocate (big-endian u32).
pub const KEY_NEXT_PREKEY_ID: &str = "next_one_time_prekey_id";

/// Vault for per-peer session snapshots.
pub const VAULT_SESSIONS: &str = "sessions";
/// Vault for plaintext of locally-authored messages.
pub const VAULT_SENT: &str = "sent";
/// Vault for permanently undecryptable message markers.
pub const VAULT_FAILED: &str = "failed";
/// Vault for handshake base keys of replaced sessions, kept across wipes.
pub const VAULT_HANDSHAKES: &str = "handshakes";

/// Build the full store key for `name` inside `vault`.
pub fn store_key(vault: &str, name: &str) -> String {
    format!("{vault}/{name}")
}

/// Prefix matching every key inside `vault`.
pub fn vault_prefix(vault: &str) -> String {
    format!("{vault}/")
}

/// Generate the store key name for a one-time prekey.
pub fn one_time_prekey_name(key_id: u32) -> String {
    format!("otp_{key_id}")
}

/// Parse the id back out of a one-time prekey store key.
pub fn parse_one_time_prekey_id(store_key: &str) -> Option<u32> {
    store_key
        .strip_prefix(&vault_prefix(VAULT_PREKEYS))?
        .strip_prefix("otp_")?
        .parse()
        .ok()
}
