//! X25519 keypairs shared by the identity-DH key, prekeys, and the ratchet.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// An X25519 keypair kept as raw bytes so it can be snapshotted.
#[derive(Clone, Zeroize, ZeroizeOnDrop, serde::Serialize, serde::Deserialize)]
pub struct DhKeyPair {
    secret: [u8; 32],
    #[zeroize(skip)]
    public: [u8; 32],
}

impl DhKeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            secret: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    /// Restore a keypair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self {
            secret: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    /// Restore a keypair from a stored secret of unchecked length.
    pub fn from_secret_slice(bytes: &[u8], what: &str) -> Result<Self, CryptoError> {
        Ok(Self::from_secret_bytes(key32(bytes, what)?))
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    /// Secret bytes, for the secure key store only.
    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// X25519 agreement with a peer public key.
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let secret = StaticSecret::from(self.secret);
        secret
            .diffie_hellman(&PublicKey::from(*their_public))
            .to_bytes()
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// Interpret `bytes` as a 32-byte key, naming the key in the error.
pub fn key32(bytes: &[u8], what: &str) -> Result<[u8; 32], CryptoError> {
    <[u8; 32]>::try_from(bytes).map_err(|_| CryptoError::InvalidKey(format!("{what} wrong length")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dh_agreement() {
        let alice = DhKeyPair::generate();
        let bob = DhKeyPair::generate();

        let shared_a = alice.diffie_hellman(&bob.public_bytes());
        let shared_b = bob.diffie_hellman(&alice.public_bytes());
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn restore_from_secret() {
        let pair = DhKeyPair::generate();
        let restored = DhKeyPair::from_secret_slice(pair.secret_bytes(), "test key").unwrap();
        assert_eq!(pair.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn wrong_length_rejected() {
        let err = DhKeyPair::from_secret_slice(&[0u8; 16], "signed prekey").unwrap_err();
        assert!(err.to_string().contains("signed prekey wrong length"));
    }
}
