use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// A device's long-term signing identity.
///
/// The public half is published in the key bundle and is what peers use to
/// authenticate the signed prekey. It never takes part in Diffie-Hellman;
/// X3DH uses the separate identity-DH keypair.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore an identity from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Get the public key as raw bytes (32 bytes).
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the secret key bytes (for the secure key store only).
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// Sign a message with this identity's private key.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verify a signature made by the identity whose public key is given.
    pub fn verify(
        public_key: &[u8],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let public_key: [u8; 32] = public_key
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("identity key wrong length".into()))?;
        let verifying_key = VerifyingKey::from_bytes(&public_key)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 public key: {e}")))?;
        let signature = Signature::from_slice(signature)
            .map_err(|e| CryptoError::VerificationError(e.to_string()))?;
        verifying_key
            .verify(message, &signature)
            .map_err(|e| CryptoError::VerificationError(e.to_string()))
    }

    /// Get the public key as a hex string (for logs and display).
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// The message covered by a signed-prekey signature: `public_key ‖ timestamp`.
///
/// The timestamp is Unix milliseconds, big-endian.
pub fn signed_prekey_message(public_key: &[u8], timestamp: u64) -> Vec<u8> {
    let mut message = Vec::with_capacity(public_key.len() + 8);
    message.extend_from_slice(public_key);
    message.extend_from_slice(&timestamp.to_be_bytes());
    message
}
