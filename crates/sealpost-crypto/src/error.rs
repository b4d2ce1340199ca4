use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("verification failed: {0}")]
    VerificationError(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("decryption failed: {0}")]
    DecryptionError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("malformed message header: {0}")]
    MalformedHeader(String),

    #[error("message {counter} already consumed or expired")]
    DuplicateMessage { counter: u32 },

    #[error("message gap of {gap} exceeds skipped-key capacity {max}")]
    TooManySkipped { gap: u32, max: usize },

    #[error("message {0} is permanently undecryptable")]
    PermanentlyUndecryptable(String),

    #[error("session error: {0}")]
    SessionError(String),

    #[error("prekey error: {0}")]
    PreKeyError(String),

    #[error("no key bundle published for peer {0}")]
    BundleUnavailable(String),

    #[error("key directory error: {0}")]
    DirectoryError(String),

    #[error("key storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CryptoError {
    /// Whether this failure is tied to the message itself.
    ///
    /// Permanent failures mark the message undecryptable so it is never
    /// retried against an already-advanced chain. Storage, directory and
    /// local prekey failures are conditions of this device and leave no
    /// marker behind.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::VerificationError(_)
                | Self::DecryptionError(_)
                | Self::InvalidKey(_)
                | Self::MalformedHeader(_)
                | Self::DuplicateMessage { .. }
                | Self::TooManySkipped { .. }
                | Self::PermanentlyUndecryptable(_)
                | Self::SessionError(_)
        )
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratchet_failures_are_permanent() {
        assert!(CryptoError::DecryptionError("tag".into()).is_permanent());
        assert!(CryptoError::DuplicateMessage { counter: 3 }.is_permanent());
        assert!(CryptoError::TooManySkipped { gap: 500, max: 100 }.is_permanent());
    }

    #[test]
    fn persistence_failures_are_transient() {
        assert!(!CryptoError::StorageError("disk full".into()).is_permanent());
        assert!(!CryptoError::DirectoryError("offline".into()).is_permanent());
        assert!(!CryptoError::BundleUnavailable("bob".into()).is_permanent());
        assert!(!CryptoError::PreKeyError("identity key not found".into()).is_permanent());
    }
}
