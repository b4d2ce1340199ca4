use serde::{Deserialize, Serialize};

use crate::CryptoError;

/// Tunables for the session layer.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// let config = sealpost_crypto::Config::from_json(r#"{ "max_skip": 250 }"#).unwrap();
/// assert_eq!(config.max_skip, 250);
/// assert_eq!(config.one_time_prekey_target, 100);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Size the one-time prekey pool is filled up to.
    pub one_time_prekey_target: u32,
    /// Replenish once the directory reports fewer than this many.
    pub one_time_prekey_threshold: u32,
    /// Skipped-key cache capacity; also the largest tolerated gap.
    pub max_skip: usize,
    /// Abort handshakes whose signed prekey signature does not verify.
    pub strict_signature_verification: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            one_time_prekey_target: 100,
            one_time_prekey_threshold: 20,
            max_skip: 100,
            strict_signature_verification: true,
        }
    }
}

impl Config {
    /// Parse and validate a JSON config document.
    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CryptoError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.one_time_prekey_target == 0 {
            return Err(CryptoError::Config(
                "one_time_prekey_target must be positive".into(),
            ));
        }
        if self.one_time_prekey_threshold > self.one_time_prekey_target {
            return Err(CryptoError::Config(format!(
                "one_time_prekey_threshold {} exceeds target {}",
                self.one_time_prekey_threshold, self.one_time_prekey_target
            )));
        }
        if self.max_skip == 0 {
            return Err(CryptoError::Config("max_skip must be positive".into()));
        }
        Ok(())
    }
}
