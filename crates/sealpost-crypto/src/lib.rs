pub mod config;
pub mod dh;
pub mod directory;
pub mod error;
pub mod identity;
pub mod keychain;
pub mod manager;
pub mod memory_store;
pub mod prekeys;
pub mod ratchet;
pub mod x3dh;

pub use config::Config;
pub use directory::{KeyDirectoryClient, MemoryKeyDirectory};
pub use error::CryptoError;
pub use identity::Identity;
pub use keychain::SecureKeyStore;
pub use manager::{FanOut, SessionManager};
pub use memory_store::MemoryKeyStore;
pub use prekeys::{KeyBundleGenerator, PeerKeyBundle, PublicKeyBundle};
pub use ratchet::RatchetSession;
