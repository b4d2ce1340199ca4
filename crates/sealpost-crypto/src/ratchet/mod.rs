//! Double Ratchet: chain derivation, wire header, skipped keys and the
//! session state machine.

pub mod header;
pub mod kdf;
pub mod message_key;
pub mod session;
pub mod skipped;

pub use header::{HandshakeKeys, MessageHeader};
pub use session::RatchetSession;
