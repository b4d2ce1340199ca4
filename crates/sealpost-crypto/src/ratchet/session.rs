//! Double Ratchet session state machine.
//!
//! [`RatchetSession::encrypt`] and [`RatchetSession::decrypt`] never mutate
//! the session they are called on. They return the successor state
//! alongside their output, so a failed decrypt leaves the caller holding
//! exactly the state it had before the attempt.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::dh::DhKeyPair;
use crate::error::CryptoError;
use crate::ratchet::header::{HandshakeKeys, MessageHeader};
use crate::ratchet::kdf::{chain_kdf, root_kdf};
use crate::ratchet::message_key::MessageKey;
use crate::ratchet::skipped::SkippedKeyCache;

#[derive(Clone, Zeroize, Serialize, Deserialize)]
struct ChainState {
    key: [u8; 32],
    /// Index of the next message on this chain.
    counter: u32,
}

impl ChainState {
    fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }

    /// Derive the key for `counter`, caching every key skipped on the way.
    fn advance_to(
        &mut self,
        ratchet_public: &[u8; 32],
        counter: u32,
        skipped: &mut SkippedKeyCache,
        max_skip: usize,
    ) -> Result<MessageKey, CryptoError> {
        if counter < self.counter {
            return Err(CryptoError::DuplicateMessage { counter });
        }
        let gap = counter - self.counter;
        if gap as usize > max_skip {
            return Err(CryptoError::TooManySkipped { gap, max: max_skip });
        }

        while self.counter < counter {
            let (message_key, next) = chain_kdf(&self.key);
            skipped.insert(*ratchet_public, self.counter, message_key, max_skip);
            self.key = next;
            self.counter += 1;
        }
        self.step()
    }

    fn step(&mut self) -> Result<MessageKey, CryptoError> {
        let (message_key, next) = chain_kdf(&self.key);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| CryptoError::SessionError("chain counter exhausted".into()))?;
        self.key = next;
        Ok(MessageKey::new(message_key))
    }
}

/// A receiving chain replaced by a DH ratchet step.
///
/// Kept so messages still in flight on the old chain can be resolved.
#[derive(Clone, Zeroize, Serialize, Deserialize)]
struct PreviousChain {
    ratchet_public: [u8; 32],
    chain: ChainState,
}

/// Per-peer Double Ratchet state.
#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct RatchetSession {
    root_key: [u8; 32],
    sending_chain: ChainState,
    receiving_chain: Option<ChainState>,
    previous_receiving_chain: Option<PreviousChain>,
    own_ratchet: DhKeyPair,
    remote_ratchet_public: Option<[u8; 32]>,
    skipped: SkippedKeyCache,
    /// X3DH keys to attach until the first outbound message is sent.
    pending_handshake: Option<HandshakeKeys>,
    /// Initiator ephemeral key that bootstrapped a responder session.
    base_key: Option<[u8; 32]>,
}

impl RatchetSession {
    /// Sender-side start: ratchet against the peer's signed prekey.
    pub fn initiator(
        shared_secret: &[u8; 32],
        remote_signed_prekey: &[u8; 32],
        handshake: HandshakeKeys,
    ) -> Self {
        let own_ratchet = DhKeyPair::generate();
        let (root_key, sending_key) =
            root_kdf(shared_secret, &own_ratchet.diffie_hellman(remote_signed_prekey));
        Self {
            root_key,
            sending_chain: ChainState::new(sending_key),
            receiving_chain: None,
            previous_receiving_chain: None,
            own_ratchet,
            remote_ratchet_public: Some(*remote_signed_prekey),
            skipped: SkippedKeyCache::default(),
            pending_handshake: Some(handshake),
            base_key: None,
        }
    }

    /// Receiver-side start: the signed prekey is the initial ratchet key,
    /// followed immediately by one DH ratchet step against the sender.
    pub fn responder(
        shared_secret: &[u8; 32],
        signed_prekey: DhKeyPair,
        remote_ratchet_public: &[u8; 32],
        base_key: [u8; 32],
    ) -> Self {
        let mut session = Self {
            root_key: *shared_secret,
            sending_chain: ChainState::new([0u8; 32]),
            receiving_chain: None,
            previous_receiving_chain: None,
            own_ratchet: signed_prekey,
            remote_ratchet_public: None,
            skipped: SkippedKeyCache::default(),
            pending_handshake: None,
            base_key: Some(base_key),
        };
        session.dh_ratchet_step(remote_ratchet_public);
        session
    }

    /// Encrypt `plaintext`, returning the successor state and wire bytes.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut next = self.clone();
        let counter = next.sending_chain.counter;
        let message_key = next.sending_chain.step()?;

        let header = MessageHeader {
            counter,
            ratchet_public: next.own_ratchet.public_bytes(),
            handshake: next.pending_handshake,
        };
        let mut wire = header.encode();
        wire.extend_from_slice(&message_key.encrypt(plaintext)?);

        next.pending_handshake = None;
        Ok((next, wire))
    }

    /// Decrypt a parsed message, returning the successor state and plaintext.
    ///
    /// `max_skip` bounds both the tolerated gap and the skipped-key cache.
    pub fn decrypt(
        &self,
        header: &MessageHeader,
        ciphertext: &[u8],
        max_skip: usize,
    ) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut next = self.clone();
        let message_key = next.resolve_message_key(header, max_skip)?;
        let plaintext = message_key.decrypt(ciphertext)?;
        Ok((next, plaintext))
    }

    fn resolve_message_key(
        &mut self,
        header: &MessageHeader,
        max_skip: usize,
    ) -> Result<MessageKey, CryptoError> {
        let remote = header.ratchet_public;
        if let Some(key) = self.skipped.take(&remote, header.counter) {
            return Ok(MessageKey::new(key));
        }

        if let Some(previous) = &mut self.previous_receiving_chain {
            if previous.ratchet_public == remote {
                return previous
                    .chain
                    .advance_to(&remote, header.counter, &mut self.skipped, max_skip);
            }
        }

        if self.remote_ratchet_public != Some(remote) || self.receiving_chain.is_none() {
            self.dh_ratchet_step(&remote);
        }

        let chain = self
            .receiving_chain
            .as_mut()
            .ok_or_else(|| CryptoError::SessionError("no receiving chain".into()))?;
        chain.advance_to(&remote, header.counter, &mut self.skipped, max_skip)
    }

    fn dh_ratchet_step(&mut self, remote: &[u8; 32]) {
        if let (Some(old_remote), Some(old_chain)) =
            (self.remote_ratchet_public, self.receiving_chain.take())
        {
            self.previous_receiving_chain = Some(PreviousChain {
                ratchet_public: old_remote,
                chain: old_chain,
            });
        }

        let (root_key, receiving_key) =
            root_kdf(&self.root_key, &self.own_ratchet.diffie_hellman(remote));
        self.receiving_chain = Some(ChainState::new(receiving_key));

        self.own_ratchet = DhKeyPair::generate();
        let (root_key, sending_key) = root_kdf(&root_key, &self.own_ratchet.diffie_hellman(remote));
        self.root_key = root_key;
        self.sending_chain = ChainState::new(sending_key);
        self.remote_ratchet_public = Some(*remote);

        tracing::trace!(remote = %hex::encode(remote), "DH ratchet step");
    }

    /// Whether outgoing headers still carry the X3DH bootstrap keys.
    pub fn is_initial(&self) -> bool {
        self.pending_handshake.is_some()
    }

    pub fn base_key(&self) -> Option<[u8; 32]> {
        self.base_key
    }

    pub fn send_counter(&self) -> u32 {
        self.sending_chain.counter
    }

    pub fn receive_counter(&self) -> Option<u32> {
        self.receiving_chain.as_ref().map(|chain| chain.counter)
    }

    pub fn own_ratchet_public(&self) -> [u8; 32] {
        self.own_ratchet.public_bytes()
    }

    pub fn remote_ratchet_public(&self) -> Option<[u8; 32]> {
        self.remote_ratchet_public
    }

    pub fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }

    /// Serialize for the secure key store.
    pub fn to_snapshot(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_snapshot(data: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(data)
            .map_err(|e| CryptoError::Serialization(format!("corrupt session snapshot: {e}")))
    }
}

impl std::fmt::Debug for RatchetSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetSession")
            .field("own_ratchet", &hex::encode(self.own_ratchet.public_bytes()))
            .field(
                "remote_ratchet",
                &self.remote_ratchet_public.map(hex::encode),
            )
            .field("send_counter", &self.sending_chain.counter)
            .field("receive_counter", &self.receive_counter())
            .field("skipped_keys", &self.skipped.len())
            .field("initial", &self.is_initial())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_SKIP: usize = 100;

    /// Build a connected pair directly from a shared secret.
    fn pair() -> (RatchetSession, RatchetSession) {
        let shared = [42u8; 32];
        let bob_signed_prekey = DhKeyPair::generate();
        let handshake = HandshakeKeys {
            ephemeral_public: [5u8; 32],
            identity_dh_public: [6u8; 32],
        };
        let alice = RatchetSession::initiator(&shared, &bob_signed_prekey.public_bytes(), handshake);
        // Bob only learns Alice's ratchet key from her first header.
        let (_, first) = alice.encrypt(b"first").unwrap();
        let (header, _) = MessageHeader::parse(&first).unwrap();
        let bob = RatchetSession::responder(
            &shared,
            bob_signed_prekey,
            &header.ratchet_public,
            handshake.ephemeral_public,
        );
        (alice, bob)
    }

    fn send(session: &mut RatchetSession, plaintext: &[u8]) -> Vec<u8> {
        let (next, wire) = session.encrypt(plaintext).unwrap();
        *session = next;
        wire
    }

    fn receive(session: &mut RatchetSession, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (header, ciphertext) = MessageHeader::parse(wire)?;
        let (next, plaintext) = session.decrypt(&header, ciphertext, MAX_SKIP)?;
        *session = next;
        Ok(plaintext)
    }

    #[test]
    fn in_order_round_trip_and_reply() {
        let (mut alice, mut bob) = pair();

        let first = send(&mut alice, b"hello");
        assert_eq!(first[0] & 0x01, 1);
        assert!(!alice.is_initial());
        assert_eq!(receive(&mut bob, &first).unwrap(), b"hello");

        let second = send(&mut alice, b"again");
        assert_eq!(second[0], 0);
        assert_eq!(receive(&mut bob, &second).unwrap(), b"again");

        let reply = send(&mut bob, b"hi alice");
        assert_eq!(reply[0], 0);
        assert_eq!(receive(&mut alice, &reply).unwrap(), b"hi alice");
        assert_eq!(alice.remote_ratchet_public(), Some(bob.own_ratchet_public()));
    }

    #[test]
    fn ping_pong_rotates_ratchet_keys() {
        let (mut alice, mut bob) = pair();
        let mut seen = std::collections::HashSet::new();

        for round in 0..5u8 {
            let a = send(&mut alice, &[round]);
            assert_eq!(receive(&mut bob, &a).unwrap(), vec![round]);
            let b = send(&mut bob, &[round, round]);
            assert_eq!(receive(&mut alice, &b).unwrap(), vec![round, round]);
            assert!(seen.insert(alice.own_ratchet_public()));
            assert!(seen.insert(bob.own_ratchet_public()));
        }
    }

    #[test]
    fn out_of_order_within_chain() {
        let (mut alice, mut bob) = pair();
        let m0 = send(&mut alice, b"zero");
        let m1 = send(&mut alice, b"one");
        let m2 = send(&mut alice, b"two");

        assert_eq!(receive(&mut bob, &m2).unwrap(), b"two");
        assert_eq!(bob.skipped_keys(), 2);
        assert_eq!(receive(&mut bob, &m0).unwrap(), b"zero");
        assert_eq!(receive(&mut bob, &m1).unwrap(), b"one");
        assert_eq!(bob.skipped_keys(), 0);
    }

    #[test]
    fn late_message_from_previous_chain() {
        let (mut alice, mut bob) = pair();
        let m0 = send(&mut alice, b"zero");
        assert_eq!(receive(&mut bob, &m0).unwrap(), b"zero");

        let late = send(&mut alice, b"late");
        let reply = send(&mut bob, b"reply");
        assert_eq!(receive(&mut alice, &reply).unwrap(), b"reply");
        let fresh = send(&mut alice, b"fresh");

        // Bob ratchets forward on `fresh` before `late` arrives.
        assert_eq!(receive(&mut bob, &fresh).unwrap(), b"fresh");
        assert_eq!(receive(&mut bob, &late).unwrap(), b"late");
    }

    #[test]
    fn replay_rejected() {
        let (mut alice, mut bob) = pair();
        let m0 = send(&mut alice, b"once");
        assert_eq!(receive(&mut bob, &m0).unwrap(), b"once");
        assert!(matches!(
            receive(&mut bob, &m0),
            Err(CryptoError::DuplicateMessage { counter: 0 })
        ));
    }

    #[test]
    fn replay_of_skipped_key_rejected() {
        let (mut alice, mut bob) = pair();
        let m0 = send(&mut alice, b"zero");
        let m1 = send(&mut alice, b"one");
        assert!(receive(&mut bob, &m1).is_ok());
        assert!(receive(&mut bob, &m0).is_ok());
        assert!(receive(&mut bob, &m0).is_err());
    }

    #[test]
    fn gap_beyond_capacity_fails_without_mutation() {
        let (mut alice, mut bob) = pair();
        let mut last = Vec::new();
        for i in 0..=(MAX_SKIP + 1) {
            last = send(&mut alice, i.to_string().as_bytes());
        }
        let before = bob.to_snapshot().unwrap();

        let err = receive(&mut bob, &last).unwrap_err();
        assert!(matches!(err, CryptoError::TooManySkipped { gap: 101, max: 100 }));
        assert_eq!(bob.to_snapshot().unwrap(), before);
    }

    #[test]
    fn gap_at_capacity_succeeds() {
        let (mut alice, mut bob) = pair();
        let mut last = Vec::new();
        for i in 0..=MAX_SKIP {
            last = send(&mut alice, i.to_string().as_bytes());
        }
        assert_eq!(receive(&mut bob, &last).unwrap(), MAX_SKIP.to_string().as_bytes());
        assert_eq!(bob.skipped_keys(), MAX_SKIP);
    }

    #[test]
    fn tampered_message_leaves_state_untouched() {
        let (mut alice, mut bob) = pair();
        let mut wire = send(&mut alice, b"fragile");
        let before = bob.to_snapshot().unwrap();

        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert!(matches!(
            receive(&mut bob, &wire),
            Err(CryptoError::DecryptionError(_))
        ));
        assert_eq!(bob.to_snapshot().unwrap(), before);

        wire[last] ^= 0xff;
        assert_eq!(receive(&mut bob, &wire).unwrap(), b"fragile");
    }

    #[test]
    fn current_chain_key_does_not_reveal_past_message_keys() {
        let (mut alice, mut bob) = pair();
        let initial_chain_key = alice.sending_chain.key;
        let (first_message_key, _) = chain_kdf(&initial_chain_key);

        let m0 = send(&mut alice, b"past");
        send(&mut alice, b"later");

        // Everything derivable from the current chain key.
        let mut chain_key = alice.sending_chain.key;
        for _ in 0..MAX_SKIP {
            let (message_key, next) = chain_kdf(&chain_key);
            assert_ne!(message_key, first_message_key);
            chain_key = next;
        }

        // A session holding only the current chain cannot read the past.
        let mut compromised = bob.clone();
        assert_eq!(receive(&mut bob, &m0).unwrap(), b"past");
        compromised.receiving_chain = bob.receiving_chain.clone();
        assert!(receive(&mut compromised, &m0).is_err());
    }

    #[test]
    fn snapshot_round_trip_preserves_behaviour() {
        let (mut alice, bob) = pair();
        let m0 = send(&mut alice, b"persisted");

        let mut restored = RatchetSession::from_snapshot(&bob.to_snapshot().unwrap()).unwrap();
        assert_eq!(receive(&mut restored, &m0).unwrap(), b"persisted");
        assert!(RatchetSession::from_snapshot(b"not json").is_err());
    }

    #[test]
    fn debug_hides_keys() {
        let (alice, _) = pair();
        let rendered = format!("{alice:?}");
        assert!(!rendered.contains(&hex::encode(alice.root_key)));
        assert!(rendered.contains("send_counter"));
    }
}
