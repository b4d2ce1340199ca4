//! X3DH key agreement, initiator and responder sides.
//!
//! Both sides concatenate `DH1 ‖ DH2 ‖ DH3 [‖ DH4]` in that fixed order and
//! run HKDF-SHA-512 over it to obtain the 32-byte shared secret that seeds
//! the Double Ratchet.

use hkdf::Hkdf;
use sha2::Sha512;
use zeroize::Zeroizing;

use crate::dh::{key32, DhKeyPair};
use crate::error::CryptoError;
use crate::identity::{signed_prekey_message, Identity};
use crate::prekeys::{LocalKeys, PeerKeyBundle};
use crate::ratchet::header::{HandshakeKeys, MessageHeader};
use crate::ratchet::session::RatchetSession;

/// Domain separation for the shared-secret derivation.
const X3DH_INFO: &[u8] = b"SealpostX3DH";

/// Start a session with `peer_id` from their fetched bundle.
///
/// The returned session keeps the ephemeral and identity-DH public keys so
/// the first outgoing header can bootstrap the peer.
pub fn initiate(
    peer_id: &str,
    local: &LocalKeys,
    bundle: &PeerKeyBundle,
    strict_signature_verification: bool,
) -> Result<RatchetSession, CryptoError> {
    verify_signed_prekey(peer_id, bundle, strict_signature_verification)?;

    let their_signed_prekey = key32(&bundle.signed_prekey_public, "signed prekey")?;
    let their_identity_dh = key32(&bundle.identity_dh_key_public, "identity DH key")?;
    let ephemeral = DhKeyPair::generate();

    let mut ikm = Zeroizing::new(Vec::with_capacity(128));
    push_dh(&mut ikm, local.identity_dh.diffie_hellman(&their_signed_prekey))?;
    push_dh(&mut ikm, ephemeral.diffie_hellman(&their_identity_dh))?;
    push_dh(&mut ikm, ephemeral.diffie_hellman(&their_signed_prekey))?;

    match &bundle.one_time_prekey {
        Some(otp) => {
            let their_otp = key32(&otp.public_key, "one-time prekey")?;
            push_dh(&mut ikm, ephemeral.diffie_hellman(&their_otp))?;
            tracing::debug!(peer = %peer_id, key_id = otp.key_id, "X3DH with one-time prekey");
        }
        None => {
            tracing::warn!(
                peer = %peer_id,
                "peer bundle has no one-time prekey; falling back to 3-DH"
            );
        }
    }

    let shared_secret = derive_shared_secret(&ikm)?;
    Ok(RatchetSession::initiator(
        &shared_secret,
        &their_signed_prekey,
        HandshakeKeys {
            ephemeral_public: ephemeral.public_bytes(),
            identity_dh_public: local.identity_dh.public_bytes(),
        },
    ))
}

/// Answer an initial message: mirror the initiator's DH set and start a
/// receiving session at the sender's announced ratchet key.
pub fn respond(
    local: &LocalKeys,
    one_time_prekey: Option<&DhKeyPair>,
    header: &MessageHeader,
) -> Result<RatchetSession, CryptoError> {
    let handshake = header
        .handshake
        .ok_or_else(|| CryptoError::MalformedHeader("not an initial message".into()))?;

    let mut ikm = Zeroizing::new(Vec::with_capacity(128));
    push_dh(
        &mut ikm,
        local
            .signed_prekey
            .diffie_hellman(&handshake.identity_dh_public),
    )?;
    push_dh(
        &mut ikm,
        local.identity_dh.diffie_hellman(&handshake.ephemeral_public),
    )?;
    push_dh(
        &mut ikm,
        local.signed_prekey.diffie_hellman(&handshake.ephemeral_public),
    )?;
    if let Some(otp) = one_time_prekey {
        push_dh(&mut ikm, otp.diffie_hellman(&handshake.ephemeral_public))?;
    }

    let shared_secret = derive_shared_secret(&ikm)?;
    Ok(RatchetSession::responder(
        &shared_secret,
        local.signed_prekey.clone(),
        &header.ratchet_public,
        handshake.ephemeral_public,
    ))
}

fn verify_signed_prekey(
    peer_id: &str,
    bundle: &PeerKeyBundle,
    strict: bool,
) -> Result<(), CryptoError> {
    let message = signed_prekey_message(&bundle.signed_prekey_public, bundle.signed_prekey_timestamp);
    match Identity::verify(
        &bundle.identity_key_public,
        &message,
        &bundle.signed_prekey_signature,
    ) {
        Ok(()) => Ok(()),
        Err(e) if strict => {
            tracing::warn!(peer = %peer_id, error = %e, "signed prekey rejected");
            Err(e)
        }
        Err(e) => {
            tracing::warn!(
                peer = %peer_id,
                error = %e,
                "signed prekey signature invalid; continuing (strict verification disabled)"
            );
            Ok(())
        }
    }
}

fn push_dh(ikm: &mut Vec<u8>, mut shared: [u8; 32]) -> Result<(), CryptoError> {
    if shared == [0u8; 32] {
        return Err(CryptoError::InvalidKey("non-contributory DH output".into()));
    }
    ikm.extend_from_slice(&shared);
    zeroize::Zeroize::zeroize(&mut shared);
    Ok(())
}

fn derive_shared_secret(ikm: &[u8]) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha512>::new(Some(&[0u8; 64][..]), ikm);
    let mut okm = [0u8; 32];
    hk.expand(X3DH_INFO, &mut okm)
        .map_err(|e| CryptoError::SessionError(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}
