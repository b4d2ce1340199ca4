//! Root and chain key derivation.

use hmac::{Hmac, Mac};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Domain separation for the root-key ratchet.
const ROOT_KDF_INFO: &[u8] = b"SealpostRatchet";

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

fn hmac_sha512(key: &[u8], parts: &[&[u8]]) -> [u8; 64] {
    let mut mac =
        <HmacSha512 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Mix a DH output into the root key.
///
/// Returns `(new_root_key, new_chain_key)`.
pub fn root_kdf(root_key: &[u8; 32], dh_output: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let okm = hmac_sha512(root_key, &[dh_output.as_slice(), ROOT_KDF_INFO]);
    let mut new_root = [0u8; 32];
    let mut chain = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain.copy_from_slice(&okm[32..]);
    (new_root, chain)
}

/// Step a chain key.
///
/// Returns `(message_key, next_chain_key)`.
pub fn chain_kdf(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let message = hmac_sha512(chain_key, &[&[MESSAGE_KEY_SEED][..]]);
    let next = hmac_sha512(chain_key, &[&[CHAIN_KEY_SEED][..]]);
    let mut message_key = [0u8; 32];
    let mut next_chain = [0u8; 32];
    message_key.copy_from_slice(&message[..32]);
    next_chain.copy_from_slice(&next[..32]);
    (message_key, next_chain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_kdf_is_deterministic_and_splits() {
        let (root_a, chain_a) = root_kdf(&[1u8; 32], &[2u8; 32]);
        let (root_b, chain_b) = root_kdf(&[1u8; 32], &[2u8; 32]);
        assert_eq!(root_a, root_b);
        assert_eq!(chain_a, chain_b);
        assert_ne!(root_a, chain_a);

        let (root_c, _) = root_kdf(&[1u8; 32], &[3u8; 32]);
        assert_ne!(root_a, root_c);
    }

    #[test]
    fn root_kdf_matches_hmac_layout() {
        let mut mac = <HmacSha512 as Mac>::new_from_slice(&[5u8; 32]).unwrap();
        mac.update(&[6u8; 32]);
        mac.update(b"SealpostRatchet");
        let expected = mac.finalize().into_bytes();

        let (root, chain) = root_kdf(&[5u8; 32], &[6u8; 32]);
        assert_eq!(&root[..], &expected[..32]);
        assert_eq!(&chain[..], &expected[32..]);
    }

    #[test]
    fn chain_kdf_separates_message_and_chain_keys() {
        let (message_key, next) = chain_kdf(&[9u8; 32]);
        assert_ne!(message_key, next);
        assert_ne!(next, [9u8; 32]);

        let mut mac = <HmacSha512 as Mac>::new_from_slice(&[9u8; 32]).unwrap();
        mac.update(&[0x01]);
        assert_eq!(&message_key[..], &mac.finalize().into_bytes()[..32]);
    }
}
