//! Wire header: `flags ‖ counter ‖ ratchet_pub [‖ ephemeral_pub ‖ identity_dh_pub]`.

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::CryptoError;

/// Bit 0: the header carries X3DH bootstrap keys.
pub const FLAG_INITIAL: u8 = 0x01;

const KEY_LEN: usize = 32;
/// flags (1) + counter (4) + ratchet public key (32).
pub const HEADER_LEN: usize = 1 + 4 + KEY_LEN;
/// Header plus ephemeral and identity-DH public keys.
pub const INITIAL_HEADER_LEN: usize = HEADER_LEN + 2 * KEY_LEN;

/// X3DH keys an initiator attaches until its first message is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroize, Serialize, Deserialize)]
pub struct HandshakeKeys {
    pub ephemeral_public: [u8; 32],
    pub identity_dh_public: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub counter: u32,
    pub ratchet_public: [u8; 32],
    pub handshake: Option<HandshakeKeys>,
}

impl MessageHeader {
    pub fn is_initial(&self) -> bool {
        self.handshake.is_some()
    }

    pub fn encoded_len(&self) -> usize {
        if self.is_initial() {
            INITIAL_HEADER_LEN
        } else {
            HEADER_LEN
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(if self.is_initial() { FLAG_INITIAL } else { 0 });
        out.extend_from_slice(&self.counter.to_be_bytes());
        out.extend_from_slice(&self.ratchet_public);
        if let Some(handshake) = &self.handshake {
            out.extend_from_slice(&handshake.ephemeral_public);
            out.extend_from_slice(&handshake.identity_dh_public);
        }
        out
    }

    /// Split a wire message into its header and the remaining ciphertext.
    pub fn parse(data: &[u8]) -> Result<(Self, &[u8]), CryptoError> {
        let Some(&flags) = data.first() else {
            return Err(CryptoError::MalformedHeader("empty message".into()));
        };
        if flags & !FLAG_INITIAL != 0 {
            return Err(CryptoError::MalformedHeader(format!(
                "unknown flag bits {flags:#04x}"
            )));
        }
        let initial = flags & FLAG_INITIAL != 0;
        let len = if initial { INITIAL_HEADER_LEN } else { HEADER_LEN };
        if data.len() < len {
            return Err(CryptoError::MalformedHeader(format!(
                "need {len} header bytes, got {}",
                data.len()
            )));
        }

        let counter = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let ratchet_public = read_key(data, 5);
        let handshake = initial.then(|| HandshakeKeys {
            ephemeral_public: read_key(data, HEADER_LEN),
            identity_dh_public: read_key(data, HEADER_LEN + KEY_LEN),
        });

        Ok((
            Self {
                counter,
                ratchet_public,
                handshake,
            },
            &data[len..],
        ))
    }
}

fn read_key(data: &[u8], offset: usize) -> [u8; 32] {
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&data[offset..offset + KEY_LEN]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_header_layout() {
        let header = MessageHeader {
            counter: 0x0102_0304,
            ratchet_public: [7u8; 32],
            handshake: None,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..5], &[1, 2, 3, 4]);
        assert_eq!(&bytes[5..37], &[7u8; 32]);

        let mut wire = bytes.clone();
        wire.extend_from_slice(b"rest");
        let (parsed, rest) = MessageHeader::parse(&wire).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(rest, b"rest");
    }

    #[test]
    fn initial_header_carries_handshake_keys() {
        let header = MessageHeader {
            counter: 0,
            ratchet_public: [1u8; 32],
            handshake: Some(HandshakeKeys {
                ephemeral_public: [2u8; 32],
                identity_dh_public: [3u8; 32],
            }),
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), INITIAL_HEADER_LEN);
        assert_eq!(bytes[0] & FLAG_INITIAL, 1);
        assert_eq!(&bytes[37..69], &[2u8; 32]);
        assert_eq!(&bytes[69..101], &[3u8; 32]);

        let (parsed, rest) = MessageHeader::parse(&bytes).unwrap();
        assert!(parsed.is_initial());
        assert_eq!(parsed, header);
        assert!(rest.is_empty());
    }

    #[test]
    fn truncated_headers_rejected() {
        assert!(matches!(
            MessageHeader::parse(&[]),
            Err(CryptoError::MalformedHeader(_))
        ));
        assert!(MessageHeader::parse(&[0u8; HEADER_LEN - 1]).is_err());

        let mut initial = vec![FLAG_INITIAL];
        initial.extend_from_slice(&[0u8; HEADER_LEN]);
        assert!(MessageHeader::parse(&initial).is_err());
    }

    #[test]
    fn unknown_flags_rejected() {
        let mut bytes = vec![0x02];
        bytes.extend_from_slice(&[0u8; 40]);
        assert!(matches!(
            MessageHeader::parse(&bytes),
            Err(CryptoError::MalformedHeader(_))
        ));
    }
}
