use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

#[derive(Clone, Zeroize, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_public: [u8; 32],
    counter: u32,
    message_key: [u8; 32],
}

/// Bounded cache of message keys derived ahead of out-of-order delivery.
///
/// Keyed by `(remote ratchet public key, counter)`. Entries are kept in
/// insertion order; past capacity the oldest entry is evicted.
#[derive(Clone, Default, Zeroize, Serialize, Deserialize)]
pub struct SkippedKeyCache {
    entries: Vec<SkippedKey>,
}

impl SkippedKeyCache {
    pub fn insert(
        &mut self,
        ratchet_public: [u8; 32],
        counter: u32,
        message_key: [u8; 32],
        capacity: usize,
    ) {
        while self.entries.len() >= capacity && !self.entries.is_empty() {
            let mut evicted = self.entries.remove(0);
            tracing::trace!(counter = evicted.counter, "evicting skipped message key");
            evicted.zeroize();
        }
        self.entries.push(SkippedKey {
            ratchet_public,
            counter,
            message_key,
        });
    }

    /// Remove and return the key for `(ratchet_public, counter)`.
    pub fn take(&mut self, ratchet_public: &[u8; 32], counter: u32) -> Option<[u8; 32]> {
        let position = self
            .entries
            .iter()
            .position(|e| e.ratchet_public == *ratchet_public && e.counter == counter)?;
        let mut entry = self.entries.remove(position);
        let key = entry.message_key;
        entry.zeroize();
        Some(key)
    }

    pub fn contains(&self, ratchet_public: &[u8; 32], counter: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.ratchet_public == *ratchet_public && e.counter == counter)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_consumes_entry() {
        let mut cache = SkippedKeyCache::default();
        cache.insert([1u8; 32], 4, [9u8; 32], 10);

        assert!(cache.contains(&[1u8; 32], 4));
        assert_eq!(cache.take(&[1u8; 32], 4), Some([9u8; 32]));
        assert_eq!(cache.take(&[1u8; 32], 4), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn keyed_by_ratchet_and_counter() {
        let mut cache = SkippedKeyCache::default();
        cache.insert([1u8; 32], 0, [9u8; 32], 10);
        assert!(!cache.contains(&[2u8; 32], 0));
        assert!(!cache.contains(&[1u8; 32], 1));
    }

    #[test]
    fn oldest_evicted_past_capacity() {
        let mut cache = SkippedKeyCache::default();
        for counter in 0..5 {
            cache.insert([1u8; 32], counter, [u8::try_from(counter).unwrap(); 32], 3);
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&[1u8; 32], 0));
        assert!(!cache.contains(&[1u8; 32], 1));
        assert!(cache.contains(&[1u8; 32], 4));
    }
}
