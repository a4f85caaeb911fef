use std::collections::HashSet;
use tracing::debug;

use crate::request::UrlHash;

/// Best-effort set of recently pushed URL hashes, used to reject exact
/// duplicate pushes without touching the persisted table.
///
/// Never authoritative: once the cap is reached the whole set is dropped and
/// duplicate detection falls back to the table lookup. Owners may also call
/// [`DedupSet::clear`] on an external memory-pressure signal.
pub struct DedupSet {
    hashes: HashSet<UrlHash>,
    cap: usize,
}

impl DedupSet {
    pub fn new(cap: usize) -> Self {
        Self {
            hashes: HashSet::new(),
            cap,
        }
    }

    pub fn contains(&self, hash: &UrlHash) -> bool {
        self.hashes.contains(hash)
    }

    /// Record a pushed hash, wholesale-clearing first when over cap.
    pub fn insert(&mut self, hash: UrlHash) {
        if self.hashes.len() >= self.cap {
            debug!(size = self.hashes.len(), "dedup set over cap, clearing");
            self.hashes.clear();
        }
        self.hashes.insert(hash);
    }

    pub fn remove(&mut self, hash: &UrlHash) {
        self.hashes.remove(hash);
    }

    pub fn clear(&mut self) {
        self.hashes.clear();
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> UrlHash {
        UrlHash([n; crate::request::URL_HASH_LEN])
    }

    #[test]
    fn test_insert_and_remove() {
        let mut set = DedupSet::new(10);
        set.insert(hash(1));
        assert!(set.contains(&hash(1)));
        set.remove(&hash(1));
        assert!(!set.contains(&hash(1)));
    }

    #[test]
    fn test_clears_wholesale_above_cap() {
        let mut set = DedupSet::new(3);
        for n in 0..3 {
            set.insert(hash(n));
        }
        assert_eq!(set.len(), 3);
        // The fourth insert drops everything that came before.
        set.insert(hash(3));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&hash(3)));
        assert!(!set.contains(&hash(0)));
    }
}
