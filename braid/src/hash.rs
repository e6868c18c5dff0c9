//! Deterministic content hashing.
//!
//! Cache keys and dedup names must be stable across processes, so everything
//! here avoids process-randomized hashers. Primitives are fed little-endian,
//! composites are length-prefixed, record fields are separated by a marker
//! byte, and map entries are visited in sorted key order.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Separator written between records so adjacent fields cannot alias
/// (`("ab","c")` must not hash like `("a","bc")`).
const RECORD_SEPARATOR: u8 = 0x24;

pub struct ContentHasher {
    digest: Sha256,
}

impl ContentHasher {
    pub fn new() -> ContentHasher {
        ContentHasher { digest: Sha256::new() }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.digest.update(bytes);
        self.separator();
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.digest.update(v.to_le_bytes());
        self.separator();
    }

    pub fn write_i64(&mut self, v: i64) {
        self.digest.update(v.to_le_bytes());
        self.separator();
    }

    pub fn write_bool(&mut self, v: bool) {
        self.digest.update([v as u8]);
        self.separator();
    }

    /// Hashes an optional sub-hash. `None` and `Some` are distinguished by a
    /// tag byte so a missing element cannot collide with a present zero.
    pub fn write_option_u64(&mut self, v: Option<u64>) {
        match v {
            None => self.digest.update([0u8]),
            Some(v) => {
                self.digest.update([1u8]);
                self.digest.update(v.to_le_bytes());
            }
        }
        self.separator();
    }

    pub fn write_str_slice(&mut self, items: &[String]) {
        self.write_len(items.len());
        for item in items {
            self.write_str(item);
        }
    }

    /// Map entries are hashed in sorted key order, so insertion order does
    /// not leak into the hash.
    pub fn write_str_map(&mut self, map: &BTreeMap<String, String>) {
        self.write_len(map.len());
        for (k, v) in map {
            self.write_str(k);
            self.write_str(v);
        }
    }

    fn write_len(&mut self, len: usize) {
        self.digest.update((len as u64).to_le_bytes());
    }

    fn separator(&mut self) {
        self.digest.update([RECORD_SEPARATOR]);
    }

    /// The first eight bytes of the digest, little-endian. 64 bits is plenty
    /// for dedup names and cache ids; the full digest is never persisted.
    pub fn finish(self) -> u64 {
        let bytes = self.digest.finalize();
        u64::from_le_bytes(bytes[..8].try_into().expect("digest shorter than 8 bytes"))
    }
}

impl Default for ContentHasher {
    fn default() -> ContentHasher {
        ContentHasher::new()
    }
}

/// Convenience wrapper for hashing one byte string.
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut h = ContentHasher::new();
    h.write_bytes(bytes);
    h.finish()
}

/// Formats a 64-bit hash the way it appears in emitted names.
pub fn hex16(h: u64) -> String {
    format!("{:016x}", h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_hashers() {
        let mut a = ContentHasher::new();
        a.write_str("hello");
        a.write_u64(42);
        let mut b = ContentHasher::new();
        b.write_str("hello");
        b.write_u64(42);
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn length_prefix_prevents_aliasing() {
        let mut a = ContentHasher::new();
        a.write_str("ab");
        a.write_str("c");
        let mut b = ContentHasher::new();
        b.write_str("a");
        b.write_str("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn option_tags_disambiguate() {
        let mut a = ContentHasher::new();
        a.write_option_u64(None);
        let mut b = ContentHasher::new();
        b.write_option_u64(Some(0));
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn map_order_is_canonical() {
        let mut fwd = BTreeMap::new();
        fwd.insert("a".to_string(), "1".to_string());
        fwd.insert("b".to_string(), "2".to_string());
        let mut h1 = ContentHasher::new();
        h1.write_str_map(&fwd);

        let mut rev = BTreeMap::new();
        rev.insert("b".to_string(), "2".to_string());
        rev.insert("a".to_string(), "1".to_string());
        let mut h2 = ContentHasher::new();
        h2.write_str_map(&rev);

        assert_eq!(h1.finish(), h2.finish());
    }

    #[test]
    fn hex16_is_fixed_width() {
        assert_eq!(hex16(0xab), "00000000000000ab");
        assert_eq!(hex16(u64::MAX).len(), 16);
    }
}
