//! Deterministic key generators for store tests.
//!
//! Mirrors the key shapes real deployments feed the trie: short decimal
//! identifiers (dense shared prefixes, heavy splitting) and fixed-width
//! hash strings (sparse prefixes, wide fanout near the root).

use sha2::{Digest, Sha256};

/// The shape of generated keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Decimal integer strings ("1", "2", ...).
    Int,
    /// 32-hex-character hash strings.
    Hash128,
    /// 64-hex-character hash strings.
    Hash256,
}

/// Generates the key for a given index, deterministically.
#[derive(Debug, Clone, Copy)]
pub struct TestKey {
    kind: KeyKind,
}

impl TestKey {
    /// A generator of the given kind.
    #[must_use]
    pub fn new(kind: KeyKind) -> Self {
        Self { kind }
    }

    /// The key for `index`.
    #[must_use]
    pub fn key(&self, index: u64) -> String {
        match self.kind {
            KeyKind::Int => format!("{index}"),
            KeyKind::Hash128 => Self::hex_digest(index, 32),
            KeyKind::Hash256 => Self::hex_digest(index, 64),
        }
    }

    fn hex_digest(index: u64, hex_len: usize) -> String {
        let digest = Sha256::digest(index.to_string().as_bytes());
        let mut out = String::with_capacity(hex_len);
        for byte in digest {
            if out.len() >= hex_len {
                break;
            }
            out.push_str(&format!("{byte:02x}"));
        }
        out.truncate(hex_len);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_are_deterministic() {
        let a = TestKey::new(KeyKind::Hash256);
        let b = TestKey::new(KeyKind::Hash256);
        assert_eq!(a.key(42), b.key(42));
        assert_eq!(a.key(42).len(), 64);
        assert_eq!(TestKey::new(KeyKind::Hash128).key(42).len(), 32);
    }

    #[test]
    fn keys_are_distinct() {
        for kind in [KeyKind::Int, KeyKind::Hash128, KeyKind::Hash256] {
            let gen = TestKey::new(kind);
            let keys: HashSet<String> = (1..=5000).map(|i| gen.key(i)).collect();
            assert_eq!(keys.len(), 5000);
        }
    }
}
