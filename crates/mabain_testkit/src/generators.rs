//! Property-based test generators using proptest.

use proptest::prelude::*;

/// Strategy for generating valid keys: arbitrary non-empty byte strings.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..48)
}

/// Strategy for generating keys drawn from a small alphabet, maximizing
/// shared prefixes and therefore edge splits and merges.
pub fn clustered_key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(vec![b'a', b'b', b'c']), 1..12)
}

/// Strategy for generating values, including empty ones.
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..256)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::proptest;

    proptest! {
        #[test]
        fn generated_keys_are_valid(key in key_strategy()) {
            assert!(!key.is_empty());
            assert!(key.len() <= mabain_core::config::MAX_KEY_LENGTH);
        }
    }
}
