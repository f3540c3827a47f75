//! Nibble addressing of 32-byte trie keys.

use super::KeyHash;

/// Number of nibbles in a key hash.
pub const KEY_NIBBLES: usize = 64;

/// Returns the nibble of `key` at `index`, high nibble first.
pub fn nibble_at(key: &KeyHash, index: usize) -> u8 {
    let byte = key[index / 2];
    if index % 2 == 0 { byte >> 4 } else { byte & 0x0F }
}

/// Number of leading nibbles `a` and `b` share, starting at `from`.
pub fn common_prefix_from(a: &KeyHash, b: &KeyHash, from: usize) -> usize {
    (from..KEY_NIBBLES)
        .find(|&index| nibble_at(a, index) != nibble_at(b, index))
        .unwrap_or(KEY_NIBBLES)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibbles_are_high_first() {
        let mut key = [0u8; 32];
        key[0] = 0xAB;
        assert_eq!(nibble_at(&key, 0), 0xA);
        assert_eq!(nibble_at(&key, 1), 0xB);
        assert_eq!(nibble_at(&key, 2), 0);
    }

    #[test]
    fn common_prefix() {
        let a = [0x12u8; 32];
        let mut b = a;
        b[1] = 0x13;
        assert_eq!(common_prefix_from(&a, &b, 0), 3);
        assert_eq!(common_prefix_from(&a, &b, 3), 3);
        assert_eq!(common_prefix_from(&a, &a, 0), KEY_NIBBLES);
    }
}
