// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Strings shorter than `1 << HASH_SAMPLE_SHIFT` bytes have every byte
/// hashed. Longer ones are sampled with a stride of `(len >> HASH_SAMPLE_SHIFT) + 1`.
pub const HASH_SAMPLE_SHIFT: u32 = 5;

/// Hashes `bytes` in bounded time.
///
/// The hash is seeded with the length, then folds in bytes walking backwards
/// from the last one. Long inputs only contribute about 32 sampled bytes, so
/// a megabyte-long key costs the same as a short one. Inputs which differ
/// only in unsampled positions collide, and are told apart by the full
/// content comparison in the table.
///
/// The seed keeps only the low 32 bits of the length.
#[inline]
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let len = bytes.len();
    let mut h = len as u32;
    let step = (len >> HASH_SAMPLE_SHIFT) + 1;
    let mut pos = len;
    while pos >= step {
        let byte = u32::from(bytes[pos - 1]);
        h ^= (h << 5).wrapping_add(h >> 2).wrapping_add(byte);
        pos -= step;
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_values() {
        assert_eq!(0, hash_bytes(b""));
        // h = 1; h ^= (1 << 5) + (1 >> 2) + 'a'
        assert_eq!(128, hash_bytes(b"a"));
        // 'b' first: 2 ^ 162 = 160, then 160 ^ (5120 + 40 + 97) = 5161
        assert_eq!(5161, hash_bytes(b"ab"));
    }

    #[test]
    fn test_embedded_zero_counts() {
        assert_ne!(hash_bytes(b"A"), hash_bytes(b"A\0B"));
        assert_ne!(hash_bytes(b"\0"), hash_bytes(b""));
        assert_ne!(hash_bytes(b"\0"), hash_bytes(b"\0\0"));
    }

    #[test]
    fn test_short_strings_hash_every_byte() {
        let base = [b'x'; 31];
        let hash = hash_bytes(&base);
        for i in 0..base.len() {
            let mut changed = base;
            changed[i] = b'y';
            assert_ne!(hash, hash_bytes(&changed), "byte {i} was skipped");
        }
    }

    #[test]
    fn test_long_strings_are_sampled() {
        // len = 64 gives a stride of 3, sampling indices 63, 60, ..., 3.
        let base = [b'x'; 64];
        let hash = hash_bytes(&base);

        let mut unsampled = base;
        unsampled[1] = b'y';
        assert_eq!(hash, hash_bytes(&unsampled));

        let mut sampled = base;
        sampled[63] = b'y';
        assert_ne!(hash, hash_bytes(&sampled));
    }

    #[test]
    fn test_huge_input() {
        let big = vec![7u8; 4 * 1024 * 1024];
        let hash = hash_bytes(&big);
        assert_eq!(hash, hash_bytes(&big.clone()));
    }

    #[test]
    fn fuzz_deterministic() {
        bolero::check!().with_type::<Vec<u8>>().for_each(|bytes| {
            let copy = bytes.clone();
            assert_eq!(hash_bytes(bytes), hash_bytes(&copy));
        });
    }
}
