/// Jump consistent hash: maps `key` onto one of `buckets` slots.
///
/// Growing from N to N+1 buckets moves only ~1/(N+1) of the keys, so adding a
/// node to a role reshuffles as few partitions as possible.
pub fn jump_consistent_hash(key: u64, buckets: usize) -> usize {
    if buckets <= 1 {
        return 0;
    }

    let mut k = key;
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    let n = buckets as i64;

    while j < n {
        b = j;
        k = k.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b.wrapping_add(1) as f64) * (f64::from(1u32 << 31))
            / (((k >> 33).wrapping_add(1)) as f64)) as i64;
    }

    b as usize
}

/// FNV-1a over the bytes of `input`. Every node must compute the same value,
/// which rules out the randomly seeded std hasher.
pub fn stable_hash(input: &str) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    input.bytes().fold(OFFSET, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_within_range() {
        for key in 0..1000u64 {
            assert!(jump_consistent_hash(key, 7) < 7);
        }
        assert_eq!(jump_consistent_hash(42, 0), 0);
        assert_eq!(jump_consistent_hash(42, 1), 0);
    }

    #[test]
    fn test_growing_moves_few_keys() {
        let moved = (0..10_000u64)
            .filter(|k| jump_consistent_hash(*k, 3) != jump_consistent_hash(*k, 4))
            .count();
        let share = moved as f64 / 10_000.0;
        assert!((share - 0.25).abs() < 0.05, "moved share {share}");
    }

    #[test]
    fn test_stable_hash_known_values() {
        assert_eq!(stable_hash(""), 0xcbf29ce484222325);
        assert_eq!(stable_hash("a"), 0xaf63dc4c8601ec8c);
    }
}
