use crate::filter::FilterPolicy;
use crate::util::hash;

/// A classic bloom filter with double hashing: one base hash per key, and
/// each of the `k` probes derived by adding a rotated delta. The last
/// byte of the encoded filter stores `k` so readers can probe filters
/// built with a different parameterization.
pub struct BloomFilter {
    bits_per_key: usize,
    k: usize,
}

impl BloomFilter {
    pub fn new(bits_per_key: usize) -> Self {
        // Rounding down trades a little accuracy for cheaper probing.
        let k = (bits_per_key as f64 * 0.69).clamp(1.0, 30.0) as usize; // 0.69 =~ ln(2)
        BloomFilter { bits_per_key, k }
    }

    #[inline]
    fn bloom_hash(key: &[u8]) -> u32 {
        hash::hash(key, 0xbc9f_1d34)
    }
}

impl FilterPolicy for BloomFilter {
    fn name(&self) -> &str {
        "leveldb.BuiltinBloomFilter2"
    }

    fn append_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>) {
        // Very short filters false-positive too often; 64 bits minimum.
        let bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = (bits + 7) / 8;
        let bits = bytes * 8;

        let init_size = dst.len();
        dst.resize(init_size + bytes, 0);
        let array = &mut dst[init_size..];
        for key in keys {
            let mut h = Self::bloom_hash(key);
            let delta = h >> 17 | h << 15;
            for _ in 0..self.k {
                let bit = (h as usize) % bits;
                array[bit / 8] |= 1 << (bit % 8);
                h = h.wrapping_add(delta);
            }
        }
        dst.push(self.k as u8);
    }

    fn key_may_match(&self, filter: &[u8], key: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }
        let array = &filter[..filter.len() - 1];
        let bits = array.len() * 8;
        let k = filter[filter.len() - 1] as usize;
        if k > 30 {
            // Reserved for future encodings; treat as a match.
            return true;
        }
        let mut h = Self::bloom_hash(key);
        let delta = h >> 17 | h << 15;
        for _ in 0..k {
            let bit = (h as usize) % bits;
            if array[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(policy: &BloomFilter, keys: &[&[u8]]) -> Vec<u8> {
        let owned: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        let mut filter = vec![];
        policy.append_filter(&owned, &mut filter);
        filter
    }

    #[test]
    fn test_empty_filter() {
        let policy = BloomFilter::new(10);
        let filter = build(&policy, &[]);
        assert!(!policy.key_may_match(&filter, b"hello"));
    }

    #[test]
    fn test_small() {
        let policy = BloomFilter::new(10);
        let filter = build(&policy, &[b"hello", b"world"]);
        assert!(policy.key_may_match(&filter, b"hello"));
        assert!(policy.key_may_match(&filter, b"world"));
        assert!(!policy.key_may_match(&filter, b"x"));
        assert!(!policy.key_may_match(&filter, b"foo"));
    }

    fn int_key(i: u32) -> Vec<u8> {
        i.to_le_bytes().to_vec()
    }

    #[test]
    fn test_varying_lengths_false_positive_rate() {
        let policy = BloomFilter::new(10);
        let mut mediocre = 0;
        let mut good = 0;
        let mut len = 1;
        while len <= 10_000 {
            let keys: Vec<Vec<u8>> = (0..len).map(int_key).collect();
            let mut filter = vec![];
            policy.append_filter(&keys, &mut filter);
            assert!(filter.len() <= (len as usize * 10 / 8) + 40, "len {}", len);

            for i in 0..len {
                assert!(
                    policy.key_may_match(&filter, &int_key(i)),
                    "length {}, key {}",
                    len,
                    i
                );
            }

            // Sample fresh keys to estimate the false positive rate.
            let mut hits = 0;
            for i in 0..10_000u32 {
                if policy.key_may_match(&filter, &int_key(i + 1_000_000_000)) {
                    hits += 1;
                }
            }
            let rate = hits as f64 / 10_000.0;
            assert!(rate <= 0.02, "rate {} at length {}", rate, len);
            if rate > 0.0125 {
                mediocre += 1;
            } else {
                good += 1;
            }
            len = if len < 10 { len + 1 } else { len * 5 }
        }
        assert!(mediocre <= good / 5, "mediocre {}, good {}", mediocre, good);
    }
}
