//! Bloom filter blocks.
//!
//! A filter block is a fixed-size bit array followed by a single byte
//! holding `k`, the number of probes per key, and then the standard block
//! trailer. Storing `k` in the block lets a reader probe filters that were
//! built with different parameters.
//!
//! Probing uses double hashing: one 32-bit hash of the key produces the
//! first bit position, and a rotated copy of it produces the stride for
//! the remaining probes.

use crate::block::append_block_trailer;

const BLOOM_SEED: u32 = 0xbc9f1d34;

/// 32-bit mixing hash over `data`. The constants are fixed; a filter is
/// only readable by probes computing the exact same bit positions.
fn hash(data: &[u8], seed: u32) -> u32 {
    const M: u32 = 0xc6a4_a793;
    const R: u32 = 24;
    let n = data.len();
    let mut h = seed ^ (M.wrapping_mul(n as u32));

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h = h.wrapping_add(w);
        h = h.wrapping_mul(M);
        h ^= h >> 16;
    }

    let rest = chunks.remainder();
    if !rest.is_empty() {
        if rest.len() >= 3 {
            h = h.wrapping_add((rest[2] as u32) << 16);
        }
        if rest.len() >= 2 {
            h = h.wrapping_add((rest[1] as u32) << 8);
        }
        h = h.wrapping_add(rest[0] as u32);
        h = h.wrapping_mul(M);
        h ^= h >> R;
    }
    h
}

fn bloom_hash(key: &[u8]) -> u32 {
    hash(key, BLOOM_SEED)
}

/// Builds one bloom filter covering the keys of a single table.
pub struct BloomBlock {
    space: Vec<u8>,
    bits: u64,
    k: usize,
    finished: bool,
}

impl BloomBlock {
    /// Creates a filter of `size` bytes sized for `bits_per_key`. The
    /// probe count is derived from `bits_per_key` and clamped to [1, 30].
    pub fn new(bits_per_key: usize, size: usize) -> Self {
        let mut space = Vec::with_capacity(size + 1 + crate::format::BLOCK_TRAILER_SIZE);
        space.resize(size, 0);
        // 0.69 =~ ln 2, rounded down to cut probing cost a little.
        let k = ((bits_per_key as f64) * 0.69) as usize;
        let k = k.clamp(1, 30);
        space.push(k as u8);
        Self {
            space,
            bits: 8 * size as u64,
            k,
            finished: false,
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        debug_assert!(!self.finished);
        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..self.k {
            let bitpos = (h as u64) % self.bits;
            self.space[(bitpos / 8) as usize] |= 1 << (bitpos % 8);
            h = h.wrapping_add(delta);
        }
    }

    /// Seals the filter and returns the size of its contents, the bit
    /// array plus the trailing `k` byte.
    pub fn finish(&mut self) -> usize {
        debug_assert!(!self.finished);
        self.finished = true;
        self.space.len()
    }

    /// Appends the block trailer and returns the full filter block bytes.
    pub fn finalize(mut self) -> Vec<u8> {
        debug_assert!(self.finished);
        append_block_trailer(&mut self.space, 0);
        self.space
    }

    pub fn contents(&self) -> &[u8] {
        &self.space
    }
}

/// Probes a filter's contents (bit array plus `k` byte, no trailer) for
/// `key`. Degenerate or unrecognized filters match everything so a bad
/// filter can only cost extra reads, never hide data.
pub fn bloom_key_may_match(key: &[u8], filter: &[u8]) -> bool {
    let len = filter.len();
    if len < 2 {
        return true;
    }

    let bits = (len as u64 - 1) * 8;
    let k = filter[len - 1] as usize;
    if k > 30 {
        // Reserved for future filter encodings.
        return true;
    }

    let mut h = bloom_hash(key);
    let delta = h.rotate_right(17);
    for _ in 0..k {
        let bitpos = (h as u64) % bits;
        if (filter[(bitpos / 8) as usize] & (1 << (bitpos % 8))) == 0 {
            return false;
        }
        h = h.wrapping_add(delta);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn filter_with_keys(keys: &[&[u8]], bits_per_key: usize, size: usize) -> Vec<u8> {
        let mut bloom = BloomBlock::new(bits_per_key, size);
        for key in keys {
            bloom.add_key(key);
        }
        bloom.finish();
        bloom.contents().to_vec()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(bloom_key_may_match(b"anything", &[]));
        assert!(bloom_key_may_match(b"anything", &[0x01]));
    }

    #[test]
    fn test_unknown_probe_count_matches() {
        // k > 30 is reserved and must not reject keys.
        let filter = vec![0u8, 0, 0, 0, 31];
        assert!(bloom_key_may_match(b"anything", &filter));
    }

    #[test]
    fn test_k_is_stored_in_last_byte() {
        let bloom = BloomBlock::new(10, 64);
        assert_eq!(*bloom.contents().last().unwrap(), 6);

        // Clamped at both ends.
        let bloom = BloomBlock::new(1, 64);
        assert_eq!(*bloom.contents().last().unwrap(), 1);
        let bloom = BloomBlock::new(100, 64);
        assert_eq!(*bloom.contents().last().unwrap(), 30);
    }

    #[test]
    fn test_no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..1000u32).map(|i| i.to_le_bytes().to_vec()).collect();
        let refs: Vec<&[u8]> = keys.iter().map(|k| k.as_slice()).collect();
        let filter = filter_with_keys(&refs, 10, 10 * keys.len() / 8);
        for key in &keys {
            assert!(bloom_key_may_match(key, &filter), "lost key {:?}", key);
        }
    }

    #[test]
    fn test_finalize_has_trailer() {
        let mut bloom = BloomBlock::new(8, 32);
        bloom.add_key(b"alpha");
        let contents_len = bloom.finish();
        let block = bloom.finalize();
        assert_eq!(block.len(), contents_len + crate::format::BLOCK_TRAILER_SIZE);
        assert_eq!(block[contents_len], 0); // uncompressed type tag
    }

    #[test]
    fn test_false_positive_rate() {
        const N: usize = 10_000;
        let mut rng = StdRng::seed_from_u64(301);
        let keys: Vec<[u8; 16]> = (0..N).map(|_| rng.gen()).collect();

        let mut bloom = BloomBlock::new(10, 10 * N / 8);
        for key in &keys {
            bloom.add_key(key);
        }
        bloom.finish();
        let filter = bloom.contents();

        for key in &keys {
            assert!(bloom_key_may_match(key, filter));
        }

        let mut false_positives = 0;
        for _ in 0..N {
            let probe: [u8; 24] = rng.gen();
            if bloom_key_may_match(&probe, filter) {
                false_positives += 1;
            }
        }
        let rate = false_positives as f64 / N as f64;
        assert!(rate >= 0.005, "suspiciously low fp rate: {rate}");
        assert!(rate <= 0.03, "fp rate too high: {rate}");
    }
}
