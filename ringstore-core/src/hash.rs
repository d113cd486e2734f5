//! Murmur3 (x86, 32-bit) hashing
//!
//! Used both for routing keys onto the ring and for content checksums.
//! The incremental hasher yields the same value as the block hasher no
//! matter how the input is split.

/// Seed used for every hash computed by the store
pub const DEFAULT_SEED: u32 = 0;

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

#[inline]
fn mix_k(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

#[inline]
fn mix_h(h: u32, k: u32) -> u32 {
    (h ^ mix_k(k))
        .rotate_left(13)
        .wrapping_mul(5)
        .wrapping_add(0xe654_6b64)
}

#[inline]
fn mix_tail(h: u32, tail: &[u8]) -> u32 {
    if tail.is_empty() {
        return h;
    }
    let k = tail
        .iter()
        .enumerate()
        .fold(0u32, |k, (i, b)| k | (u32::from(*b) << (8 * i)));
    h ^ mix_k(k)
}

#[inline]
fn fmix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

/// Hash a complete buffer
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        h = mix_h(h, u32::from_le_bytes([block[0], block[1], block[2], block[3]]));
    }
    let h = mix_tail(h, blocks.remainder());
    // Length is folded in modulo 2^32, as in the reference algorithm
    fmix(h ^ data.len() as u32)
}

/// Hasher fed in arbitrary pieces
pub trait StreamingHasher: Send {
    /// Feed more bytes
    fn update(&mut self, data: &[u8]);

    /// Hash of everything fed so far
    fn finish(&self) -> u32;
}

/// Incremental murmur3 hasher
#[derive(Debug, Clone)]
pub struct IncrementalMurmur3 {
    h: u32,
    pending: [u8; 4],
    pending_len: usize,
    total_len: u64,
}

impl IncrementalMurmur3 {
    pub fn new(seed: u32) -> Self {
        Self {
            h: seed,
            pending: [0; 4],
            pending_len: 0,
            total_len: 0,
        }
    }

    /// Total number of bytes fed so far
    pub fn len(&self) -> u64 {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }
}

impl Default for IncrementalMurmur3 {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl StreamingHasher for IncrementalMurmur3 {
    fn update(&mut self, data: &[u8]) {
        self.total_len += data.len() as u64;
        let mut input = data;

        if self.pending_len > 0 {
            let take = (4 - self.pending_len).min(input.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&input[..take]);
            self.pending_len += take;
            input = &input[take..];
            if self.pending_len < 4 {
                return;
            }
            self.h = mix_h(self.h, u32::from_le_bytes(self.pending));
            self.pending_len = 0;
        }

        let mut blocks = input.chunks_exact(4);
        for block in &mut blocks {
            self.h = mix_h(
                self.h,
                u32::from_le_bytes([block[0], block[1], block[2], block[3]]),
            );
        }
        let rest = blocks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn finish(&self) -> u32 {
        let h = mix_tail(self.h, &self.pending[..self.pending_len]);
        fmix(h ^ self.total_len as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reference_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(
            murmur3_32(b"The quick brown fox jumps over the lazy dog", 0),
            0x2e4f_f723
        );
        assert_eq!(murmur3_32(b"testSimple2a", 0), 0xdb36_e25e);
    }

    #[test]
    fn test_incremental_matches_block() {
        let data = b"The quick brown fox jumps over the lazy dog";
        let mut hasher = IncrementalMurmur3::default();
        hasher.update(&data[..3]);
        hasher.update(&data[3..4]);
        hasher.update(&data[4..17]);
        hasher.update(&[]);
        hasher.update(&data[17..]);
        assert_eq!(hasher.finish(), murmur3_32(data, DEFAULT_SEED));
        assert_eq!(hasher.len(), data.len() as u64);
    }

    #[test]
    fn test_incremental_empty() {
        let hasher = IncrementalMurmur3::default();
        assert!(hasher.is_empty());
        assert_eq!(hasher.finish(), 0);
    }

    proptest! {
        #[test]
        fn prop_split_does_not_change_hash(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            cuts in proptest::collection::vec(any::<usize>(), 0..8),
        ) {
            let mut points: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
            points.sort_unstable();

            let mut hasher = IncrementalMurmur3::default();
            let mut last = 0;
            for point in points {
                hasher.update(&data[last..point]);
                last = point;
            }
            hasher.update(&data[last..]);

            prop_assert_eq!(hasher.finish(), murmur3_32(&data, DEFAULT_SEED));
        }
    }
}
