use anyhow::bail;
use anyhow::Result;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Minimum filter width. Tiny `expected` values would otherwise produce a
/// filter with near-certain collisions.
const MIN_BITS: u64 = 64;

/// Fixed-size probabilistic membership set.
///
/// False positives are the only permitted error; false negatives never
/// occur. Sized from `expected` insertions and a target false-positive
/// rate.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    pub fn with_estimates(expected: usize, fp_rate: f64) -> Self {
        let n = expected.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = ((-n * fp_rate.ln()) / (ln2 * ln2)).ceil() as u64;
        let num_bits = num_bits.max(MIN_BITS);
        let num_hashes = (((num_bits as f64 / n) * ln2).round() as u32).max(1);
        let words = ((num_bits + 63) / 64) as usize;
        Self { bits: vec![0; words], num_bits, num_hashes }
    }

    pub fn add(&mut self, data: &[u8]) {
        let (h1, h2) = hash_pair(data);
        for i in 0..self.num_hashes {
            let bit = index(h1, h2, i, self.num_bits);
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    pub fn test(&self, data: &[u8]) -> bool {
        let (h1, h2) = hash_pair(data);
        (0..self.num_hashes).all(|i| {
            let bit = index(h1, h2, i, self.num_bits);
            self.bits[(bit / 64) as usize] & (1 << (bit % 64)) != 0
        })
    }

    /// Test membership and insert in one pass. Returns whether the item was
    /// (probably) present before the insert.
    pub fn test_and_add(&mut self, data: &[u8]) -> bool {
        let (h1, h2) = hash_pair(data);
        let mut present = true;
        for i in 0..self.num_hashes {
            let bit = index(h1, h2, i, self.num_bits);
            let word = &mut self.bits[(bit / 64) as usize];
            let mask = 1 << (bit % 64);
            if *word & mask == 0 {
                present = false;
                *word |= mask;
            }
        }
        present
    }

    pub fn reset(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }

    /// Bitwise union with an identically-sized filter. Used to fold fork
    /// branches back together; the result tests positive for every item
    /// either side saw.
    pub fn union(&mut self, other: &BloomFilter) -> Result<()> {
        if self.num_bits != other.num_bits || self.num_hashes != other.num_hashes {
            bail!(
                "bloom shape mismatch: {}x{} vs {}x{}",
                self.num_bits,
                self.num_hashes,
                other.num_bits,
                other.num_hashes
            );
        }
        for (word, &incoming) in self.bits.iter_mut().zip(&other.bits) {
            *word |= incoming;
        }
        Ok(())
    }

    /// Number of addressable bits in the filter.
    pub fn len_bits(&self) -> u64 {
        self.num_bits
    }

    /// Number of bits currently set.
    pub fn set_bits(&self) -> u64 {
        self.bits.iter().map(|w| w.count_ones() as u64).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.bits.len() * 8);
        buf.extend_from_slice(&self.num_bits.to_le_bytes());
        buf.extend_from_slice(&self.num_hashes.to_le_bytes());
        for word in &self.bits {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            bail!("bloom image truncated: {} bytes", buf.len());
        }
        let num_bits = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let num_hashes = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let words = ((num_bits + 63) / 64) as usize;
        let body = &buf[12..];
        if body.len() != words * 8 {
            bail!("bloom image body mismatch: {} bytes for {} words", body.len(), words);
        }
        let bits = body.chunks_exact(8).map(|c| u64::from_le_bytes(c.try_into().unwrap())).collect();
        Ok(Self { bits, num_bits, num_hashes })
    }
}

fn index(h1: u64, h2: u64, i: u32, num_bits: u64) -> u64 {
    h1.wrapping_add((i as u64).wrapping_mul(h2)) % num_bits
}

fn hash_pair(data: &[u8]) -> (u64, u64) {
    (fnv1a(data, FNV_OFFSET), fnv1a(data, FNV_OFFSET ^ 0x9e3779b97f4a7c15))
}

fn fnv1a(data: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::with_estimates(1000, 0.01);
        for i in 0..1000u32 {
            filter.add(&i.to_le_bytes());
        }
        for i in 0..1000u32 {
            assert!(filter.test(&i.to_le_bytes()), "lost item {}", i);
        }
    }

    #[test]
    fn false_positive_rate_is_bounded() {
        let mut filter = BloomFilter::with_estimates(1000, 0.01);
        for i in 0..1000u32 {
            filter.add(&i.to_le_bytes());
        }
        let hits = (1000..11000u32).filter(|i| filter.test(&i.to_le_bytes())).count();
        assert!(hits < 500, "false positive rate too high: {}/10000", hits);
    }

    #[test]
    fn test_and_add_reports_prior_membership() {
        let mut filter = BloomFilter::with_estimates(100, 0.01);
        assert!(!filter.test_and_add(b"merge-commit"));
        assert!(filter.test_and_add(b"merge-commit"));
    }

    #[test]
    fn reset_clears_all_bits() {
        let mut filter = BloomFilter::with_estimates(100, 0.01);
        filter.add(b"x");
        assert!(filter.set_bits() > 0);
        filter.reset();
        assert_eq!(filter.set_bits(), 0);
        assert!(!filter.test(b"x"));
    }

    #[test]
    fn minimum_width_is_enforced() {
        let filter = BloomFilter::with_estimates(1, 0.5);
        assert!(filter.len_bits() >= MIN_BITS);
    }

    #[test]
    fn marshal_round_trip() {
        let mut filter = BloomFilter::with_estimates(500, 0.01);
        for word in ["a", "b", "c"] {
            filter.add(word.as_bytes());
        }
        let restored = BloomFilter::from_bytes(&filter.to_bytes()).unwrap();
        assert_eq!(filter, restored);
        assert!(restored.test(b"a"));
    }

    #[test]
    fn union_sees_both_sides() {
        let mut left = BloomFilter::with_estimates(100, 0.01);
        let mut right = BloomFilter::with_estimates(100, 0.01);
        left.add(b"left");
        right.add(b"right");
        left.union(&right).unwrap();
        assert!(left.test(b"left"));
        assert!(left.test(b"right"));

        let other_shape = BloomFilter::with_estimates(100_000, 0.01);
        assert!(left.union(&other_shape).is_err());
    }

    #[test]
    fn marshal_rejects_truncation() {
        let filter = BloomFilter::with_estimates(100, 0.01);
        let mut bytes = filter.to_bytes();
        bytes.truncate(bytes.len() - 3);
        assert!(BloomFilter::from_bytes(&bytes).is_err());
    }
}
