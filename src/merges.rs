use crate::bloom::BloomFilter;
use crate::core::CommitHash;

const EXPECTED_MERGES: usize = 20_000;
const FP_RATE: f64 = 0.01;

/// Probabilistic dedup of merge-commit hashes.
///
/// A merge commit can reach the same analyzer more than once when the
/// history walk crosses it along several parents; the tracker guarantees
/// its contribution is recorded at most once. A false positive drops a
/// merge commit entirely, which is the accepted trade for bounded memory.
///
/// Forks each own their tracker: forks process disjoint commit ranges, so
/// trackers are never merged across branches.
#[derive(Debug, Clone)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MergeTracker {
    filter: BloomFilter,
}

impl MergeTracker {
    pub fn new() -> Self {
        Self { filter: BloomFilter::with_estimates(EXPECTED_MERGES, FP_RATE) }
    }

    /// Record the hash; returns whether it was (probably) seen before.
    pub fn seen_before_add(&mut self, hash: &CommitHash) -> bool {
        self.filter.test_and_add(hash.as_bytes())
    }

    pub fn seen(&self, hash: &CommitHash) -> bool {
        self.filter.test(hash.as_bytes())
    }

    /// Chunk-scoped state shedding: hibernation resets the tracker.
    pub fn reset(&mut self) {
        self.filter.reset();
    }
}

impl Default for MergeTracker {
    fn default() -> Self {
        Self::new()
    }
}
