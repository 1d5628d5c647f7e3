use anyhow::Result;

use crate::aggregate::Aggregator;
use crate::core::Config;
use crate::core::Tc;
use crate::couples::CouplesAggregator;
use crate::couples::CouplesAnalyzer;
use crate::imports;
use crate::imports::ImportsAnalyzer;
use crate::plumbing::Context;
use crate::shotness::ShotnessAggregator;
use crate::shotness::ShotnessAnalyzer;
use crate::typos;
use crate::typos::TyposAnalyzer;

/// One history analyzer's working half: per-commit consumption plus the
/// parallel/hibernation/checkpoint capabilities the runner probes for.
///
/// Forks hold their own mutable working state (Bloom filters, trackers)
/// and share configuration only; `merge` folds branch state back
/// additively and never combines merge trackers, because forks process
/// disjoint commit ranges.
pub trait HistoryAnalyzer: Send {
    fn id(&self) -> &'static str;
    /// Short flag used for deterministic ordering in the time series.
    fn flag(&self) -> &'static str;
    fn consume(&mut self, ctx: &Context) -> Result<Tc>;
    fn make_aggregator(&self, config: &Config) -> Result<Box<dyn Aggregator>>;

    /// Must run on the main thread in commit order.
    fn sequential_only(&self) -> bool {
        false
    }

    /// Worth dispatching to the worker pool.
    fn cpu_heavy(&self) -> bool {
        false
    }

    /// Produce `n` clones for the worker pool; empty means not forkable.
    fn fork(&self, _n: usize) -> Vec<Box<dyn HistoryAnalyzer>> {
        Vec::new()
    }

    /// Fold branch state back into the canonical analyzer.
    fn merge(&mut self, _branches: Vec<Box<dyn HistoryAnalyzer>>) {}

    /// Shed chunk-scoped working state; cumulative state survives.
    fn hibernate(&mut self) {}

    /// Re-arm chunk-scoped state after hibernation.
    fn boot(&mut self) {}

    /// Serialize resumable state; None when there is nothing to persist.
    fn checkpoint(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn restore(&mut self, _image: &[u8]) -> Result<()> {
        Ok(())
    }
}

pub struct CouplesHistory {
    inner: CouplesAnalyzer,
}

impl CouplesHistory {
    pub fn new() -> Self {
        Self { inner: CouplesAnalyzer::new() }
    }
}

impl HistoryAnalyzer for CouplesHistory {
    fn id(&self) -> &'static str {
        "couples"
    }

    fn flag(&self) -> &'static str {
        "couples"
    }

    fn consume(&mut self, ctx: &Context) -> Result<Tc> {
        self.inner.consume(ctx)
    }

    fn make_aggregator(&self, config: &Config) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(CouplesAggregator::new(config)))
    }

    // Merge-mode coupling reads the cumulative seen_files filter, which
    // only makes sense in chronological order.
    fn sequential_only(&self) -> bool {
        true
    }

    fn hibernate(&mut self) {
        self.inner.hibernate();
    }

    fn checkpoint(&self) -> Result<Option<Vec<u8>>> {
        Ok(Some(self.inner.checkpoint_bytes()?))
    }

    fn restore(&mut self, image: &[u8]) -> Result<()> {
        self.inner.restore_bytes(image)
    }
}

pub struct ShotnessHistory {
    inner: ShotnessAnalyzer,
}

impl ShotnessHistory {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self { inner: ShotnessAnalyzer::new(config)? })
    }

    fn from_inner(inner: ShotnessAnalyzer) -> Self {
        Self { inner }
    }
}

impl HistoryAnalyzer for ShotnessHistory {
    fn id(&self) -> &'static str {
        "shotness"
    }

    fn flag(&self) -> &'static str {
        "shotness"
    }

    fn consume(&mut self, ctx: &Context) -> Result<Tc> {
        self.inner.consume(ctx)
    }

    fn make_aggregator(&self, config: &Config) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(ShotnessAggregator::new(config)))
    }

    fn cpu_heavy(&self) -> bool {
        true
    }

    fn fork(&self, n: usize) -> Vec<Box<dyn HistoryAnalyzer>> {
        (0..n)
            .map(|_| {
                Box::new(ShotnessHistory::from_inner(self.inner.fork_clone()))
                    as Box<dyn HistoryAnalyzer>
            })
            .collect()
    }

    fn merge(&mut self, branches: Vec<Box<dyn HistoryAnalyzer>>) {
        for branch in branches {
            // Downcast through the checkpoint image: branches are always
            // our own forks, so the registry round-trips losslessly.
            if let Ok(Some(image)) = branch.checkpoint() {
                let mut registry = ShotnessAnalyzer::new(&Config::default())
                    .expect("default shotness queries parse");
                if registry.restore_bytes(&image).is_ok() {
                    self.inner.absorb(registry);
                }
            }
        }
    }

    fn hibernate(&mut self) {
        self.inner.hibernate();
    }

    fn checkpoint(&self) -> Result<Option<Vec<u8>>> {
        Ok(Some(self.inner.checkpoint_bytes()?))
    }

    fn restore(&mut self, image: &[u8]) -> Result<()> {
        self.inner.restore_bytes(image)
    }
}

pub struct ImportsHistory {
    inner: ImportsAnalyzer,
}

impl ImportsHistory {
    pub fn new() -> Self {
        Self { inner: ImportsAnalyzer::new() }
    }
}

impl HistoryAnalyzer for ImportsHistory {
    fn id(&self) -> &'static str {
        "imports"
    }

    fn flag(&self) -> &'static str {
        "imports"
    }

    fn consume(&mut self, ctx: &Context) -> Result<Tc> {
        self.inner.consume(ctx)
    }

    fn make_aggregator(&self, config: &Config) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(imports::make_aggregator(config)))
    }
}

pub struct TyposHistory {
    inner: TyposAnalyzer,
}

impl TyposHistory {
    pub fn new() -> Self {
        Self { inner: TyposAnalyzer::new() }
    }
}

impl HistoryAnalyzer for TyposHistory {
    fn id(&self) -> &'static str {
        "typos"
    }

    fn flag(&self) -> &'static str {
        "typos"
    }

    fn consume(&mut self, ctx: &Context) -> Result<Tc> {
        self.inner.consume(ctx)
    }

    fn make_aggregator(&self, config: &Config) -> Result<Box<dyn Aggregator>> {
        Ok(Box::new(typos::make_aggregator(config)))
    }

    fn cpu_heavy(&self) -> bool {
        true
    }

    fn fork(&self, n: usize) -> Vec<Box<dyn HistoryAnalyzer>> {
        (0..n).map(|_| Box::new(TyposHistory::new()) as Box<dyn HistoryAnalyzer>).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_probes() {
        let couples = CouplesHistory::new();
        assert!(couples.sequential_only());
        assert!(!couples.cpu_heavy());
        assert!(couples.fork(2).is_empty());

        let shotness = ShotnessHistory::new(&Config::default()).unwrap();
        assert!(shotness.cpu_heavy());
        assert_eq!(shotness.fork(3).len(), 3);

        let typos = TyposHistory::new();
        assert!(typos.cpu_heavy());
        assert_eq!(typos.fork(2).len(), 2);
    }

    #[test]
    fn couples_checkpoint_round_trips_seen_files() {
        let mut original = CouplesHistory::new();
        original.inner.consume(&crate::plumbing::Context {
            time: 0,
            index: 0,
            hash: crate::core::CommitHash::from_bytes([1; 20]),
            is_merge: false,
            author_id: 0,
            author: "a <a@x>".into(),
            tick: 0,
            tree_changes: vec![crate::plumbing::TreeChange {
                kind: crate::plumbing::ChangeKind::Insert,
                old_name: None,
                new_name: Some("seen.rs".into()),
            }],
            blob_cache: Default::default(),
            file_diffs: Vec::new(),
            uast_changes: Vec::new(),
        })
        .unwrap();

        let image = original.checkpoint().unwrap().unwrap();
        let mut restored = CouplesHistory::new();
        restored.restore(&image).unwrap();
        assert!(restored.inner.seen_files().test(b"seen.rs"));
    }
}
