use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::DrainedStats;
use crate::core::Tc;
use crate::core::Tick;
use crate::core::TickRecord;
use crate::spill::SpillState;
use crate::spill::SpillStore;
use crate::store::RecordWriter;

#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    /// Store-writer dispatch handed an aggregator of the wrong analyzer.
    #[error("unexpected aggregator: expected {expected}, got {actual}")]
    UnexpectedAggregator { expected: &'static str, actual: &'static str },
}

/// Read access to the repository as of the last consumed commit. The store
/// writers use it to restrict output to currently-existing files and to
/// count blob lines; tests substitute fakes.
pub trait RepoAccess {
    /// Files present in the tree of the last commit, or None when the run
    /// had no commits.
    fn current_files(&self) -> Option<Vec<String>>;
    /// Line count of one current file's blob.
    fn count_lines(&self, file: &str) -> Option<usize>;
}

/// Capability: per-chunk drain of commit summaries for the time series.
pub trait CommitStatsDrainer {
    /// Extract and clear the per-commit summary data and the per-tick
    /// commit ordering.
    fn drain_commit_stats(&mut self) -> DrainedStats;
}

/// Capability: write records straight from aggregator state instead of
/// going through the TICK -> Report path.
pub trait DirectStoreWriter {
    fn write_to_store(&mut self, writer: &mut RecordWriter, repo: &dyn RepoAccess) -> Result<()>;
}

/// The polymorphic aggregator capability set. The registry is flat;
/// dispatch is by capability probe, not by inheritance.
pub trait Aggregator: Send {
    fn add(&mut self, tc: Tc) -> Result<()>;
    fn flush_tick(&mut self, tick: Tick) -> TickRecord;
    /// Ticks ascending by tick index; None if empty.
    fn flush_all_ticks(&mut self) -> Result<Option<Vec<TickRecord>>>;
    fn spill(&mut self) -> Result<()>;
    fn collect(&mut self) -> Result<()>;
    fn estimated_state_size(&self) -> usize;
    fn spill_state(&self) -> SpillState;
    fn restore_spill_state(&mut self, state: SpillState);
    /// Idempotent; removes spill files.
    fn close(&mut self) -> Result<()>;

    fn as_commit_stats_drainer(&mut self) -> Option<&mut dyn CommitStatsDrainer> {
        None
    }

    fn as_direct_store_writer(&mut self) -> Option<&mut dyn DirectStoreWriter> {
        None
    }
}

/// The four hooks that specialize a [GenericAggregator] to one analyzer.
pub trait TickSemantics: Send {
    type State: Serialize + DeserializeOwned + Default + Send;

    /// Apply one commit's contribution to the per-tick state.
    fn extract(&self, tc: &Tc, state: &mut Self::State) -> Result<()>;
    /// Combine two states for the same tick during spill-reload.
    fn merge(&self, existing: Self::State, incoming: Self::State) -> Self::State;
    /// Estimate the in-memory footprint of one tick's state.
    fn size(&self, state: &Self::State) -> usize;
    /// Finalize one tick.
    fn build(&self, tick: Tick, state: &Self::State) -> TickRecord;
}

/// Reusable per-tick accumulator for accumulation-style analyzers.
///
/// `add` applies the extract hook, then spills the whole per-tick map once
/// the estimated size exceeds the budget; subsequent adds begin a fresh
/// generation. `collect` merges spilled generations back with the merge
/// hook.
pub struct GenericAggregator<X: TickSemantics> {
    semantics: X,
    by_tick: BTreeMap<Tick, X::State>,
    store: SpillStore<X::State>,
    spill_budget: usize,
    closed: bool,
}

impl<X: TickSemantics> GenericAggregator<X> {
    pub fn new<P: AsRef<Path>>(semantics: X, tmp_dir: P, spill_budget: usize) -> Self {
        Self {
            semantics,
            by_tick: BTreeMap::new(),
            store: SpillStore::new(tmp_dir),
            spill_budget,
            closed: false,
        }
    }

    pub fn semantics(&self) -> &X {
        &self.semantics
    }
}

impl<X: TickSemantics> Aggregator for GenericAggregator<X> {
    fn add(&mut self, tc: Tc) -> Result<()> {
        let state = self.by_tick.entry(tc.tick).or_default();
        self.semantics.extract(&tc, state)?;
        if self.spill_budget > 0 && self.estimated_state_size() > self.spill_budget {
            self.spill().context("spill over budget during add")?;
        }
        Ok(())
    }

    fn flush_tick(&mut self, tick: Tick) -> TickRecord {
        match self.by_tick.get(&tick) {
            Some(state) => self.semantics.build(tick, state),
            None => self.semantics.build(tick, &X::State::default()),
        }
    }

    fn flush_all_ticks(&mut self) -> Result<Option<Vec<TickRecord>>> {
        if self.by_tick.is_empty() {
            return Ok(None);
        }
        let records =
            self.by_tick.iter().map(|(&tick, state)| self.semantics.build(tick, state)).collect();
        Ok(Some(records))
    }

    fn spill(&mut self) -> Result<()> {
        for (tick, state) in std::mem::take(&mut self.by_tick) {
            self.store.put(tick.to_string(), state);
        }
        self.store.spill()
    }

    fn collect(&mut self) -> Result<()> {
        let merged = self.store.collect_with(|a, b| self.semantics.merge(a, b))?;
        for (key, state) in merged {
            let tick: Tick = key.parse().with_context(|| format!("bad spill key {:?}", key))?;
            match self.by_tick.remove(&tick) {
                Some(existing) => {
                    self.by_tick.insert(tick, self.semantics.merge(existing, state));
                }
                None => {
                    self.by_tick.insert(tick, state);
                }
            }
        }
        Ok(())
    }

    fn estimated_state_size(&self) -> usize {
        self.by_tick.values().map(|state| self.semantics.size(state)).sum()
    }

    fn spill_state(&self) -> SpillState {
        self.store.spill_state()
    }

    fn restore_spill_state(&mut self, state: SpillState) {
        self.store.restore_from_dir(state);
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.by_tick.clear();
        self.store.cleanup()
    }
}
