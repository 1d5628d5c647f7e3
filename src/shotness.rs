use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::Result;
use itertools::Itertools;

use crate::aggregate::AggregateError;
use crate::aggregate::Aggregator;
use crate::aggregate::CommitStatsDrainer;
use crate::core::CommitHash;
use crate::core::Config;
use crate::core::DrainedStats;
use crate::core::Tc;
use crate::core::TcData;
use crate::core::Tick;
use crate::core::TickRecord;
use crate::merges::MergeTracker;
use crate::plumbing::Context;
use crate::plumbing::DiffOp;
use crate::plumbing::FileDiff;
use crate::spill::SpillState;
use crate::spill::SpillStore;
use crate::uast::NameQuery;
use crate::uast::NodeQuery;
use crate::uast::UastNode;

pub const DSL_STRUCT_DEFAULT: &str = "//*[@role='Function']";
pub const DSL_NAME_DEFAULT: &str = "@name";

/// Commits touching more nodes than this skip the coupling maps (mass
/// refactor); the pair count is still recorded in the commit stats.
const MAX_COUPLING_NODES: usize = 500;

const NODE_BYTES: usize = 150;
const COUPLING_ENTRY_BYTES: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct NodeSummary {
    pub kind: String,
    pub name: String,
    pub file: String,
}

impl NodeSummary {
    pub fn key(&self) -> String {
        format!("{}_{}_{}", self.kind, self.name, self.file)
    }
}

#[derive(Debug, Clone)]
pub struct ShotnessDelta {
    pub summary: NodeSummary,
    pub count_delta: u32,
}

/// Per-commit payload: the structural nodes this commit touched.
#[derive(Debug, Clone, Default)]
pub struct ShotnessCommitData {
    pub nodes_touched: BTreeMap<String, ShotnessDelta>,
}

/// Tracks structural node hotness from UAST changes.
pub struct ShotnessAnalyzer {
    merges: MergeTracker,
    struct_query: NodeQuery,
    name_query: NameQuery,
    // Registered nodes, for rename rewrites and file deletions.
    nodes: HashMap<String, NodeSummary>,
    files: HashMap<String, HashSet<String>>,
}

impl ShotnessAnalyzer {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            merges: MergeTracker::new(),
            struct_query: NodeQuery::parse(&config.shotness_struct)?,
            name_query: NameQuery::parse(&config.shotness_name)?,
            nodes: HashMap::new(),
            files: HashMap::new(),
        })
    }

    pub fn consume(&mut self, ctx: &Context) -> Result<Tc> {
        if ctx.is_merge && self.merges.seen_before_add(&ctx.hash) {
            return Ok(Tc::empty(ctx.tick, ctx.author_id, ctx.hash));
        }

        let diffs_by_file: HashMap<&str, &FileDiff> =
            ctx.file_diffs.iter().map(|d| (d.file.as_str(), d)).collect();
        let mut seen: BTreeMap<String, NodeSummary> = BTreeMap::new();

        for change in &ctx.uast_changes {
            match (&change.before, &change.after) {
                (Some(_), None) => {
                    if let Some(old) = &change.file_before {
                        self.forget_file(old);
                    }
                }
                (None, Some(after)) => {
                    let file = change.file_after.as_deref().unwrap_or("");
                    for node in self.struct_query.select(after) {
                        let name = self.name_query.apply(node).to_string();
                        if !name.is_empty() {
                            self.add_node(&name, node, file, &mut seen);
                        }
                    }
                }
                (Some(before), Some(after)) => {
                    let old_file = change.file_before.as_deref().unwrap_or("");
                    let new_file = change.file_after.as_deref().unwrap_or("");
                    if old_file != new_file {
                        self.rename_file(old_file, new_file);
                    }

                    let before_index = self.line_index(before);
                    let after_index = self.line_index(after);
                    let Some(diff) = diffs_by_file.get(new_file) else {
                        continue;
                    };
                    for run in &diff.runs {
                        let index = match run.op {
                            DiffOp::Delete => &before_index,
                            DiffOp::Insert => &after_index,
                        };
                        for line in run.start..=run.end {
                            let Some(hits) = index.get(&line) else {
                                continue;
                            };
                            for &(ref name, node) in hits {
                                self.add_node(name, node, new_file, &mut seen);
                            }
                        }
                    }
                }
                (None, None) => {}
            }
        }

        if seen.is_empty() {
            return Ok(Tc::empty(ctx.tick, ctx.author_id, ctx.hash));
        }

        let nodes_touched = seen
            .into_iter()
            .map(|(key, summary)| (key, ShotnessDelta { summary, count_delta: 1 }))
            .collect();
        Ok(Tc {
            tick: ctx.tick,
            author_id: ctx.author_id,
            commit_hash: ctx.hash,
            data: TcData::Shotness(ShotnessCommitData { nodes_touched }),
        })
    }

    /// Register the node for this commit. The count moves at most once per
    /// commit per key, no matter how many edits land on it.
    fn add_node(
        &mut self,
        name: &str,
        node: &UastNode,
        file: &str,
        seen: &mut BTreeMap<String, NodeSummary>,
    ) {
        let summary =
            NodeSummary { kind: node.kind.clone(), name: name.to_string(), file: file.to_string() };
        let key = summary.key();
        if seen.contains_key(&key) {
            return;
        }
        self.nodes.entry(key.clone()).or_insert_with(|| summary.clone());
        self.files.entry(file.to_string()).or_default().insert(key.clone());
        seen.insert(key, summary);
    }

    fn forget_file(&mut self, file: &str) {
        if let Some(keys) = self.files.remove(file) {
            for key in keys {
                self.nodes.remove(&key);
            }
        }
    }

    fn rename_file(&mut self, old_file: &str, new_file: &str) {
        let Some(keys) = self.files.remove(old_file) else {
            return;
        };
        let mut renamed = HashSet::with_capacity(keys.len());
        for key in keys {
            if let Some(mut summary) = self.nodes.remove(&key) {
                summary.file = new_file.to_string();
                let new_key = summary.key();
                renamed.insert(new_key.clone());
                self.nodes.insert(new_key, summary);
            }
        }
        self.files.entry(new_file.to_string()).or_default().extend(renamed);
    }

    /// Map each line to the selected nodes whose span covers it. When a
    /// node's end does not advance past its start, the span is widened to
    /// the maximum line of its subtree, pre-order.
    fn line_index<'t>(&self, tree: &'t UastNode) -> HashMap<u32, Vec<(String, &'t UastNode)>> {
        let mut index: HashMap<u32, Vec<(String, &'t UastNode)>> = HashMap::new();
        for node in self.struct_query.select(tree) {
            let name = self.name_query.apply(node).to_string();
            if name.is_empty() {
                continue;
            }
            let start = node.start_line;
            let mut end = node.end_line;
            if end <= start {
                end = subtree_max_line(node);
            }
            for line in start..=end {
                index.entry(line).or_default().push((name.clone(), node));
            }
        }
        index
    }

    pub fn hibernate(&mut self) {
        self.merges.reset();
    }

    /// Clone for a fork branch: the registry snapshot travels with the
    /// branch, the merge tracker is its own.
    pub fn fork_clone(&self) -> Self {
        Self {
            merges: self.merges.clone(),
            struct_query: self.struct_query.clone(),
            name_query: self.name_query,
            nodes: self.nodes.clone(),
            files: self.files.clone(),
        }
    }

    /// Fold one branch's registry back in. Merge trackers are not
    /// combined: branches processed disjoint commit ranges.
    pub fn absorb(&mut self, branch: Self) {
        for (key, summary) in branch.nodes {
            self.nodes.entry(key).or_insert(summary);
        }
        for (file, keys) in branch.files {
            self.files.entry(file).or_default().extend(keys);
        }
    }

    pub fn checkpoint_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(&self.nodes, &self.files))?)
    }

    pub fn restore_bytes(&mut self, image: &[u8]) -> Result<()> {
        let (nodes, files) = bincode::deserialize(image)?;
        self.nodes = nodes;
        self.files = files;
        Ok(())
    }
}

fn subtree_max_line(node: &UastNode) -> u32 {
    let mut max = node.start_line.max(node.end_line);
    node.walk(&mut |n| {
        max = max.max(n.start_line).max(n.end_line);
    });
    max
}

#[derive(Debug, Clone, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct NodeAcc {
    pub summary: NodeSummary,
    pub count: u32,
    pub couples: HashMap<String, u32>,
}

#[derive(Debug, Clone)]
#[derive(serde::Serialize)]
struct ShotnessCommitStat {
    nodes: usize,
    coupling_pairs: u64,
}

/// Cumulative node-hotness aggregator with symmetric coupling maps.
pub struct ShotnessAggregator {
    nodes: SpillStore<NodeAcc>,
    commit_stats: HashMap<String, ShotnessCommitStat>,
    commits_by_tick: BTreeMap<Tick, Vec<CommitHash>>,
    spill_budget: usize,
    last_tick: Tick,
    closed: bool,
}

impl ShotnessAggregator {
    pub fn new(config: &Config) -> Self {
        Self {
            nodes: SpillStore::new(&config.tmp_dir),
            commit_stats: HashMap::new(),
            commits_by_tick: BTreeMap::new(),
            spill_budget: config.spill_budget,
            last_tick: 0,
            closed: false,
        }
    }

    fn add_shotness(&mut self, tc: &Tc, data: &ShotnessCommitData) -> Result<()> {
        for (key, delta) in &data.nodes_touched {
            let acc = self.nodes.entry_or_default(key);
            if acc.summary.kind.is_empty() {
                acc.summary = delta.summary.clone();
            }
            acc.count += delta.count_delta;
        }

        let n = data.nodes_touched.len();
        let pairs = (n as u64) * (n as u64 - 1) / 2;
        if (2..=MAX_COUPLING_NODES).contains(&n) {
            let keys: Vec<&str> = data.nodes_touched.keys().map(|k| k.as_str()).collect();
            for i in 0..keys.len() {
                for j in i + 1..keys.len() {
                    let (k1, k2) = (keys[i], keys[j]);
                    *self.nodes.entry_or_default(k1).couples.entry(k2.to_string()).or_default() +=
                        1;
                    *self.nodes.entry_or_default(k2).couples.entry(k1.to_string()).or_default() +=
                        1;
                }
            }
        }

        self.last_tick = self.last_tick.max(tc.tick);
        self.commit_stats.insert(
            tc.commit_hash.to_string(),
            ShotnessCommitStat { nodes: n, coupling_pairs: pairs },
        );
        self.commits_by_tick.entry(tc.tick).or_default().push(tc.commit_hash);

        if self.spill_budget > 0 && self.estimated_state_size() > self.spill_budget {
            self.nodes.spill()?;
        }
        Ok(())
    }

    fn report(&mut self) -> Result<serde_json::Value> {
        let merged = self.nodes.collect_with(merge_accs)?;
        for (key, acc) in &merged {
            self.nodes.put(key.clone(), acc.clone());
        }

        let keys: Vec<&String> = merged.keys().sorted().collect();
        let index: HashMap<&str, usize> =
            keys.iter().enumerate().map(|(i, k)| (k.as_str(), i)).collect();

        let nodes: Vec<serde_json::Value> = keys
            .iter()
            .map(|key| {
                let acc = &merged[*key];
                serde_json::json!({
                    "kind": acc.summary.kind,
                    "name": acc.summary.name,
                    "file": acc.summary.file,
                    "count": acc.count,
                })
            })
            .collect();

        let counters: Vec<BTreeMap<usize, u32>> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let acc = &merged[*key];
                let mut row: BTreeMap<usize, u32> = acc
                    .couples
                    .iter()
                    .filter_map(|(other, &count)| {
                        index.get(other.as_str()).map(|&j| (j, count))
                    })
                    .collect();
                row.insert(i, acc.count);
                row
            })
            .collect();

        Ok(serde_json::json!({ "Nodes": nodes, "Counters": counters }))
    }
}

impl Aggregator for ShotnessAggregator {
    fn add(&mut self, tc: Tc) -> Result<()> {
        match &tc.data {
            TcData::Shotness(data) => {
                let data = data.clone();
                self.add_shotness(&tc, &data)
            }
            TcData::None => Ok(()),
            other => Err(AggregateError::UnexpectedAggregator {
                expected: "shotness",
                actual: other.label(),
            }
            .into()),
        }
    }

    fn flush_tick(&mut self, tick: Tick) -> TickRecord {
        let data = self.report().unwrap_or(serde_json::Value::Null);
        TickRecord { tick, data }
    }

    fn flush_all_ticks(&mut self) -> Result<Option<Vec<TickRecord>>> {
        if self.nodes.is_empty() && self.nodes.spill_count() == 0 {
            return Ok(None);
        }
        let data = self.report()?;
        Ok(Some(vec![TickRecord { tick: self.last_tick, data }]))
    }

    fn spill(&mut self) -> Result<()> {
        self.nodes.spill()
    }

    fn collect(&mut self) -> Result<()> {
        let merged = self.nodes.collect_with(merge_accs)?;
        for (key, acc) in merged {
            self.nodes.put(key, acc);
        }
        Ok(())
    }

    fn estimated_state_size(&self) -> usize {
        self.nodes
            .current()
            .values()
            .map(|acc| NODE_BYTES + acc.couples.len() * COUPLING_ENTRY_BYTES)
            .sum()
    }

    fn spill_state(&self) -> SpillState {
        self.nodes.spill_state()
    }

    fn restore_spill_state(&mut self, state: SpillState) {
        self.nodes.restore_from_dir(state);
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.nodes.cleanup()
    }

    fn as_commit_stats_drainer(&mut self) -> Option<&mut dyn CommitStatsDrainer> {
        Some(self)
    }
}

impl CommitStatsDrainer for ShotnessAggregator {
    fn drain_commit_stats(&mut self) -> DrainedStats {
        let commit_data = std::mem::take(&mut self.commit_stats)
            .into_iter()
            .map(|(hash, stat)| (hash, serde_json::to_value(stat).unwrap_or_default()))
            .collect();
        DrainedStats { commit_data, commits_by_tick: std::mem::take(&mut self.commits_by_tick) }
    }
}

/// Entry-wise sum of counts and coupling maps (spill-reload merge).
fn merge_accs(mut existing: NodeAcc, incoming: NodeAcc) -> NodeAcc {
    if existing.summary.kind.is_empty() {
        existing.summary = incoming.summary;
    }
    existing.count += incoming.count;
    for (key, count) in incoming.couples {
        *existing.couples.entry(key).or_default() += count;
    }
    existing
}
