use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::Result;
use itertools::Itertools;

use crate::aggregate::AggregateError;
use crate::aggregate::Aggregator;
use crate::aggregate::CommitStatsDrainer;
use crate::aggregate::DirectStoreWriter;
use crate::aggregate::RepoAccess;
use crate::bloom::BloomFilter;
use crate::core::AuthorId;
use crate::core::CommitHash;
use crate::core::Config;
use crate::core::DrainedStats;
use crate::core::Tc;
use crate::core::TcData;
use crate::core::Tick;
use crate::core::TickRecord;
use crate::hll::HyperLogLog;
use crate::merges::MergeTracker;
use crate::plumbing::ChangeKind;
use crate::plumbing::Context;
use crate::spill::SpillState;
use crate::spill::SpillStore;
use crate::store::RecordWriter;

/// Commits touching more files than this are treated as noise (mass
/// renames, vendor updates, formatting) and contribute no coupling.
pub const COUPLES_MAX_CONTEXT: usize = 200;

/// Prune/cap/compact the filtered collection every this many chunks.
const PRUNE_INTERVAL: usize = 10;

/// Hard cap on entries kept per coupling lane.
const MAX_PER_FILE: usize = 500;

/// Dev matrix is bounded to this many people, by diagonal activity.
const MAX_DEVS: usize = 20;

/// Pairs at or above this co-change count are "highly coupled" in the
/// aggregate record.
const HIGH_COUPLING_THRESHOLD: u32 = 10;

const SEEN_FILES_EXPECTED: usize = 100_000;
const SEEN_FILES_FP: f64 = 0.01;

/// Contributor sketches use 2^10 registers per file.
const OWNERSHIP_PRECISION: u8 = 10;

// Memory-estimation constants, calibrated to the string-keyed map
// representation. Underestimation defers spilling and risks OOM.
const LANE_ENTRY_BYTES: usize = 200;
const PERSON_FILE_ENTRY_BYTES: usize = 130;
const RENAME_BYTES: usize = 100;
const PERSON_COMMIT_BYTES: usize = 8;

/// One coupling lane: co-change counts of a single file against others,
/// with the self-count under the file's own name.
pub type Lane = HashMap<String, u32>;

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Rename {
    pub from: String,
    pub to: String,
}

/// Per-commit payload produced by [CouplesAnalyzer::consume].
#[derive(Debug, Clone, Default)]
pub struct CouplesCommitData {
    pub coupling_files: Vec<String>,
    pub author_files: HashMap<String, u32>,
    pub renames: Vec<Rename>,
    pub commit_counted: bool,
}

#[derive(Debug, Clone)]
#[derive(serde::Serialize)]
struct CommitStat {
    files_touched: usize,
    author_id: AuthorId,
}

/// Produces per-commit coupling contributions from tree changes.
///
/// `seen_files` is cumulative across the whole run: merge-mode coupling
/// only counts files the history has not coupled before, which keeps
/// octopus-style merges from re-coupling the world. A Bloom false positive
/// conservatively excludes a name from merge-mode coupling.
pub struct CouplesAnalyzer {
    merges: MergeTracker,
    seen_files: BloomFilter,
}

impl CouplesAnalyzer {
    pub fn new() -> Self {
        Self {
            merges: MergeTracker::new(),
            seen_files: BloomFilter::with_estimates(SEEN_FILES_EXPECTED, SEEN_FILES_FP),
        }
    }

    pub fn consume(&mut self, ctx: &Context) -> Result<Tc> {
        let merge_mode = ctx.is_merge;
        if merge_mode && self.merges.seen_before_add(&ctx.hash) {
            let data = CouplesCommitData::default();
            return Ok(Tc {
                tick: ctx.tick,
                author_id: ctx.author_id,
                commit_hash: ctx.hash,
                data: TcData::Couples(data),
            });
        }

        let oversized = ctx.tree_changes.len() > COUPLES_MAX_CONTEXT;
        let mut data = CouplesCommitData { commit_counted: true, ..Default::default() };

        for change in &ctx.tree_changes {
            match change.kind {
                ChangeKind::Delete => {
                    if merge_mode {
                        continue;
                    }
                    *data.author_files.entry(change.name().to_string()).or_default() += 1;
                }
                ChangeKind::Insert | ChangeKind::Modify => {
                    let name = change.name().to_string();
                    if change.is_rename() {
                        data.renames.push(Rename {
                            from: change.old_name.clone().unwrap_or_default(),
                            to: name.clone(),
                        });
                    }
                    if !oversized {
                        if merge_mode {
                            if !self.seen_files.test_and_add(name.as_bytes()) {
                                data.coupling_files.push(name.clone());
                            }
                        } else {
                            self.seen_files.add(name.as_bytes());
                            data.coupling_files.push(name.clone());
                        }
                    }
                    *data.author_files.entry(name).or_default() += 1;
                }
            }
        }

        Ok(Tc {
            tick: ctx.tick,
            author_id: ctx.author_id,
            commit_hash: ctx.hash,
            data: TcData::Couples(data),
        })
    }

    pub fn hibernate(&mut self) {
        self.merges.reset();
    }

    pub fn seen_files(&self) -> &BloomFilter {
        &self.seen_files
    }

    pub fn checkpoint_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self.seen_files)?)
    }

    pub fn restore_bytes(&mut self, image: &[u8]) -> Result<()> {
        self.seen_files = bincode::deserialize(image)?;
        Ok(())
    }
}

impl Default for CouplesAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Cumulative coupling aggregator: a sparse symmetric file matrix backed
/// by a [SpillStore], plus per-person touch maps and commit summaries.
pub struct CouplesAggregator {
    files: SpillStore<Lane>,
    people: Vec<HashMap<String, u32>>,
    people_commits: Vec<u32>,
    renames: Vec<Rename>,
    commit_stats: HashMap<String, CommitStat>,
    commits_by_tick: BTreeMap<Tick, Vec<CommitHash>>,
    ownership: HashMap<String, HyperLogLog>,
    spill_budget: usize,
    min_edge_weight: u32,
    top_k: usize,
    last_tick: Tick,
    closed: bool,
}

impl CouplesAggregator {
    pub fn new(config: &Config) -> Self {
        Self {
            files: SpillStore::new(&config.tmp_dir),
            people: Vec::new(),
            people_commits: Vec::new(),
            renames: Vec::new(),
            commit_stats: HashMap::new(),
            commits_by_tick: BTreeMap::new(),
            ownership: HashMap::new(),
            spill_budget: config.spill_budget,
            min_edge_weight: config.min_edge_weight,
            top_k: config.top_k_per_file,
            last_tick: 0,
            closed: false,
        }
    }

    fn add_couples(&mut self, tc: &Tc, data: &CouplesCommitData) -> Result<()> {
        if tc.author_id + 1 > self.people.len() {
            self.people.resize_with(tc.author_id + 1, HashMap::new);
            self.people_commits.resize(tc.author_id + 1, 0);
        }
        if data.commit_counted {
            self.people_commits[tc.author_id] += 1;
        }

        for (file, touches) in &data.author_files {
            *self.people[tc.author_id].entry(file.clone()).or_default() += touches;
            self.ownership
                .entry(file.clone())
                .or_insert_with(|| HyperLogLog::new(OWNERSHIP_PRECISION))
                .add(&(tc.author_id as u64).to_le_bytes());
        }

        for file in &data.coupling_files {
            let lane = self.files.entry_or_default(file);
            if data.coupling_files.len() >= 100 && lane.is_empty() {
                lane.reserve(data.coupling_files.len());
            }
            for other in &data.coupling_files {
                *lane.entry(other.clone()).or_default() += 1;
            }
        }

        self.renames.extend(data.renames.iter().cloned());

        if data.commit_counted {
            self.last_tick = self.last_tick.max(tc.tick);
            self.commit_stats.insert(
                tc.commit_hash.to_string(),
                CommitStat { files_touched: data.author_files.len(), author_id: tc.author_id },
            );
            self.commits_by_tick.entry(tc.tick).or_default().push(tc.commit_hash);
        }

        if self.spill_budget > 0 && self.estimated_state_size() > self.spill_budget {
            self.files.spill()?;
        }
        Ok(())
    }

    fn report(&mut self) -> Result<serde_json::Value> {
        let lanes = self.files.collect_with(merge_lanes)?;
        for (file, lane) in &lanes {
            self.files.put(file.clone(), lane.clone());
        }

        let mut names: HashSet<&String> = lanes.keys().collect();
        for person in &self.people {
            names.extend(person.keys());
        }
        let files: Vec<String> = names.into_iter().sorted().cloned().collect();
        let index: HashMap<&str, usize> =
            files.iter().enumerate().map(|(i, f)| (f.as_str(), i)).collect();

        let files_matrix: Vec<BTreeMap<usize, u32>> = files
            .iter()
            .map(|file| match lanes.get(file) {
                Some(lane) => lane
                    .iter()
                    .filter_map(|(other, &count)| index.get(other.as_str()).map(|&i| (i, count)))
                    .collect(),
                None => BTreeMap::new(),
            })
            .collect();

        let (people_matrix, people_files) =
            compute_people_matrix(&self.people, &index, self.people.len());

        Ok(serde_json::json!({
            "Files": files,
            "FilesMatrix": files_matrix,
            "PeopleMatrix": people_matrix,
            "PeopleFiles": people_files,
            "PeopleCommits": self.people_commits,
            "Renames": self.renames,
        }))
    }

    /// Stream the spilled lanes against the currently-existing file set,
    /// pruning and compacting periodically so memory stays bounded by the
    /// survivor set rather than the full history.
    fn collect_filtered_files(
        &mut self,
        current: &HashSet<String>,
        min_weight: u32,
    ) -> Result<HashMap<String, Lane>> {
        let mut filter = BloomFilter::with_estimates(current.len(), 0.01);
        for file in current {
            filter.add(file.as_bytes());
        }
        // Bloom pre-test makes the common miss an O(1) early reject.
        let matcher = |name: &str| filter.test(name.as_bytes()) && current.contains(name);

        let mut result: HashMap<String, Lane> = HashMap::new();
        let mut chunks = 0usize;
        self.files.for_each_spill(|chunk| {
            for (file, lane) in chunk {
                if !current.contains(file) {
                    continue;
                }
                let dest = result.entry(file.clone()).or_default();
                for (other, &count) in lane {
                    if other == file || matcher(other) {
                        *dest.entry(other.clone()).or_default() += count;
                    }
                }
            }
            chunks += 1;
            if chunks % PRUNE_INTERVAL == 0 {
                prune_and_cap_entries(&mut result, min_weight, MAX_PER_FILE);
            }
            Ok(())
        })?;
        prune_and_cap_entries(&mut result, min_weight, MAX_PER_FILE);
        Ok(result)
    }
}

impl Aggregator for CouplesAggregator {
    fn add(&mut self, tc: Tc) -> Result<()> {
        match &tc.data {
            TcData::Couples(data) => {
                let data = data.clone();
                self.add_couples(&tc, &data)
            }
            TcData::None => Ok(()),
            other => Err(AggregateError::UnexpectedAggregator {
                expected: "couples",
                actual: other.label(),
            }
            .into()),
        }
    }

    fn flush_tick(&mut self, tick: Tick) -> TickRecord {
        // Cumulative analyzer: every tick sees the running totals.
        let data = self.report().unwrap_or(serde_json::Value::Null);
        TickRecord { tick, data }
    }

    fn flush_all_ticks(&mut self) -> Result<Option<Vec<TickRecord>>> {
        if self.files.is_empty() && self.files.spill_count() == 0 && self.people.is_empty() {
            return Ok(None);
        }
        let data = self.report()?;
        Ok(Some(vec![TickRecord { tick: self.last_tick, data }]))
    }

    fn spill(&mut self) -> Result<()> {
        self.files.spill()
    }

    fn collect(&mut self) -> Result<()> {
        let merged = self.files.collect_with(merge_lanes)?;
        for (file, lane) in merged {
            self.files.put(file, lane);
        }
        Ok(())
    }

    fn estimated_state_size(&self) -> usize {
        let lane_entries: usize = self.files.current().values().map(|l| l.len()).sum();
        let person_entries: usize = self.people.iter().map(|p| p.len()).sum();
        lane_entries * LANE_ENTRY_BYTES
            + person_entries * PERSON_FILE_ENTRY_BYTES
            + self.renames.len() * RENAME_BYTES
            + self.people_commits.len() * PERSON_COMMIT_BYTES
    }

    fn spill_state(&self) -> SpillState {
        self.files.spill_state()
    }

    fn restore_spill_state(&mut self, state: SpillState) {
        self.files.restore_from_dir(state);
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.files.cleanup()
    }

    fn as_commit_stats_drainer(&mut self) -> Option<&mut dyn CommitStatsDrainer> {
        Some(self)
    }

    fn as_direct_store_writer(&mut self) -> Option<&mut dyn DirectStoreWriter> {
        Some(self)
    }
}

impl CommitStatsDrainer for CouplesAggregator {
    fn drain_commit_stats(&mut self) -> DrainedStats {
        let commit_data = std::mem::take(&mut self.commit_stats)
            .into_iter()
            .map(|(hash, stat)| (hash, serde_json::to_value(stat).unwrap_or_default()))
            .collect();
        DrainedStats { commit_data, commits_by_tick: std::mem::take(&mut self.commits_by_tick) }
    }
}

impl DirectStoreWriter for CouplesAggregator {
    fn write_to_store(&mut self, writer: &mut RecordWriter, repo: &dyn RepoAccess) -> Result<()> {
        let min_weight = self.min_edge_weight;
        let lanes = match repo.current_files() {
            Some(files) => {
                let current: HashSet<String> = files.into_iter().collect();
                self.collect_filtered_files(&current, min_weight)?
            }
            None => {
                let merged = self.files.collect_with(merge_lanes)?;
                for (file, lane) in &merged {
                    self.files.put(file.clone(), lane.clone());
                }
                merged
            }
        };

        // file_coupling: unordered pairs above the weight floor, strongest
        // first, truncated to the top K.
        let mut pairs: Vec<(String, String, u32)> = lanes
            .iter()
            .flat_map(|(a, lane)| {
                lane.iter()
                    .filter(|(b, _)| a.as_str() < b.as_str())
                    .map(|(b, &count)| (a.clone(), b.clone(), count))
            })
            .filter(|&(_, _, count)| count >= min_weight)
            .collect();
        pairs.sort_by(|x, y| y.2.cmp(&x.2).then_with(|| (&x.0, &x.1).cmp(&(&y.0, &y.1))));
        let high_coupling =
            pairs.iter().filter(|&&(_, _, c)| c >= HIGH_COUPLING_THRESHOLD).count();
        let total_pairs = pairs.len();
        pairs.truncate(self.top_k);
        for (a, b, count) in &pairs {
            writer.write(
                "file_coupling",
                &serde_json::json!({ "a": a, "b": b, "cochanges": count }),
            )?;
        }

        // dev_matrix: bounded sub-matrix, top devs by diagonal.
        let index: HashMap<&str, usize> = HashMap::new();
        let (matrix, _) = compute_people_matrix(&self.people, &index, self.people.len());
        let kept = top_devs(&matrix, MAX_DEVS);
        let remap: HashMap<usize, usize> =
            kept.iter().enumerate().map(|(new, &old)| (old, new)).collect();
        let bounded: Vec<BTreeMap<usize, u32>> = kept
            .iter()
            .map(|&old| {
                matrix[old]
                    .iter()
                    .filter_map(|(&o, &c)| remap.get(&o).map(|&n| (n, c)))
                    .collect()
            })
            .collect();
        writer.write(
            "dev_matrix",
            &serde_json::json!({ "people": kept, "matrix": bounded }),
        )?;

        // ownership: per existing file, blob lines + contributor estimate.
        for (file, sketch) in self.ownership.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
            if let Some(lines) = repo.count_lines(file) {
                writer.write(
                    "ownership",
                    &serde_json::json!({
                        "file": file,
                        "lines": lines,
                        "contributors": sketch.count(),
                    }),
                )?;
            }
        }

        writer.write(
            "aggregate",
            &serde_json::json!({
                "files": lanes.len(),
                "people": self.people.len(),
                "renames": self.renames.len(),
                "pairs": total_pairs,
                "high_coupling_pairs": high_coupling,
            }),
        )?;
        Ok(())
    }
}

pub fn merge_lanes(mut existing: Lane, incoming: Lane) -> Lane {
    for (key, count) in incoming {
        *existing.entry(key).or_default() += count;
    }
    existing
}

/// Delete weak entries, cap each lane to the top `max` by count, and
/// compact lanes that shrank below half their former size. The underlying
/// map does not reclaim bucket memory on delete, so compaction reallocates.
pub fn prune_and_cap_entries(
    lanes: &mut HashMap<String, Lane>,
    min_weight: u32,
    max: usize,
) {
    for (file, lane) in lanes.iter_mut() {
        let before = lane.len();

        lane.retain(|other, count| *count >= min_weight || other == file);

        if lane.len() > max {
            let mut counts: Vec<u32> = lane.values().copied().collect();
            counts.sort_unstable_by(|a, b| b.cmp(a));
            let threshold = counts[max - 1];
            lane.retain(|other, count| *count >= threshold || other == file);
            if lane.len() > max {
                // Tie-break: drop threshold-count entries in key order
                // until exactly `max` remain.
                let mut ties: Vec<String> = lane
                    .iter()
                    .filter(|(other, count)| **count == threshold && *other != file)
                    .map(|(other, _)| other.clone())
                    .sorted()
                    .collect();
                ties.truncate(lane.len() - max);
                for key in ties {
                    lane.remove(&key);
                }
            }
        }

        if lane.len() * 2 < before {
            *lane = std::mem::take(lane).into_iter().collect();
        }
    }
}

/// Build the dev-coupling matrix and per-person file lists.
///
/// The diagonal measures total activity on shared files; off-diagonal
/// cells accumulate `min(commits_a, commits_b)` per shared file.
pub fn compute_people_matrix(
    people: &[HashMap<String, u32>],
    files_index: &HashMap<&str, usize>,
    people_number: usize,
) -> (Vec<BTreeMap<usize, u32>>, Vec<Vec<usize>>) {
    let mut matrix: Vec<BTreeMap<usize, u32>> = vec![BTreeMap::new(); people_number];
    let mut people_files: Vec<Vec<usize>> = vec![Vec::new(); people_number];

    let mut inverted: HashMap<&str, Vec<(usize, u32)>> = HashMap::new();
    for (dev, files) in people.iter().enumerate() {
        for (file, &commits) in files {
            inverted.entry(file.as_str()).or_default().push((dev, commits));
            if let Some(&idx) = files_index.get(file.as_str()) {
                people_files[dev].push(idx);
            }
        }
    }
    for list in &mut people_files {
        list.sort_unstable();
    }

    for devs in inverted.values() {
        for &(a, commits_a) in devs {
            for &(b, commits_b) in devs {
                *matrix[a].entry(b).or_default() += commits_a.min(commits_b);
            }
        }
    }

    (matrix, people_files)
}

fn top_devs(matrix: &[BTreeMap<usize, u32>], max: usize) -> Vec<usize> {
    let mut devs: Vec<usize> = (0..matrix.len()).collect();
    devs.sort_by_key(|&dev| {
        (std::cmp::Reverse(matrix[dev].get(&dev).copied().unwrap_or(0)), dev)
    });
    devs.truncate(max);
    devs.sort_unstable();
    devs
}
