use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as AnyhowContext;
use anyhow::Result;
use chrono::TimeZone;
use chrono::Utc;

use crate::aggregate::Aggregator;
use crate::aggregate::CommitStatsDrainer;
use crate::aggregate::DirectStoreWriter;
use crate::aggregate::RepoAccess;
use crate::analyzer::HistoryAnalyzer;
use crate::core::CommitMeta;
use crate::core::Config;
use crate::core::Report;
use crate::core::Tick;
use crate::formats::UnifiedAnalyzer;
use crate::formats::UnifiedModel;
use crate::forkmerge::ForkController;
use crate::forkmerge::Snapshot;
use crate::hibernate;
use crate::hibernate::Checkpoint;
use crate::imports;
use crate::languages::Lang;
use crate::metrics::MetricsError;
use crate::plumbing::CancelToken;
use crate::plumbing::Plumbing;
use crate::registry::Registry;
use crate::store::AnalyzerMeta;
use crate::store::ReportStore;
use crate::timeseries::TimeSeriesChunkFlusher;
use crate::uast;

const SCHEMA_VERSION: u32 = 1;

pub struct RunOptions {
    pub repo_path: PathBuf,
    pub analyzer_ids: Vec<String>,
    pub config: Config,
    pub store_root: Option<PathBuf>,
    pub ndjson_out: Option<Box<dyn Write + Send>>,
}

pub struct RunOutcome {
    pub model: UnifiedModel,
    pub commits: usize,
    pub timeseries: Vec<serde_json::Value>,
    pub analyzer_flags: Vec<String>,
    pub people: Vec<String>,
}

/// Read access to the tree of the last processed commit, used by store
/// writers for filtered collection and blob line counts.
struct GitRepoAccess<'r> {
    repo: &'r git2::Repository,
    last_commit: Option<git2::Oid>,
}

impl RepoAccess for GitRepoAccess<'_> {
    fn current_files(&self) -> Option<Vec<String>> {
        let commit = self.repo.find_commit(self.last_commit?).ok()?;
        let tree = commit.tree().ok()?;
        let mut files = Vec::new();
        tree.walk(git2::TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(git2::ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    files.push(format!("{}{}", dir, name));
                }
            }
            git2::TreeWalkResult::Ok
        })
        .ok()?;
        Some(files)
    }

    fn count_lines(&self, file: &str) -> Option<usize> {
        let commit = self.repo.find_commit(self.last_commit?).ok()?;
        let entry = commit.tree().ok()?.get_path(Path::new(file)).ok()?;
        let blob = self.repo.find_blob(entry.id()).ok()?;
        if blob.is_binary() {
            return None;
        }
        Some(blob.content().iter().filter(|&&b| b == b'\n').count())
    }
}

/// Drive the full history pipeline: chronological walk, shared plumbing,
/// fork/merge dispatch, chunked hibernation with time-series drains, and
/// final store/report assembly.
pub fn run_history(
    mut options: RunOptions,
    cancel: CancelToken,
    progress: Option<indicatif::ProgressBar>,
) -> Result<RunOutcome> {
    let repo = git2::Repository::discover(&options.repo_path)
        .with_context(|| format!("open repository {}", options.repo_path.display()))?;
    let config = options.config.clone();
    let registry = Registry::builtin();

    let mut analyzers: Vec<Box<dyn HistoryAnalyzer>> = Vec::new();
    let mut aggregators: Vec<Box<dyn Aggregator>> = Vec::new();
    for id in &options.analyzer_ids {
        let analyzer = registry.make(id, &config)?;
        aggregators.push(analyzer.make_aggregator(&config)?);
        analyzers.push(analyzer);
    }

    let mut plumbing = Plumbing::new(&config, cancel.clone());

    // Checkpoint resume: restore analyzer state and skip processed commits.
    let mut resume_from = 0usize;
    if let Some(dir) = &config.checkpoint_dir {
        if let Some(checkpoint) = hibernate::load(dir)? {
            resume_from = checkpoint.commits_processed;
            if let Some(image) = &checkpoint.plumbing {
                plumbing.restore_bytes(image).context("restore plumbing checkpoint")?;
            }
            for (i, analyzer) in analyzers.iter_mut().enumerate() {
                if let Some(image) = checkpoint.analyzers.get(analyzer.id()) {
                    analyzer.restore(image).with_context(|| {
                        format!("restore checkpoint for {}", analyzer.id())
                    })?;
                }
                if let Some(state) = checkpoint.spill_states.get(analyzer.id()) {
                    aggregators[i].restore_spill_state(state.clone());
                }
            }
            log::info!("Resuming from checkpoint at commit {}.", resume_from);
        }
    }

    let mut walk = repo.revwalk().context("start revision walk")?;
    walk.push_head().context("resolve HEAD")?;
    walk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME | git2::Sort::REVERSE)?;
    let oids: Vec<git2::Oid> = walk.filter_map(|oid| oid.ok()).collect();
    if let Some(bar) = &progress {
        bar.set_length(oids.len() as u64);
    }

    let flusher = TimeSeriesChunkFlusher::new(options.ndjson_out.take());
    let mut timeseries = Vec::new();
    let mut last_commit = None;
    let mut processed = 0usize;

    let chunk_size = if config.chunk_size == 0 { oids.len().max(1) } else { config.chunk_size };
    for chunk in oids.chunks(chunk_size) {
        cancel.check()?;

        let heavy: Vec<(usize, Vec<Box<dyn HistoryAnalyzer>>)> = analyzers
            .iter()
            .enumerate()
            .filter(|(_, a)| a.cpu_heavy() && !a.sequential_only())
            .map(|(slot, a)| (slot, a.fork(config.workers)))
            .filter(|(_, forks)| !forks.is_empty())
            .collect();
        let heavy_slots: Vec<usize> = heavy.iter().map(|(slot, _)| *slot).collect();
        let controller = ForkController::start(heavy, config.workers, cancel.clone());

        for &oid in chunk {
            let commit = repo.find_commit(oid).context("load commit")?;
            let index = processed;
            processed += 1;
            if let Some(bar) = &progress {
                bar.inc(1);
            }
            if index < resume_from {
                continue;
            }

            let ctx = Arc::new(plumbing.process(&repo, &commit, index)?);
            last_commit = Some(oid);

            if config.sampling > 1 && index % config.sampling as usize != 0 {
                continue;
            }

            flusher.record_meta(CommitMeta {
                hash: ctx.hash.to_string(),
                timestamp: Utc
                    .timestamp_opt(ctx.time, 0)
                    .single()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                author: ctx.author.clone(),
                tick: ctx.tick,
            });

            for slot in &heavy_slots {
                controller.dispatch(*slot, Snapshot(ctx.clone()))?;
            }
            for (i, analyzer) in analyzers.iter_mut().enumerate() {
                if heavy_slots.contains(&i) {
                    continue;
                }
                let tc = analyzer.consume(&ctx)?;
                aggregators[i].add(tc)?;
            }
        }

        // Chunk boundary: replay worker results chronologically, then
        // fold branches back and shed chunk-scoped state.
        for result in controller.finish(&mut analyzers)? {
            aggregators[result.slot].add(result.tc)?;
        }
        for analyzer in &mut analyzers {
            analyzer.hibernate();
            analyzer.boot();
        }

        let mut drains = Vec::new();
        for (i, analyzer) in analyzers.iter().enumerate() {
            if let Some(drainer) = aggregators[i].as_commit_stats_drainer() {
                drains.push((analyzer.flag().to_string(), drainer.drain_commit_stats()));
            }
        }
        timeseries.extend(flusher.flush_chunk(drains)?);
    }

    if let Some(dir) = &config.checkpoint_dir {
        let mut checkpoint = Checkpoint { commits_processed: processed, ..Default::default() };
        checkpoint.plumbing = Some(plumbing.checkpoint_bytes()?);
        for (i, analyzer) in analyzers.iter().enumerate() {
            if let Some(image) = analyzer.checkpoint()? {
                checkpoint.analyzers.insert(analyzer.id().to_string(), image);
            }
            let state = aggregators[i].spill_state();
            if !state.is_empty() {
                checkpoint.spill_states.insert(analyzer.id().to_string(), state);
            }
        }
        hibernate::save(dir, &checkpoint)?;
    }

    if let Some(root) = &options.store_root {
        let store = ReportStore::open_root(root)?;
        let access = GitRepoAccess { repo: &repo, last_commit };
        for (i, analyzer) in analyzers.iter().enumerate() {
            let meta = AnalyzerMeta {
                analyzer_id: analyzer.id().to_string(),
                version: SCHEMA_VERSION,
                schema_hash: schema_hash(analyzer.id()),
            };
            let mut writer = store.begin(analyzer.id(), &meta)?;
            let is_direct = aggregators[i].as_direct_store_writer().is_some();
            if is_direct {
                let direct = aggregators[i].as_direct_store_writer().unwrap();
                direct.write_to_store(&mut writer, &access)?;
            } else if let Some(records) = aggregators[i].flush_all_ticks()? {
                for record in records {
                    writer.write("ticks", &record)?;
                }
            }
            writer.close()?;
        }
    }

    let people = plumbing.people().to_vec();
    let mut unified = Vec::new();
    for (i, analyzer) in analyzers.iter().enumerate() {
        let report = build_report(analyzer.id(), aggregators[i].as_mut(), &people, &config)?;
        unified.push(UnifiedAnalyzer {
            id: analyzer.id().to_string(),
            mode: "history".to_string(),
            report,
        });
    }

    let analyzer_flags = analyzers.iter().map(|a| a.flag().to_string()).collect();
    for aggregator in &mut aggregators {
        aggregator.close()?;
    }

    Ok(RunOutcome {
        model: UnifiedModel::new(unified),
        commits: processed,
        timeseries,
        analyzer_flags,
        people,
    })
}

fn build_report(
    id: &str,
    aggregator: &mut dyn Aggregator,
    people: &[String],
    config: &Config,
) -> Result<Report> {
    let records = aggregator.flush_all_ticks()?.unwrap_or_default();
    let mut report = Report::new();
    match id {
        "couples" | "shotness" => {
            // Cumulative analyzers emit one record carrying the totals.
            if let Some(record) = records.last() {
                if let Some(map) = record.data.as_object() {
                    for (key, value) in map {
                        report.insert(key.clone(), value.clone());
                    }
                }
            }
            if id == "couples" {
                report.insert(
                    "ReversedPeopleDict".to_string(),
                    serde_json::to_value(people)?,
                );
            }
        }
        "imports" => {
            let pivoted = imports::pivot_ticks(&records);
            report.insert("imports".to_string(), serde_json::to_value(pivoted)?);
            report.insert("author_index".to_string(), serde_json::to_value(people)?);
            report.insert(
                "tick_size".to_string(),
                serde_json::to_value(config.granularity_hours)?,
            );
        }
        "typos" => {
            let mut all = Vec::new();
            let mut by_tick: BTreeMap<Tick, usize> = BTreeMap::new();
            for record in &records {
                if let Some(items) = record.data.get("typos").and_then(|v| v.as_array()) {
                    by_tick.insert(record.tick, items.len());
                    all.extend(items.iter().cloned());
                }
            }
            report.insert("typos".to_string(), serde_json::Value::Array(all));
            report.insert("typos_by_tick".to_string(), serde_json::to_value(by_tick)?);
        }
        other => {
            return Err(MetricsError::NotImplemented(format!("report for {}", other)).into())
        }
    }
    Ok(report)
}

fn schema_hash(id: &str) -> String {
    // Stable per (analyzer, schema version) pair; readers use it to detect
    // frame layout drift.
    format!("{}-v{}", id, SCHEMA_VERSION)
}

/// Static analysis over a working tree: no history, one report per
/// analyzer that supports it.
pub fn run_static(root: &Path, analyzer_ids: &[String], _config: &Config) -> Result<UnifiedModel> {
    let mut unified = Vec::new();
    for id in analyzer_ids {
        match id.as_str() {
            "imports" => {
                let mut counts: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
                for path in walk_source_files(root)? {
                    let Ok(relative) = path.strip_prefix(root) else {
                        continue;
                    };
                    let name = relative.to_string_lossy().to_string();
                    let Some(lang) = Lang::of(&name) else {
                        continue;
                    };
                    let content = match std::fs::read_to_string(&path) {
                        Ok(content) => content,
                        Err(err) if skippable(&err) => continue,
                        Err(err) => {
                            return Err(err)
                                .with_context(|| format!("read {}", path.display()))
                        }
                    };
                    if let Some(tree) = uast::extract_tree(&name, &content) {
                        for import in uast::collect_imports(&tree) {
                            *counts
                                .entry(lang.to_string())
                                .or_default()
                                .entry(import)
                                .or_default() += 1;
                        }
                    }
                }
                let mut report = Report::new();
                report.insert("imports".to_string(), serde_json::to_value(counts)?);
                unified.push(UnifiedAnalyzer {
                    id: id.clone(),
                    mode: "static".to_string(),
                    report,
                });
            }
            other => {
                return Err(
                    MetricsError::NotImplemented(format!("static mode for {}", other)).into()
                )
            }
        }
    }
    Ok(UnifiedModel::new(unified))
}

fn skippable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound
    )
}

/// Recursive source walk. Permission-denied directories are descend-
/// skipped and unreadable files are passed over; any other error aborts
/// the walk.
fn walk_source_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("walk {}", dir.display()))
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if skippable(&err) => continue,
                Err(err) => return Err(err).context("read dir entry"),
            };
            let path = entry.path();
            if path.is_dir() {
                if path.file_name().map(|n| n == ".git").unwrap_or(false) {
                    continue;
                }
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Write rendered output to a file or stdout.
pub fn write_output(bytes: &[u8], output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let mut file =
                File::create(path).with_context(|| format!("create {}", path.display()))?;
            file.write_all(bytes)?;
        }
        None => {
            std::io::stdout().write_all(bytes)?;
        }
    }
    Ok(())
}
