use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use indicatif::MultiProgress;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use indicatif_log_bridge::LogWrapper;

use crate::core::Config;
use crate::formats::Format;
use crate::plumbing::CancelToken;
use crate::registry::Registry;
use crate::runner::write_output;
use crate::runner::RunOptions;

mod aggregate;
mod analyzer;
mod bloom;
mod core;
mod couples;
mod formats;
mod forkmerge;
mod hibernate;
mod hll;
mod identity;
mod imports;
mod languages;
mod merges;
mod metrics;
mod plumbing;
mod registry;
mod runner;
mod shotness;
mod spill;
mod store;
mod timeseries;
mod typos;
mod uast;

/// Mine code-quality and co-change metrics from a repository's history
///
/// Commits are processed chronologically through a shared plumbing
/// pipeline (tree diffs, line diffs, structural extraction, identity,
/// tick assignment) and fanned out to the selected analyzers. Results
/// can be rendered in several formats and persisted to a report store
/// for later reading.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// The repository to mine
    ///
    /// Defaults to the current working directory; the repository is
    /// discovered upwards from here.
    #[arg(default_value = ".")]
    repo: PathBuf,

    /// Analyzers to run: ids or globs, comma separated (e.g. "couples,s*")
    #[arg(short, long, value_delimiter = ',', default_value = "*")]
    analyzers: Vec<String>,

    /// Output format
    ///
    /// One of: json, yaml, binary (bin), text, compact, plot,
    /// timeseries, timeseries-ndjson.
    #[arg(short, long, default_value = "json")]
    format: String,

    /// Output path; stdout if omitted
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Persist per-analyzer records under this report-store root
    #[arg(long)]
    store: Option<PathBuf>,

    /// Commits per chunk between hibernation points (0 = one chunk)
    #[arg(long, default_value_t = 0)]
    chunk_size: usize,

    /// Aggregator memory budget in bytes before spilling (0 = no spill)
    #[arg(long, default_value_t = 0)]
    spill_budget: usize,

    /// Worker threads for CPU-heavy analyzers (0 = number of cores)
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// Tick width in hours
    #[arg(long, default_value_t = 24)]
    granularity: u32,

    /// Feed analyzers every Nth commit (0 = every commit)
    #[arg(long, default_value_t = 0)]
    sampling: u32,

    /// Minimum co-change count for a coupling pair to be reported
    #[arg(long, default_value_t = 1)]
    min_edge_weight: u32,

    /// Keep at most this many coupling pairs
    #[arg(long, default_value_t = 500)]
    top_k: usize,

    /// Node-selection query for shotness
    #[arg(long)]
    shotness_struct: Option<String>,

    /// Name-extraction query for shotness
    #[arg(long)]
    shotness_name: Option<String>,

    /// Save/resume run state under this directory
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Root for spill and hibernation temp files
    #[arg(long)]
    tmp_dir: Option<PathBuf>,

    /// Analyze the working tree instead of the history
    #[arg(long = "static")]
    static_mode: bool,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

impl Cli {
    fn to_config(&self) -> Config {
        let defaults = Config::default();
        Config {
            tmp_dir: self.tmp_dir.clone().unwrap_or(defaults.tmp_dir),
            granularity_hours: self.granularity,
            sampling: self.sampling,
            chunk_size: self.chunk_size,
            spill_budget: self.spill_budget,
            workers: if self.workers == 0 { defaults.workers } else { self.workers },
            min_edge_weight: self.min_edge_weight,
            top_k_per_file: self.top_k,
            shotness_struct: self
                .shotness_struct
                .clone()
                .unwrap_or(defaults.shotness_struct),
            shotness_name: self.shotness_name.clone().unwrap_or(defaults.shotness_name),
            checkpoint_dir: self.checkpoint_dir.clone(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let logger =
        env_logger::Builder::new().filter_level(cli.verbose.log_level_filter()).build();
    let multi_progress = MultiProgress::new();
    LogWrapper::new(multi_progress.clone(), logger).try_init().unwrap();

    let start = Instant::now();
    let format = Format::resolve(&cli.format)?;
    let registry = Registry::builtin();
    let analyzer_ids: Vec<String> =
        registry.expand(&cli.analyzers)?.into_iter().map(String::from).collect();
    let config = cli.to_config();

    if cli.static_mode {
        let model = runner::run_static(&cli.repo, &analyzer_ids, &config)?;
        let bytes = formats::render(&model, format)?;
        write_output(&bytes, cli.output.as_deref())?;
        log::info!("Finished in {}ms.", start.elapsed().as_millis());
        return Ok(());
    }

    // The NDJSON time series streams during the run; everything else
    // renders from the finished model.
    let ndjson_out: Option<Box<dyn std::io::Write + Send>> =
        if format == Format::TimeSeriesNdjson {
            Some(match &cli.output {
                Some(path) => Box::new(std::fs::File::create(path)?),
                None => Box::new(std::io::stdout()),
            })
        } else {
            None
        };

    let bar = multi_progress.add(ProgressBar::new(0)).with_style(ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:40} {pos}/{len} (ETA: {eta_precise}) {msg}",
    )?);

    let outcome = runner::run_history(
        RunOptions {
            repo_path: cli.repo.clone(),
            analyzer_ids,
            config: config.clone(),
            store_root: cli.store.clone(),
            ndjson_out,
        },
        CancelToken::default(),
        Some(bar.clone()),
    )?;
    bar.finish();
    multi_progress.remove(&bar);
    log::info!("Processed {} commit(s).", outcome.commits);

    match format {
        Format::TimeSeriesNdjson => {}
        Format::TimeSeries => {
            let document = timeseries::build_document(
                config.granularity_hours,
                &outcome.analyzer_flags,
                outcome.timeseries,
            );
            let mut bytes = serde_json::to_vec_pretty(&document)?;
            bytes.push(b'\n');
            write_output(&bytes, cli.output.as_deref())?;
        }
        _ => {
            let bytes = formats::render(&outcome.model, format)?;
            write_output(&bytes, cli.output.as_deref())?;
        }
    }

    log::info!("Finished in {}ms.", start.elapsed().as_millis());
    Ok(())
}
