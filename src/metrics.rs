use std::collections::BTreeMap;

use anyhow::Result;

use crate::core::Config;
use crate::core::Report;

/// Pairs at or above this co-change count feed the highly-coupled tally.
const HIGH_COUPLING_THRESHOLD: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("analyzer {0} declares no metric computation")]
    MissingComputeMetrics(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct CouplingPair {
    pub a: String,
    pub b: String,
    pub cochanges: u32,
}

/// Convert one analyzer's raw report into its typed metrics value.
///
/// The couples computation mirrors the store writer exactly (same weight
/// floor, ordering, and truncation), so reading back `file_coupling`
/// records and computing metrics from the raw report agree.
pub fn compute_metrics(id: &str, report: &Report, config: &Config) -> Result<serde_json::Value> {
    match id {
        "couples" => couples_metrics(report, config),
        "shotness" => shotness_metrics(report),
        "imports" => imports_metrics(report),
        "typos" => typos_metrics(report),
        other => Err(MetricsError::MissingComputeMetrics(other.to_string()).into()),
    }
}

fn couples_metrics(report: &Report, config: &Config) -> Result<serde_json::Value> {
    let files: Vec<String> = read_key(report, "Files")?;
    let matrix: Vec<BTreeMap<usize, u32>> = read_key(report, "FilesMatrix")?;

    let mut pairs = Vec::new();
    for (i, row) in matrix.iter().enumerate() {
        for (&j, &count) in row {
            if i < j && count >= config.min_edge_weight {
                pairs.push(CouplingPair {
                    a: files[i].clone(),
                    b: files[j].clone(),
                    cochanges: count,
                });
            }
        }
    }
    pairs.sort_by(|x, y| {
        y.cochanges.cmp(&x.cochanges).then_with(|| (&x.a, &x.b).cmp(&(&y.a, &y.b)))
    });
    let high_coupling =
        pairs.iter().filter(|p| p.cochanges >= HIGH_COUPLING_THRESHOLD).count();
    let total_pairs = pairs.len();
    pairs.truncate(config.top_k_per_file);

    let people_matrix: Vec<BTreeMap<usize, u32>> =
        read_key(report, "PeopleMatrix").unwrap_or_default();

    Ok(serde_json::json!({
        "file_coupling": pairs,
        "aggregate": {
            "files": files.len(),
            "people": people_matrix.len(),
            "pairs": total_pairs,
            "high_coupling_pairs": high_coupling,
        },
    }))
}

fn shotness_metrics(report: &Report) -> Result<serde_json::Value> {
    #[derive(serde::Deserialize)]
    struct Node {
        kind: String,
        name: String,
        file: String,
        count: u32,
    }

    let nodes: Vec<Node> = read_key(report, "Nodes")?;
    let counters: Vec<BTreeMap<usize, u32>> = read_key(report, "Counters").unwrap_or_default();

    let mut hottest: Vec<&Node> = nodes.iter().collect();
    hottest.sort_by(|a, b| {
        b.count.cmp(&a.count).then_with(|| (&a.file, &a.name).cmp(&(&b.file, &b.name)))
    });

    let mut coupled = Vec::new();
    for (i, row) in counters.iter().enumerate() {
        for (&j, &count) in row {
            if i < j {
                coupled.push(serde_json::json!({
                    "a": format!("{}:{}", nodes[i].file, nodes[i].name),
                    "b": format!("{}:{}", nodes[j].file, nodes[j].name),
                    "cochanges": count,
                }));
            }
        }
    }

    Ok(serde_json::json!({
        "total_nodes": nodes.len(),
        "hottest": hottest
            .iter()
            .take(50)
            .map(|n| serde_json::json!({
                "kind": n.kind, "name": n.name, "file": n.file, "count": n.count,
            }))
            .collect::<Vec<_>>(),
        "node_coupling": coupled,
    }))
}

fn imports_metrics(report: &Report) -> Result<serde_json::Value> {
    type ImportsMap =
        BTreeMap<usize, BTreeMap<String, BTreeMap<String, BTreeMap<u32, u64>>>>;
    let imports: ImportsMap = read_key(report, "imports")?;

    let mut per_language: BTreeMap<String, u64> = BTreeMap::new();
    let mut per_author: BTreeMap<usize, u64> = BTreeMap::new();
    for (author, langs) in &imports {
        for (lang, paths) in langs {
            let total: u64 = paths.values().flat_map(|ticks| ticks.values()).sum();
            *per_language.entry(lang.clone()).or_default() += total;
            *per_author.entry(*author).or_default() += total;
        }
    }

    Ok(serde_json::json!({
        "per_language": per_language,
        "per_author": per_author,
    }))
}

fn typos_metrics(report: &Report) -> Result<serde_json::Value> {
    let typos: Vec<serde_json::Value> = read_key(report, "typos").unwrap_or_default();
    Ok(serde_json::json!({
        "count": typos.len(),
        "typos": typos,
    }))
}

fn read_key<T: serde::de::DeserializeOwned>(report: &Report, key: &str) -> Result<T> {
    let value = report
        .get(key)
        .ok_or_else(|| anyhow::anyhow!("report is missing key {:?}", key))?;
    Ok(serde_json::from_value(value.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregator;
    use crate::aggregate::DirectStoreWriter;
    use crate::aggregate::RepoAccess;
    use crate::core::CommitHash;
    use crate::core::Tc;
    use crate::core::TcData;
    use crate::couples::CouplesAggregator;
    use crate::couples::CouplesCommitData;
    use crate::store::AnalyzerMeta;
    use crate::store::ReportStore;

    struct NoRepo;
    impl RepoAccess for NoRepo {
        fn current_files(&self) -> Option<Vec<String>> {
            None
        }
        fn count_lines(&self, _file: &str) -> Option<usize> {
            None
        }
    }

    fn couples_tc(author: usize, files: &[&str]) -> Tc {
        Tc {
            tick: 0,
            author_id: author,
            commit_hash: CommitHash::from_bytes([author as u8 + 1; 20]),
            data: TcData::Couples(CouplesCommitData {
                coupling_files: files.iter().map(|f| f.to_string()).collect(),
                author_files: files.iter().map(|f| (f.to_string(), 1)).collect(),
                renames: Vec::new(),
                commit_counted: true,
            }),
        }
    }

    #[test]
    fn unknown_analyzer_has_no_compute() {
        let err = compute_metrics("mystery", &Report::new(), &Config::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MetricsError>(),
            Some(MetricsError::MissingComputeMetrics(_))
        ));
    }

    #[test]
    fn store_and_report_paths_agree_on_file_coupling() {
        let config = Config::default();
        let mut agg = CouplesAggregator::new(&config);
        agg.add(couples_tc(0, &["a", "b"])).unwrap();
        agg.add(couples_tc(1, &["a", "b"])).unwrap();
        agg.add(couples_tc(2, &["a", "c"])).unwrap();

        // Store path.
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::open_root(dir.path()).unwrap();
        let meta = AnalyzerMeta {
            analyzer_id: "couples".into(),
            version: 1,
            schema_hash: "h".into(),
        };
        let mut writer = store.begin("couples", &meta).unwrap();
        agg.as_direct_store_writer().unwrap().write_to_store(&mut writer, &NoRepo).unwrap();
        writer.close().unwrap();
        let stored: Vec<CouplingPair> = store
            .open("couples")
            .unwrap()
            .read_all("file_coupling")
            .unwrap()
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();

        // Report path.
        let records = agg.flush_all_ticks().unwrap().unwrap();
        let report: Report =
            serde_json::from_value(records.last().unwrap().data.clone()).unwrap();
        let metrics = compute_metrics("couples", &report, &config).unwrap();
        let computed: Vec<CouplingPair> =
            serde_json::from_value(metrics["file_coupling"].clone()).unwrap();

        assert_eq!(stored, computed);
        assert_eq!(stored[0], CouplingPair { a: "a".into(), b: "b".into(), cochanges: 2 });

        let stored_aggregate =
            &store.open("couples").unwrap().read_all("aggregate").unwrap()[0];
        assert_eq!(stored_aggregate["pairs"], metrics["aggregate"]["pairs"]);
        assert_eq!(
            stored_aggregate["high_coupling_pairs"],
            metrics["aggregate"]["high_coupling_pairs"]
        );
        agg.close().unwrap();
    }

    #[test]
    fn imports_metrics_totals() {
        let mut report = Report::new();
        report.insert(
            "imports".to_string(),
            serde_json::json!({
                "0": { "python": { "os": { "0": 2, "1": 1 } } },
                "1": { "go": { "fmt": { "0": 4 } } },
            }),
        );
        let metrics = compute_metrics("imports", &report, &Config::default()).unwrap();
        assert_eq!(metrics["per_language"]["python"], 3);
        assert_eq!(metrics["per_language"]["go"], 4);
        assert_eq!(metrics["per_author"]["0"], 3);
    }

    #[test]
    fn typos_metrics_count() {
        let mut report = Report::new();
        report.insert(
            "typos".to_string(),
            serde_json::json!([{ "wrong": "recieve", "correct": "receive" }]),
        );
        let metrics = compute_metrics("typos", &report, &Config::default()).unwrap();
        assert_eq!(metrics["count"], 1);
    }
}
