use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

use anyhow::Context;
use anyhow::Result;
use itertools::Itertools;

use crate::core::CommitMeta;
use crate::core::DrainedStats;

pub const TIMESERIES_VERSION: &str = "codefang.timeseries.v1";

/// Merges per-chunk drains from every commit-stats-capable aggregator into
/// one flattened JSON object per commit and streams them as NDJSON.
///
/// Memory is O(chunk): drained data is written and dropped at every chunk
/// boundary instead of accumulating for the whole history.
pub struct TimeSeriesChunkFlusher {
    inner: Mutex<FlusherInner>,
}

struct FlusherInner {
    out: Option<Box<dyn Write + Send>>,
    commit_meta: HashMap<String, CommitMeta>,
    lines: usize,
}

impl TimeSeriesChunkFlusher {
    pub fn new(out: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            inner: Mutex::new(FlusherInner { out, commit_meta: HashMap::new(), lines: 0 }),
        }
    }

    /// Runner-maintained commit metadata, recorded as commits stream by.
    pub fn record_meta(&self, meta: CommitMeta) {
        let mut inner = self.inner.lock().unwrap();
        inner.commit_meta.insert(meta.hash.clone(), meta);
    }

    pub fn lines_written(&self) -> usize {
        self.inner.lock().unwrap().lines
    }

    /// Flush one chunk's drains: one JSON object per commit, analyzers
    /// keyed by flag. Returns the line objects (for document assembly).
    ///
    /// All custom aggregators see the same commits, so `commits_by_tick`
    /// is taken from the first non-empty drainer.
    pub fn flush_chunk(
        &self,
        drains: Vec<(String, DrainedStats)>,
    ) -> Result<Vec<serde_json::Value>> {
        let mut inner = self.inner.lock().unwrap();

        let mut active: Vec<(String, DrainedStats)> =
            drains.into_iter().filter(|(_, stats)| !stats.is_empty()).collect();
        let Some(commits_by_tick) = active
            .iter()
            .find(|(_, stats)| !stats.commits_by_tick.is_empty())
            .map(|(_, stats)| stats.commits_by_tick.clone())
        else {
            return Ok(Vec::new());
        };
        active.sort_by(|a, b| a.0.cmp(&b.0));

        let mut lines = Vec::new();
        for (&tick, hashes) in &commits_by_tick {
            for hash in hashes {
                let hex = hash.to_string();
                let mut object = serde_json::Map::new();
                match inner.commit_meta.get(&hex) {
                    Some(meta) => {
                        object.insert("hash".into(), meta.hash.clone().into());
                        object.insert("timestamp".into(), meta.timestamp.clone().into());
                        object.insert("author".into(), meta.author.clone().into());
                        object.insert("tick".into(), meta.tick.into());
                    }
                    None => {
                        object.insert("hash".into(), hex.clone().into());
                        object.insert("tick".into(), tick.into());
                    }
                }
                for (flag, stats) in &active {
                    if let Some(data) = stats.commit_data.get(&hex) {
                        object.insert(flag.clone(), data.clone());
                    }
                }
                lines.push(serde_json::Value::Object(object));
            }
        }

        if let Some(out) = inner.out.as_mut() {
            for line in &lines {
                serde_json::to_writer(&mut *out, line).context("encode timeseries line")?;
                out.write_all(b"\n").context("write timeseries line")?;
            }
            out.flush().context("flush timeseries output")?;
        }
        inner.lines += lines.len();
        Ok(lines)
    }
}

/// Assemble the unified `codefang.timeseries.v1` document from flushed
/// commit lines.
pub fn build_document(
    tick_size_hours: u32,
    analyzers: &[String],
    commits: Vec<serde_json::Value>,
) -> serde_json::Value {
    serde_json::json!({
        "version": TIMESERIES_VERSION,
        "tick_size_hours": tick_size_hours,
        "analyzers": analyzers.iter().sorted().collect::<Vec<_>>(),
        "commits": commits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CommitHash;
    use crate::core::Tick;
    use std::collections::BTreeMap;

    fn hash(n: u8) -> CommitHash {
        CommitHash::from_bytes([n; 20])
    }

    fn drained(hashes: &[(Tick, CommitHash)], value: &str) -> DrainedStats {
        let mut commits_by_tick: BTreeMap<Tick, Vec<CommitHash>> = BTreeMap::new();
        let mut commit_data = HashMap::new();
        for &(tick, h) in hashes {
            commits_by_tick.entry(tick).or_default().push(h);
            commit_data.insert(h.to_string(), serde_json::json!({ "v": value }));
        }
        DrainedStats { commit_data, commits_by_tick }
    }

    #[test]
    fn three_commits_make_three_lines_with_flags_in_order() {
        let commits = [(0, hash(1)), (0, hash(2)), (1, hash(3))];
        let flusher = TimeSeriesChunkFlusher::new(None);
        for (i, (tick, h)) in commits.iter().enumerate() {
            flusher.record_meta(CommitMeta {
                hash: h.to_string(),
                timestamp: format!("2024-01-0{}T00:00:00Z", i + 1),
                author: "alice <a@x>".into(),
                tick: *tick,
            });
        }

        let lines = flusher
            .flush_chunk(vec![
                ("shotness".into(), drained(&commits, "s")),
                ("couples".into(), drained(&commits, "c")),
            ])
            .unwrap();

        assert_eq!(lines.len(), 3);
        for line in &lines {
            let keys: Vec<&String> = line.as_object().unwrap().keys().collect();
            assert_eq!(keys, ["author", "couples", "hash", "shotness", "tick", "timestamp"]);
        }
        assert_eq!(lines[0]["hash"], hash(1).to_string());
        assert_eq!(lines[2]["tick"], 1);
        assert_eq!(flusher.lines_written(), 3);
    }

    #[test]
    fn per_tick_commit_order_is_preserved() {
        // Two commits in the same tick keep their recorded order.
        let commits = [(5, hash(9)), (5, hash(4))];
        let flusher = TimeSeriesChunkFlusher::new(None);
        let lines =
            flusher.flush_chunk(vec![("couples".into(), drained(&commits, "c"))]).unwrap();
        assert_eq!(lines[0]["hash"], hash(9).to_string());
        assert_eq!(lines[1]["hash"], hash(4).to_string());
    }

    #[test]
    fn empty_drains_produce_nothing() {
        let flusher = TimeSeriesChunkFlusher::new(None);
        let lines = flusher
            .flush_chunk(vec![("couples".into(), DrainedStats::default())])
            .unwrap();
        assert!(lines.is_empty());
        assert_eq!(flusher.lines_written(), 0);
    }

    #[test]
    fn ndjson_sink_receives_one_line_per_commit() {
        use std::sync::Arc;

        #[derive(Clone)]
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let sink = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let flusher = TimeSeriesChunkFlusher::new(Some(Box::new(sink.clone())));
        let commits = [(0, hash(1)), (0, hash(2))];
        flusher.flush_chunk(vec![("couples".into(), drained(&commits, "c"))]).unwrap();

        let bytes = sink.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        let parsed: Vec<serde_json::Value> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0]["couples"]["v"], "c");
    }

    #[test]
    fn document_wraps_commits_with_version() {
        let doc = build_document(
            24,
            &["shotness".to_string(), "couples".to_string()],
            vec![serde_json::json!({ "hash": "x" })],
        );
        assert_eq!(doc["version"], TIMESERIES_VERSION);
        assert_eq!(doc["tick_size_hours"], 24);
        assert_eq!(doc["analyzers"][0], "couples");
        assert_eq!(doc["commits"].as_array().unwrap().len(), 1);
    }
}
