use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use anyhow::Result;
use serde::Serialize;

const MANIFEST: &str = "manifest.json";
const META: &str = "meta.json";
const RECORD_EXT: &str = "bin";
const TMP_EXT: &str = "tmp";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("analyzer not found in store: {0}")]
    AnalyzerNotFound(String),
    /// An uncommitted `.tmp` file was observed in the analyzer directory,
    /// meaning a writer did not close cleanly.
    #[error("torn write detected: {0}")]
    TornWrite(PathBuf),
    #[error("write after close")]
    WriterClosed,
}

/// Identity block persisted beside each analyzer's record files.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct AnalyzerMeta {
    pub analyzer_id: String,
    pub version: u32,
    pub schema_hash: String,
}

#[derive(Debug, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
struct Manifest {
    analyzer_ids: Vec<String>,
}

struct StoreShared {
    root: PathBuf,
    // Guards manifest read-modify-write; record writers hold no cross-store
    // locks.
    manifest_lock: Mutex<()>,
}

/// Atomic per-analyzer record-stream store.
///
/// Writers own `.tmp` files until `close` renames them into place; the
/// manifest only ever lists analyzers whose writer closed cleanly.
#[derive(Clone)]
pub struct ReportStore {
    shared: Arc<StoreShared>,
}

impl ReportStore {
    pub fn open_root<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create store root {}", root.display()))?;
        Ok(Self { shared: Arc::new(StoreShared { root, manifest_lock: Mutex::new(()) }) })
    }

    /// Create the analyzer directory, persist its meta block, and return a
    /// writer. The manifest is not updated until the writer closes.
    pub fn begin(&self, id: &str, meta: &AnalyzerMeta) -> Result<RecordWriter> {
        let dir = self.shared.root.join(safe_id(id));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create analyzer dir {}", dir.display()))?;
        let meta_json = serde_json::to_vec_pretty(meta)?;
        std::fs::write(dir.join(META), meta_json)
            .with_context(|| format!("write meta for {}", id))?;
        Ok(RecordWriter {
            shared: self.shared.clone(),
            analyzer_id: id.to_string(),
            dir,
            buffers: BTreeMap::new(),
            closed: false,
        })
    }

    /// Open one analyzer's records for reading. Fails with
    /// [StoreError::TornWrite] if any `.tmp` file exists in the directory,
    /// regardless of record contents.
    pub fn open(&self, id: &str) -> Result<RecordReader> {
        let dir = self.shared.root.join(safe_id(id));
        if !dir.is_dir() {
            return Err(StoreError::AnalyzerNotFound(id.to_string()).into());
        }
        let meta: AnalyzerMeta =
            serde_json::from_slice(&std::fs::read(dir.join(META)).context("read meta.json")?)
                .context("decode meta.json")?;

        let mut kinds = Vec::new();
        for entry in std::fs::read_dir(&dir).context("scan analyzer dir")? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(TMP_EXT) => return Err(StoreError::TornWrite(path).into()),
                Some(RECORD_EXT) => {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        kinds.push(stem.to_string());
                    }
                }
                _ => {}
            }
        }
        kinds.sort();
        Ok(RecordReader { dir, kinds, meta })
    }

    pub fn manifest(&self) -> Result<Vec<String>> {
        let path = self.shared.root.join(MANIFEST);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let manifest: Manifest =
            serde_json::from_slice(&std::fs::read(&path)?).context("decode manifest.json")?;
        Ok(manifest.analyzer_ids)
    }
}

/// Slashes in analyzer ids would escape the store directory.
fn safe_id(id: &str) -> String {
    id.replace('/', "_")
}

pub struct RecordWriter {
    shared: Arc<StoreShared>,
    analyzer_id: String,
    dir: PathBuf,
    buffers: BTreeMap<String, Vec<u8>>,
    closed: bool,
}

impl RecordWriter {
    /// Encode the record to bytes, then append it to the kind's buffer as a
    /// length-prefixed frame.
    pub fn write<R: Serialize>(&mut self, kind: &str, record: &R) -> Result<()> {
        if self.closed {
            return Err(StoreError::WriterClosed.into());
        }
        let payload = serde_json::to_vec(record)?;
        let buffer = self.buffers.entry(kind.to_string()).or_default();
        buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buffer.extend_from_slice(&payload);
        Ok(())
    }

    /// Commit all kind buffers (tmp + fsync + rename each) and register
    /// the analyzer in the manifest. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for (kind, buffer) in std::mem::take(&mut self.buffers) {
            let tmp = self.dir.join(format!("{}.{}", kind, TMP_EXT));
            let path = self.dir.join(format!("{}.{}", kind, RECORD_EXT));
            let mut file =
                File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            file.write_all(&buffer)?;
            file.sync_all()?;
            drop(file);
            std::fs::rename(&tmp, &path)
                .with_context(|| format!("commit {}", path.display()))?;
        }

        let _guard = self.shared.manifest_lock.lock().unwrap();
        let path = self.shared.root.join(MANIFEST);
        let mut manifest: Manifest = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).context("decode manifest.json")?,
            Err(_) => Manifest::default(),
        };
        if !manifest.analyzer_ids.iter().any(|id| id == &self.analyzer_id) {
            manifest.analyzer_ids.push(self.analyzer_id.clone());
        }
        let tmp = self.shared.root.join(format!("{}.{}", MANIFEST, TMP_EXT));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&manifest)?)?;
        std::fs::rename(&tmp, &path).context("commit manifest.json")?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct RecordReader {
    dir: PathBuf,
    kinds: Vec<String>,
    meta: AnalyzerMeta,
}

impl RecordReader {
    /// Record kinds present for this analyzer, lexicographic.
    pub fn kinds(&self) -> &[String] {
        &self.kinds
    }

    pub fn meta(&self) -> &AnalyzerMeta {
        &self.meta
    }

    /// Yield raw frames one at a time; memory is O(1) in record count.
    pub fn iter<F>(&self, kind: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let path = self.dir.join(format!("{}.{}", kind, RECORD_EXT));
        let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let mut frame = Vec::new();
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err).context("read frame length"),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            frame.resize(len, 0);
            reader.read_exact(&mut frame).context("read frame payload")?;
            visit(&frame)?;
        }
    }

    /// Decode every frame of a kind as JSON values.
    pub fn read_all(&self, kind: &str) -> Result<Vec<serde_json::Value>> {
        let mut records = Vec::new();
        self.iter(kind, |frame| {
            records.push(serde_json::from_slice(frame)?);
            Ok(())
        })?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str) -> AnalyzerMeta {
        AnalyzerMeta { analyzer_id: id.into(), version: 1, schema_hash: "abc123".into() }
    }

    fn store() -> (tempfile::TempDir, ReportStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::open_root(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn write_read_round_trip() {
        let (_dir, store) = store();
        let mut writer = store.begin("couples", &meta("couples")).unwrap();
        writer.write("file_coupling", &serde_json::json!({"a": "x", "b": "y", "n": 3})).unwrap();
        writer.write("file_coupling", &serde_json::json!({"a": "x", "b": "z", "n": 1})).unwrap();
        writer.write("aggregate", &serde_json::json!({"total": 2})).unwrap();
        writer.close().unwrap();

        let reader = store.open("couples").unwrap();
        assert_eq!(reader.kinds(), ["aggregate", "file_coupling"]);
        let records = reader.read_all("file_coupling").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["n"], 3);
        assert_eq!(reader.meta().schema_hash, "abc123");
    }

    #[test]
    fn torn_write_detected_from_stray_tmp() {
        let (_dir, store) = store();
        let mut writer = store.begin("couples", &meta("couples")).unwrap();
        writer.write("ownership", &serde_json::json!({"file": "a"})).unwrap();
        writer.close().unwrap();

        // A crashed writer leaves a .tmp beside committed records.
        let stray = _dir.path().join("couples").join("dev_matrix.tmp");
        std::fs::write(&stray, b"partial").unwrap();

        let err = store.open("couples").unwrap_err();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::TornWrite(path)) => assert_eq!(path, &stray),
            other => panic!("expected TornWrite, got {:?}", other),
        }
    }

    #[test]
    fn open_without_tmp_succeeds_after_clean_close() {
        let (_dir, store) = store();
        let mut writer = store.begin("shotness", &meta("shotness")).unwrap();
        writer.write("nodes", &serde_json::json!({"k": 1})).unwrap();
        writer.close().unwrap();
        assert!(store.open("shotness").is_ok());
    }

    #[test]
    fn manifest_lists_id_once_even_after_double_close() {
        let (_dir, store) = store();
        let mut writer = store.begin("imports", &meta("imports")).unwrap();
        writer.write("imports", &serde_json::json!({})).unwrap();
        writer.close().unwrap();
        writer.close().unwrap();
        assert_eq!(store.manifest().unwrap(), ["imports"]);
    }

    #[test]
    fn manifest_omits_unclosed_writers() {
        let (_dir, store) = store();
        let mut closed = store.begin("a", &meta("a")).unwrap();
        closed.close().unwrap();
        let _unclosed = store.begin("b", &meta("b")).unwrap();
        assert_eq!(store.manifest().unwrap(), ["a"]);
    }

    #[test]
    fn write_after_close_is_rejected() {
        let (_dir, store) = store();
        let mut writer = store.begin("typos", &meta("typos")).unwrap();
        writer.close().unwrap();
        let err = writer.write("typos", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::WriterClosed)));
    }

    #[test]
    fn open_unknown_analyzer_fails() {
        let (_dir, store) = store();
        let err = store.open("nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::AnalyzerNotFound(_))
        ));
    }

    #[test]
    fn slashes_in_ids_are_sanitized() {
        let (_dir, store) = store();
        let mut writer = store.begin("history/couples", &meta("history/couples")).unwrap();
        writer.write("k", &serde_json::json!({})).unwrap();
        writer.close().unwrap();
        assert!(_dir.path().join("history_couples").is_dir());
        assert!(store.open("history/couples").is_ok());
    }
}
