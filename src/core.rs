use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Result;

use crate::couples::CouplesCommitData;
use crate::imports::ImportsCommitData;
use crate::shotness::ShotnessCommitData;
use crate::typos::TyposCommitData;

/// Discrete time bucket index, counted from the repository's first commit.
pub type Tick = u32;

/// Index into the people dictionary maintained by identity detection.
pub type AuthorId = usize;

/// Opaque 20-byte commit identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct CommitHash([u8; 20]);

impl CommitHash {
    pub const ZERO: CommitHash = CommitHash([0; 20]);

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(text: &str) -> Result<Self> {
        let raw = hex::decode(text)?;
        if raw.len() != 20 {
            bail!("expected 20 bytes of hash, got {}", raw.len());
        }
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for CommitHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for CommitHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CommitHash({})", self)
    }
}

impl From<git2::Oid> for CommitHash {
    fn from(oid: git2::Oid) -> Self {
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(oid.as_bytes());
        Self(bytes)
    }
}

/// Per-commit output of one analyzer's `consume`.
///
/// A [TcData::None] payload signals "nothing to record" for this commit.
#[derive(Debug, Clone)]
pub struct Tc {
    pub tick: Tick,
    pub author_id: AuthorId,
    pub commit_hash: CommitHash,
    pub data: TcData,
}

impl Tc {
    pub fn empty(tick: Tick, author_id: AuthorId, commit_hash: CommitHash) -> Self {
        Self { tick, author_id, commit_hash, data: TcData::None }
    }
}

#[derive(Debug, Clone)]
pub enum TcData {
    None,
    Couples(CouplesCommitData),
    Shotness(ShotnessCommitData),
    Imports(ImportsCommitData),
    Typos(TyposCommitData),
}

impl TcData {
    pub fn is_none(&self) -> bool {
        matches!(self, TcData::None)
    }

    pub fn label(&self) -> &'static str {
        match self {
            TcData::None => "none",
            TcData::Couples(_) => "couples",
            TcData::Shotness(_) => "shotness",
            TcData::Imports(_) => "imports",
            TcData::Typos(_) => "typos",
        }
    }
}

/// Per-tick aggregated output of one analyzer.
#[derive(Debug, Clone)]
#[derive(serde::Serialize)]
pub struct TickRecord {
    pub tick: Tick,
    pub data: serde_json::Value,
}

/// Schema-less string-keyed report bag. Per-analyzer keys are documented on
/// each analyzer's store writer.
pub type Report = BTreeMap<String, serde_json::Value>;

/// Per-commit summary drained between chunks for the unified time series.
#[derive(Debug, Clone, Default)]
pub struct DrainedStats {
    pub commit_data: HashMap<String, serde_json::Value>,
    pub commits_by_tick: BTreeMap<Tick, Vec<CommitHash>>,
}

impl DrainedStats {
    pub fn is_empty(&self) -> bool {
        self.commit_data.is_empty() && self.commits_by_tick.is_empty()
    }
}

/// Runner-maintained metadata for one commit, used to enrich the time series.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct CommitMeta {
    pub hash: String,
    pub timestamp: String,
    pub author: String,
    pub tick: Tick,
}

/// Analyzer-scope configuration, assembled from the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for spill and hibernation temp directories.
    pub tmp_dir: PathBuf,
    /// Tick width in hours.
    pub granularity_hours: u32,
    /// Commit sampling stride; 0 means every commit.
    pub sampling: u32,
    /// Commits per chunk between hibernation points; 0 means one chunk.
    pub chunk_size: usize,
    /// In-memory aggregator budget in bytes; 0 disables spilling.
    pub spill_budget: usize,
    /// Worker pool size for CPU-heavy analyzers.
    pub workers: usize,
    /// Minimum co-change count for a coupling pair to be reported.
    pub min_edge_weight: u32,
    /// Per-file cap on reported coupling pairs.
    pub top_k_per_file: usize,
    /// Node-selection query for shotness.
    pub shotness_struct: String,
    /// Name-extraction query for shotness.
    pub shotness_name: String,
    /// Where to persist/restore checkpoints; None disables checkpointing.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tmp_dir: std::env::temp_dir(),
            granularity_hours: 24,
            sampling: 0,
            chunk_size: 0,
            spill_budget: 0,
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            min_edge_weight: 1,
            top_k_per_file: 500,
            shotness_struct: crate::shotness::DSL_STRUCT_DEFAULT.to_string(),
            shotness_name: crate::shotness::DSL_NAME_DEFAULT.to_string(),
            checkpoint_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_round_trip() {
        let hash = CommitHash::from_bytes([0xab; 20]);
        let parsed = CommitHash::from_hex(&hash.to_string()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn hash_rejects_short_hex() {
        assert!(CommitHash::from_hex("abcd").is_err());
    }

    #[test]
    fn zero_hash_is_zero() {
        assert!(CommitHash::ZERO.is_zero());
        assert!(!CommitHash::from_bytes([1; 20]).is_zero());
    }
}
