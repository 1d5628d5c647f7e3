use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;

use crate::spill::SpillState;

const CHECKPOINT_FILE: &str = "checkpoint.bin";

/// Resumable-run image: per-analyzer state blobs (Bloom filters, node
/// registries) plus aggregator spill handles and the walk position.
///
/// Hibernation is separate and lighter: between chunks, analyzers shed
/// chunk-scoped state in place (merge trackers reset) while cumulative
/// state stays resident; nothing is written unless a checkpoint is asked
/// for.
#[derive(Debug, Clone, Default, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Checkpoint {
    pub commits_processed: usize,
    /// Identity table and tick base, so a resumed run assigns the same
    /// author ids and ticks a fresh run would.
    pub plumbing: Option<Vec<u8>>,
    pub analyzers: BTreeMap<String, Vec<u8>>,
    pub spill_states: BTreeMap<String, SpillState>,
}

/// Persist atomically: write to a `.tmp` sibling, then rename.
pub fn save(dir: &Path, checkpoint: &Checkpoint) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("create checkpoint dir {}", dir.display()))?;
    let tmp = dir.join(format!("{}.tmp", CHECKPOINT_FILE));
    let path = dir.join(CHECKPOINT_FILE);
    let bytes = bincode::serialize(checkpoint).context("encode checkpoint")?;
    std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).context("commit checkpoint")?;
    Ok(())
}

/// Load a prior checkpoint, or None when the directory holds none.
pub fn load(dir: &Path) -> Result<Option<Checkpoint>> {
    let path = dir.join(CHECKPOINT_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    Ok(Some(bincode::deserialize(&bytes).context("decode checkpoint")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn save_then_load_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint {
            commits_processed: 42,
            plumbing: Some(vec![9, 9]),
            analyzers: [("couples".to_string(), vec![1, 2, 3])].into_iter().collect(),
            spill_states: [(
                "couples".to_string(),
                SpillState { dir: PathBuf::from("/tmp/spill-x"), count: 2 },
            )]
            .into_iter()
            .collect(),
        };
        save(dir.path(), &checkpoint).unwrap();
        let loaded = load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn save_overwrites_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        save(dir.path(), &Checkpoint { commits_processed: 1, ..Default::default() }).unwrap();
        save(dir.path(), &Checkpoint { commits_processed: 2, ..Default::default() }).unwrap();
        let loaded = load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.commits_processed, 2);
        assert!(!dir.path().join("checkpoint.bin.tmp").exists());
    }

    #[test]
    fn analyzer_state_round_trips_through_checkpoint() {
        use crate::analyzer::CouplesHistory;
        use crate::analyzer::HistoryAnalyzer;

        let analyzer = CouplesHistory::new();
        let image = analyzer.checkpoint().unwrap().unwrap();
        let dir = tempfile::tempdir().unwrap();
        save(
            dir.path(),
            &Checkpoint {
                commits_processed: 0,
                plumbing: None,
                analyzers: [("couples".to_string(), image.clone())].into_iter().collect(),
                spill_states: BTreeMap::new(),
            },
        )
        .unwrap();

        let loaded = load(dir.path()).unwrap().unwrap();
        let mut fresh = CouplesHistory::new();
        fresh.restore(&loaded.analyzers["couples"]).unwrap();
        assert_eq!(loaded.analyzers["couples"], image);
    }
}
