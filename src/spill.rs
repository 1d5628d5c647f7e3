use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Persisted handle to a store's on-disk state, carried across hibernation
/// and checkpoints. An empty `dir` means no spill has occurred.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct SpillState {
    pub dir: PathBuf,
    pub count: usize,
}

impl SpillState {
    pub fn is_empty(&self) -> bool {
        self.dir.as_os_str().is_empty()
    }
}

/// Generic disk-backed `String -> V` map.
///
/// Behaves as an in-memory mapping until [SpillStore::spill] is called,
/// which serializes the buffer to a numbered chunk file under a lazily
/// created temp directory and clears it. Spilled data survives hibernation
/// and checkpointing of the owning aggregator, but not beyond
/// [SpillStore::collect] / [SpillStore::cleanup].
pub struct SpillStore<V> {
    buffer: HashMap<String, V>,
    tmp_root: PathBuf,
    dir: Option<PathBuf>,
    count: usize,
}

impl<V: Serialize + DeserializeOwned> SpillStore<V> {
    pub fn new<P: AsRef<Path>>(tmp_root: P) -> Self {
        Self {
            buffer: HashMap::new(),
            tmp_root: tmp_root.as_ref().to_path_buf(),
            dir: None,
            count: 0,
        }
    }

    pub fn put(&mut self, key: String, value: V) {
        self.buffer.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.buffer.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.buffer.get_mut(key)
    }

    pub fn entry_or_default(&mut self, key: &str) -> &mut V
    where
        V: Default,
    {
        self.buffer.entry(key.to_string()).or_default()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Read-only view of the in-memory buffer. Callers must not rely on it
    /// containing spilled entries.
    pub fn current(&self) -> &HashMap<String, V> {
        &self.buffer
    }

    /// Serialize the buffer to the next numbered chunk file and clear it.
    /// No-op on an empty buffer.
    pub fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let dir = self.ensure_dir()?;
        let index = self.count;
        let path = dir.join(chunk_name(index));
        let file = File::create(&path).with_context(|| format!("create spill chunk {}", index))?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &self.buffer)
            .with_context(|| format!("write spill chunk {}", index))?;
        self.count += 1;
        self.buffer.clear();
        Ok(())
    }

    /// Merge every chunk and the current buffer into one mapping; later
    /// entries overwrite earlier ones. Removes the temp directory and
    /// resets the spill counter. The store is empty afterwards.
    pub fn collect(&mut self) -> Result<HashMap<String, V>> {
        self.collect_with(|_, incoming| incoming)
    }

    /// Like [SpillStore::collect], but resolves key conflicts with `merge`.
    pub fn collect_with<F>(&mut self, merge: F) -> Result<HashMap<String, V>>
    where
        F: Fn(V, V) -> V,
    {
        let mut merged: HashMap<String, V> = HashMap::new();
        let mut absorb = |target: &mut HashMap<String, V>, chunk: HashMap<String, V>| {
            for (key, value) in chunk {
                match target.remove(&key) {
                    Some(existing) => {
                        target.insert(key, merge(existing, value));
                    }
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        };

        if let Some(dir) = self.dir.clone() {
            for index in 0..self.count {
                absorb(&mut merged, read_chunk(&dir, index)?);
            }
        }
        absorb(&mut merged, std::mem::take(&mut self.buffer));
        self.cleanup()?;
        Ok(merged)
    }

    /// Yield each chunk (and finally the current buffer) in write order
    /// without materializing the union. Used for filtered collection.
    pub fn for_each_spill<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&HashMap<String, V>) -> Result<()>,
    {
        if let Some(dir) = &self.dir {
            for index in 0..self.count {
                let chunk = read_chunk(dir, index)?;
                visit(&chunk)?;
            }
        }
        visit(&self.buffer)
    }

    /// Attach to an existing spill directory (checkpoint resume).
    pub fn restore_from_dir(&mut self, state: SpillState) {
        if state.is_empty() {
            self.dir = None;
            self.count = 0;
        } else {
            self.dir = Some(state.dir);
            self.count = state.count;
        }
    }

    pub fn spill_state(&self) -> SpillState {
        match &self.dir {
            Some(dir) => SpillState { dir: dir.clone(), count: self.count },
            None => SpillState::default(),
        }
    }

    /// Remove the temp directory and reset the spill counter.
    pub fn cleanup(&mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("remove spill dir {}", dir.display()))?;
            }
        }
        self.count = 0;
        Ok(())
    }

    pub fn spill_count(&self) -> usize {
        self.count
    }

    fn ensure_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.dir {
            return Ok(dir.clone());
        }
        let dir = tempfile::Builder::new()
            .prefix("codefang-spill-")
            .tempdir_in(&self.tmp_root)
            .context("create spill temp dir")?
            .into_path();
        self.dir = Some(dir.clone());
        Ok(dir)
    }
}

fn chunk_name(index: usize) -> String {
    format!("chunk_{:03}.bin", index)
}

fn read_chunk<V: DeserializeOwned>(dir: &Path, index: usize) -> Result<HashMap<String, V>> {
    let path = dir.join(chunk_name(index));
    let file = File::open(&path).with_context(|| format!("open spill chunk {}", index))?;
    bincode::deserialize_from(BufReader::new(file))
        .with_context(|| format!("decode spill chunk {}", index))
}
