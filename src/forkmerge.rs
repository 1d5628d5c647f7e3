use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use anyhow::bail;
use anyhow::Context as AnyhowContext;
use anyhow::Result;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;

use crate::analyzer::HistoryAnalyzer;
use crate::core::Tc;
use crate::plumbing::CancelToken;
use crate::plumbing::Context;

/// Opaque per-commit capture of plumbing outputs, fed to forked clones.
/// Releasing a snapshot is dropping it; the underlying context (including
/// its UAST trees) is freed once the last branch lets go.
#[derive(Clone)]
pub struct Snapshot(pub Arc<Context>);

/// One TC produced on a worker, tagged for chronological replay.
pub struct BranchResult {
    pub slot: usize,
    pub index: usize,
    pub tc: Tc,
}

struct Job {
    slot: usize,
    snapshot: Snapshot,
}

struct WorkerOutput {
    forks: HashMap<usize, Box<dyn HistoryAnalyzer>>,
    results: Vec<BranchResult>,
}

/// Worker pool executing CPU-heavy analyzers over plumbing snapshots.
///
/// Each worker owns one fork of every heavy analyzer, so no working state
/// is shared across threads. Results carry the commit index; the caller
/// replays them in chronological order at the chunk boundary, then
/// `finish` folds fork state back into the canonical analyzers.
pub struct ForkController {
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<WorkerOutput>>,
    error: Arc<Mutex<Option<String>>>,
}

impl ForkController {
    /// Fork every heavy analyzer `workers` ways and start the pool.
    /// `heavy` maps pool slots to analyzers (by index into the caller's
    /// analyzer list).
    pub fn start(
        heavy: Vec<(usize, Vec<Box<dyn HistoryAnalyzer>>)>,
        workers: usize,
        cancel: CancelToken,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        // Transpose: worker w takes fork w of each analyzer.
        let mut per_worker: Vec<HashMap<usize, Box<dyn HistoryAnalyzer>>> =
            (0..workers).map(|_| HashMap::new()).collect();
        for (slot, forks) in heavy {
            for (w, fork) in forks.into_iter().enumerate() {
                per_worker[w].insert(slot, fork);
            }
        }

        let handles = per_worker
            .into_iter()
            .map(|forks| {
                let rx = rx.clone();
                let error = error.clone();
                let cancel = cancel.clone();
                thread::spawn(move || worker_loop(forks, rx, error, cancel))
            })
            .collect();

        Self { tx: Some(tx), handles, error }
    }

    pub fn dispatch(&self, slot: usize, snapshot: Snapshot) -> Result<()> {
        let tx = self.tx.as_ref().context("controller already finished")?;
        tx.send(Job { slot, snapshot }).context("worker pool hung up")?;
        Ok(())
    }

    /// Close the channel, join the workers, fold fork state back into the
    /// canonical analyzers, and return the branch results sorted by commit
    /// index. The first worker error aborts.
    pub fn finish(
        mut self,
        analyzers: &mut [Box<dyn HistoryAnalyzer>],
    ) -> Result<Vec<BranchResult>> {
        self.tx.take();

        let mut branches: HashMap<usize, Vec<Box<dyn HistoryAnalyzer>>> = HashMap::new();
        let mut results = Vec::new();
        for handle in self.handles.drain(..) {
            let output = match handle.join() {
                Ok(output) => output,
                Err(_) => bail!("worker panicked"),
            };
            for (slot, fork) in output.forks {
                branches.entry(slot).or_default().push(fork);
            }
            results.extend(output.results);
        }

        if let Some(message) = self.error.lock().unwrap().take() {
            bail!("worker error: {}", message);
        }

        for (slot, forks) in branches {
            analyzers[slot].merge(forks);
        }

        results.sort_by_key(|r| (r.slot, r.index));
        Ok(results)
    }
}

fn worker_loop(
    mut forks: HashMap<usize, Box<dyn HistoryAnalyzer>>,
    rx: Receiver<Job>,
    error: Arc<Mutex<Option<String>>>,
    cancel: CancelToken,
) -> WorkerOutput {
    let mut results = Vec::new();
    for job in rx.iter() {
        // After the first error (or cancellation) keep draining so the
        // sender never blocks, but do no more work.
        if cancel.is_cancelled() || error.lock().unwrap().is_some() {
            continue;
        }
        let Some(fork) = forks.get_mut(&job.slot) else {
            continue;
        };
        let index = job.snapshot.0.index;
        match fork.consume(&job.snapshot.0) {
            Ok(tc) => results.push(BranchResult { slot: job.slot, index, tc }),
            Err(err) => {
                let mut slot = error.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(format!("{:#}", err));
                }
            }
        }
    }
    WorkerOutput { forks, results }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::TyposHistory;
    use crate::core::CommitHash;
    use crate::core::TcData;
    use crate::plumbing::line_runs;
    use crate::plumbing::FileDiff;

    fn typo_context(index: usize) -> Context {
        let old_src = "let recieved = 1;\n";
        let new_src = "let received = 1;\n";
        let mut blob_cache = std::collections::HashMap::new();
        blob_cache.insert("a.rs".to_string(), new_src.to_string());
        Context {
            time: index as i64,
            index,
            hash: CommitHash::from_bytes([index as u8 + 1; 20]),
            is_merge: false,
            author_id: 0,
            author: "a <a@x>".into(),
            tick: 0,
            tree_changes: Vec::new(),
            blob_cache,
            file_diffs: vec![FileDiff {
                file: "a.rs".into(),
                old_name: Some("a.rs".into()),
                old_text: Some(old_src.to_string()),
                runs: line_runs(old_src, new_src),
            }],
            uast_changes: Vec::new(),
        }
    }

    #[test]
    fn pool_processes_every_commit_once() {
        let mut analyzers: Vec<Box<dyn HistoryAnalyzer>> = vec![Box::new(TyposHistory::new())];
        let workers = 3;
        let heavy = vec![(0usize, analyzers[0].fork(workers))];
        let controller = ForkController::start(heavy, workers, CancelToken::default());

        let total = 10;
        for index in 0..total {
            controller.dispatch(0, Snapshot(Arc::new(typo_context(index)))).unwrap();
        }
        let results = controller.finish(&mut analyzers).unwrap();

        assert_eq!(results.len(), total);
        let indices: Vec<usize> = results.iter().map(|r| r.index).collect();
        assert_eq!(indices, (0..total).collect::<Vec<_>>(), "replay order is chronological");
        assert!(results.iter().all(|r| matches!(r.tc.data, TcData::Typos(_))));
    }

    #[test]
    fn cancellation_stops_work_without_deadlock() {
        let mut analyzers: Vec<Box<dyn HistoryAnalyzer>> = vec![Box::new(TyposHistory::new())];
        let workers = 2;
        let heavy = vec![(0usize, analyzers[0].fork(workers))];
        let cancel = CancelToken::default();
        let controller = ForkController::start(heavy, workers, cancel.clone());

        cancel.cancel();
        for index in 0..100 {
            controller.dispatch(0, Snapshot(Arc::new(typo_context(index)))).unwrap();
        }
        let results = controller.finish(&mut analyzers).unwrap();
        assert!(results.is_empty());
    }
}
