use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::bail;
use anyhow::Context as AnyhowContext;
use anyhow::Result;
use similar::DiffTag;
use similar::TextDiff;

use crate::core::AuthorId;
use crate::core::CommitHash;
use crate::core::Config;
use crate::core::Tick;
use crate::identity::IdentityDetector;
use crate::languages::Lang;
use crate::uast;
use crate::uast::UastChange;

/// Blobs above this size are treated as opaque (no line diff, no UAST).
const MAX_BLOB_BYTES: usize = 1 << 20;

/// Cooperative cancellation scope propagated to every operation that may
/// block. Aborts at the next suspension point; durably written state is
/// never rolled back.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            bail!("operation cancelled");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Modify,
    Delete,
}

/// One file-level entry of the commit-vs-first-parent tree diff.
#[derive(Debug, Clone)]
pub struct TreeChange {
    pub kind: ChangeKind,
    pub old_name: Option<String>,
    pub new_name: Option<String>,
}

impl TreeChange {
    /// The "new" name, falling back to the "from" name for deletes.
    pub fn name(&self) -> &str {
        self.new_name.as_deref().or(self.old_name.as_deref()).unwrap_or("")
    }

    pub fn is_rename(&self) -> bool {
        match (&self.old_name, &self.new_name) {
            (Some(old), Some(new)) => old != new,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
    Delete,
    Insert,
}

/// One run of deleted or inserted lines. Delete runs address old-side line
/// numbers, insert runs new-side; both are 1-based inclusive.
#[derive(Debug, Clone, Copy)]
pub struct DiffRun {
    pub op: DiffOp,
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone)]
pub struct FileDiff {
    pub file: String,
    pub old_name: Option<String>,
    /// Old-side text; the new side lives in the context's blob cache.
    pub old_text: Option<String>,
    pub runs: Vec<DiffRun>,
}

/// One-shot per-commit input handed to each analyzer. Populated by the
/// plumbing pipeline; read-only to analyzers.
#[derive(Debug)]
pub struct Context {
    pub time: i64,
    pub index: usize,
    pub hash: CommitHash,
    pub is_merge: bool,
    pub author_id: AuthorId,
    pub author: String,
    pub tick: Tick,
    pub tree_changes: Vec<TreeChange>,
    pub blob_cache: HashMap<String, String>,
    pub file_diffs: Vec<FileDiff>,
    pub uast_changes: Vec<UastChange>,
}

/// The shared per-commit pipeline: tree diff, line diffs, UAST extraction,
/// identity, tick assignment. Rebuilt state is published once per commit
/// as a read-only [Context].
pub struct Plumbing {
    identity: IdentityDetector,
    first_time: Option<i64>,
    granularity_secs: i64,
    cancel: CancelToken,
}

impl Plumbing {
    pub fn new(config: &Config, cancel: CancelToken) -> Self {
        Self {
            identity: IdentityDetector::new(),
            first_time: None,
            granularity_secs: config.granularity_hours.max(1) as i64 * 3600,
            cancel,
        }
    }

    pub fn people(&self) -> &[String] {
        self.identity.people()
    }

    /// Serialize the cross-commit plumbing state (identity table and the
    /// tick base) for checkpointing.
    pub fn checkpoint_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(&self.identity, self.first_time))?)
    }

    pub fn restore_bytes(&mut self, image: &[u8]) -> Result<()> {
        let (identity, first_time) = bincode::deserialize(image)?;
        self.identity = identity;
        self.first_time = first_time;
        Ok(())
    }

    pub fn process(
        &mut self,
        repo: &git2::Repository,
        commit: &git2::Commit<'_>,
        index: usize,
    ) -> Result<Context> {
        self.cancel.check()?;

        let time = commit.time().seconds();
        let first = *self.first_time.get_or_insert(time);
        let tick = ((time - first).max(0) / self.granularity_secs) as Tick;

        let author = commit.author();
        let author_id = self
            .identity
            .resolve(author.name().unwrap_or(""), author.email().unwrap_or(""));
        let author_display = self.identity.people()[author_id].clone();

        let new_tree = commit.tree().context("resolve commit tree")?;
        let old_tree = match commit.parent_count() {
            0 => None,
            _ => Some(commit.parent(0)?.tree().context("resolve parent tree")?),
        };

        let mut opts = git2::DiffOptions::new();
        opts.ignore_filemode(true);
        let mut diff = repo
            .diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut opts))
            .context("tree diff")?;
        let mut find = git2::DiffFindOptions::new();
        find.renames(true);
        diff.find_similar(Some(&mut find)).context("rename detection")?;

        let mut tree_changes = Vec::new();
        let mut blob_cache = HashMap::new();
        let mut file_diffs = Vec::new();
        let mut uast_changes = Vec::new();

        for delta in diff.deltas() {
            self.cancel.check()?;

            let old_name = delta.old_file().path().and_then(|p| p.to_str()).map(String::from);
            let new_name = delta.new_file().path().and_then(|p| p.to_str()).map(String::from);

            let kind = match delta.status() {
                git2::Delta::Added | git2::Delta::Copied => ChangeKind::Insert,
                git2::Delta::Deleted => ChangeKind::Delete,
                git2::Delta::Modified | git2::Delta::Renamed => ChangeKind::Modify,
                _ => continue,
            };

            let change = TreeChange {
                kind,
                old_name: if kind == ChangeKind::Insert { None } else { old_name },
                new_name: if kind == ChangeKind::Delete { None } else { new_name },
            };

            let old_text = match kind {
                ChangeKind::Insert => None,
                _ => read_blob(repo, delta.old_file().id()),
            };
            let new_text = match kind {
                ChangeKind::Delete => None,
                _ => read_blob(repo, delta.new_file().id()),
            };

            if let Some(text) = new_text.as_ref() {
                blob_cache.insert(change.name().to_string(), text.clone());
            }

            if kind != ChangeKind::Delete {
                if let Some(new_text) = &new_text {
                    let runs =
                        line_runs(old_text.as_deref().unwrap_or(""), new_text);
                    file_diffs.push(FileDiff {
                        file: change.name().to_string(),
                        old_name: change.old_name.clone(),
                        old_text: old_text.clone(),
                        runs,
                    });
                }
            }

            if let Some(uast_change) = to_uast_change(&change, old_text.as_deref(), new_text.as_deref()) {
                uast_changes.push(uast_change);
            }

            tree_changes.push(change);
        }

        Ok(Context {
            time,
            index,
            hash: commit.id().into(),
            is_merge: commit.parent_count() > 1,
            author_id,
            author: author_display,
            tick,
            tree_changes,
            blob_cache,
            file_diffs,
            uast_changes,
        })
    }
}

/// Compute deleted/inserted line runs between two texts.
pub fn line_runs(old: &str, new: &str) -> Vec<DiffRun> {
    let diff = TextDiff::from_lines(old, new);
    let mut runs = Vec::new();
    for op in diff.ops() {
        let old_range = op.old_range();
        let new_range = op.new_range();
        match op.tag() {
            DiffTag::Equal => {}
            DiffTag::Delete | DiffTag::Replace => {
                if !old_range.is_empty() {
                    runs.push(DiffRun {
                        op: DiffOp::Delete,
                        start: old_range.start as u32 + 1,
                        end: old_range.end as u32,
                    });
                }
                if op.tag() == DiffTag::Replace && !new_range.is_empty() {
                    runs.push(DiffRun {
                        op: DiffOp::Insert,
                        start: new_range.start as u32 + 1,
                        end: new_range.end as u32,
                    });
                }
            }
            DiffTag::Insert => {
                if !new_range.is_empty() {
                    runs.push(DiffRun {
                        op: DiffOp::Insert,
                        start: new_range.start as u32 + 1,
                        end: new_range.end as u32,
                    });
                }
            }
        }
    }
    runs
}

fn read_blob(repo: &git2::Repository, id: git2::Oid) -> Option<String> {
    if id.is_zero() {
        return None;
    }
    let blob = repo.find_blob(id).ok()?;
    if blob.is_binary() || blob.size() > MAX_BLOB_BYTES {
        return None;
    }
    std::str::from_utf8(blob.content()).ok().map(String::from)
}

fn to_uast_change(
    change: &TreeChange,
    old_text: Option<&str>,
    new_text: Option<&str>,
) -> Option<UastChange> {
    let parseable = |name: &Option<String>| {
        name.as_deref().map(|n| Lang::of(n).is_some()).unwrap_or(false)
    };
    if !parseable(&change.old_name) && !parseable(&change.new_name) {
        return None;
    }

    let before = match (&change.old_name, old_text) {
        (Some(name), Some(text)) => uast::extract_tree(name, text),
        _ => None,
    };
    let after = match (&change.new_name, new_text) {
        (Some(name), Some(text)) => uast::extract_tree(name, text),
        _ => None,
    };
    if before.is_none() && after.is_none() {
        return None;
    }
    Some(UastChange {
        file_before: change.old_name.clone(),
        file_after: change.new_name.clone(),
        before,
        after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_texts_have_no_runs() {
        assert!(line_runs("a\nb\n", "a\nb\n").is_empty());
    }

    #[test]
    fn pure_insert_addresses_new_side() {
        let runs = line_runs("a\nb\n", "a\nx\ny\nb\n");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].op, DiffOp::Insert);
        assert_eq!((runs[0].start, runs[0].end), (2, 3));
    }

    #[test]
    fn pure_delete_addresses_old_side() {
        let runs = line_runs("a\nx\ny\nb\n", "a\nb\n");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].op, DiffOp::Delete);
        assert_eq!((runs[0].start, runs[0].end), (2, 3));
    }

    #[test]
    fn replace_emits_both_runs() {
        let runs = line_runs("a\nold\nb\n", "a\nnew\nb\n");
        let ops: Vec<_> = runs.iter().map(|r| r.op).collect();
        assert_eq!(ops, vec![DiffOp::Delete, DiffOp::Insert]);
        assert_eq!((runs[0].start, runs[0].end), (2, 2));
        assert_eq!((runs[1].start, runs[1].end), (2, 2));
    }

    #[test]
    fn cancel_token_trips_check() {
        let token = CancelToken::default();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.check().is_err());
    }

    #[test]
    fn tree_change_name_falls_back_to_old() {
        let deleted = TreeChange {
            kind: ChangeKind::Delete,
            old_name: Some("gone.rs".into()),
            new_name: None,
        };
        assert_eq!(deleted.name(), "gone.rs");
        let renamed = TreeChange {
            kind: ChangeKind::Modify,
            old_name: Some("a.rs".into()),
            new_name: Some("b.rs".into()),
        };
        assert!(renamed.is_rename());
        assert_eq!(renamed.name(), "b.rs");
    }
}
