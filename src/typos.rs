use anyhow::Result;
use itertools::Itertools;

use crate::aggregate::GenericAggregator;
use crate::aggregate::TickSemantics;
use crate::core::Config;
use crate::core::Tc;
use crate::core::TcData;
use crate::core::Tick;
use crate::core::TickRecord;
use crate::plumbing::Context;
use crate::plumbing::DiffOp;

/// Identifiers shorter than this produce too many accidental near-matches.
const MIN_IDENT_LEN: usize = 3;

/// Edit-distance window for a typo candidate.
const MAX_DISTANCE: usize = 2;

const CANDIDATE_BYTES: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TypoCandidate {
    pub wrong: String,
    pub correct: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TyposCommitData {
    pub candidates: Vec<TypoCandidate>,
}

/// Detects identifier typo fixes: a replaced line whose token at the same
/// position moved by a Damerau-Levenshtein distance of 1..=2.
#[derive(Debug, Default)]
pub struct TyposAnalyzer;

impl TyposAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn consume(&mut self, ctx: &Context) -> Result<Tc> {
        // Merge diffs replay both parents' work; only first-parent history
        // yields honest before/after line pairs.
        if ctx.is_merge {
            return Ok(Tc::empty(ctx.tick, ctx.author_id, ctx.hash));
        }

        let mut candidates = Vec::new();
        for diff in &ctx.file_diffs {
            let Some(old_text) = diff.old_text.as_deref() else {
                continue;
            };
            let Some(new_text) = ctx.blob_cache.get(&diff.file) else {
                continue;
            };
            let old_lines: Vec<&str> = old_text.lines().collect();
            let new_lines: Vec<&str> = new_text.lines().collect();

            // A Replace surfaces as a Delete run immediately followed by an
            // Insert run; pair their lines positionally.
            for (del, ins) in diff.runs.iter().tuple_windows() {
                if del.op != DiffOp::Delete || ins.op != DiffOp::Insert {
                    continue;
                }
                let old_range = (del.start as usize - 1)..(del.end as usize).min(old_lines.len());
                let new_range = (ins.start as usize - 1)..(ins.end as usize).min(new_lines.len());
                for (old_idx, new_idx) in old_range.zip(new_range) {
                    let line_no = new_idx as u32 + 1;
                    candidates.extend(line_candidates(
                        old_lines[old_idx],
                        new_lines[new_idx],
                        &diff.file,
                        line_no,
                    ));
                }
            }
        }

        if candidates.is_empty() {
            return Ok(Tc::empty(ctx.tick, ctx.author_id, ctx.hash));
        }
        Ok(Tc {
            tick: ctx.tick,
            author_id: ctx.author_id,
            commit_hash: ctx.hash,
            data: TcData::Typos(TyposCommitData { candidates }),
        })
    }
}

fn line_candidates(old: &str, new: &str, file: &str, line: u32) -> Vec<TypoCandidate> {
    let old_tokens = identifiers(old);
    let new_tokens = identifiers(new);
    old_tokens
        .iter()
        .zip(new_tokens.iter())
        .filter(|(a, b)| is_typo_pair(a, b))
        .map(|(a, b)| TypoCandidate {
            wrong: a.to_string(),
            correct: b.to_string(),
            file: file.to_string(),
            line,
        })
        .collect()
}

fn identifiers(line: &str) -> Vec<&str> {
    let bytes = line.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'_' || b.is_ascii_alphabetic() {
            let start = i;
            while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                i += 1;
            }
            tokens.push(&line[start..i]);
        } else if b.is_ascii_digit() {
            // Numeric literals swallow any trailing alphanumerics.
            while i < bytes.len() && (bytes[i] == b'_' || bytes[i].is_ascii_alphanumeric()) {
                i += 1;
            }
        } else {
            i += 1;
        }
    }
    tokens
}

fn is_typo_pair(a: &str, b: &str) -> bool {
    if a == b || a.len() < MIN_IDENT_LEN || b.len() < MIN_IDENT_LEN {
        return false;
    }
    if a.eq_ignore_ascii_case(b) {
        return false;
    }
    let distance = damerau_levenshtein(a, b);
    (1..=MAX_DISTANCE).contains(&distance)
}

/// Restricted Damerau-Levenshtein (optimal string alignment).
fn damerau_levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (n, m) = (a.len(), b.len());
    if n == 0 || m == 0 {
        return n.max(m);
    }

    let mut prev_prev = vec![0usize; m + 1];
    let mut prev: Vec<usize> = (0..=m).collect();
    let mut curr = vec![0usize; m + 1];

    for i in 1..=n {
        curr[0] = i;
        for j in 1..=m {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
            if i > 1 && j > 1 && a[i - 1] == b[j - 2] && a[i - 2] == b[j - 1] {
                curr[j] = curr[j].min(prev_prev[j - 2] + 1);
            }
        }
        std::mem::swap(&mut prev_prev, &mut prev);
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[m]
}

pub type TyposTickState = Vec<TypoCandidate>;

pub struct TyposSemantics;

impl TickSemantics for TyposSemantics {
    type State = TyposTickState;

    fn extract(&self, tc: &Tc, state: &mut Self::State) -> Result<()> {
        if let TcData::Typos(data) = &tc.data {
            state.extend(data.candidates.iter().cloned());
        }
        Ok(())
    }

    fn merge(&self, mut existing: Self::State, incoming: Self::State) -> Self::State {
        existing.extend(incoming);
        existing
    }

    fn size(&self, state: &Self::State) -> usize {
        state.len() * CANDIDATE_BYTES
    }

    fn build(&self, tick: Tick, state: &Self::State) -> TickRecord {
        TickRecord { tick, data: serde_json::json!({ "typos": state }) }
    }
}

pub fn make_aggregator(config: &Config) -> GenericAggregator<TyposSemantics> {
    GenericAggregator::new(TyposSemantics, &config.tmp_dir, config.spill_budget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregator;
    use crate::core::CommitHash;
    use crate::plumbing::line_runs;
    use crate::plumbing::FileDiff;
    use std::collections::HashMap;

    #[test]
    fn distance_basics() {
        assert_eq!(damerau_levenshtein("recieve", "receive"), 1, "transposition");
        assert_eq!(damerau_levenshtein("lenght", "length"), 1);
        assert_eq!(damerau_levenshtein("abc", "abc"), 0);
        assert_eq!(damerau_levenshtein("abc", "xyz"), 3);
        assert_eq!(damerau_levenshtein("", "abc"), 3);
    }

    #[test]
    fn typo_pair_filters() {
        assert!(is_typo_pair("recieve", "receive"));
        assert!(!is_typo_pair("Receive", "receive"), "case-only changes are renames");
        assert!(!is_typo_pair("ab", "ba"), "too short");
        assert!(!is_typo_pair("parse", "print"), "too far apart");
    }

    #[test]
    fn identifiers_tokenize_snake_and_camel() {
        assert_eq!(
            identifiers("let recieved_count = fooBar(3);"),
            vec!["let", "recieved_count", "fooBar"]
        );
        assert_eq!(identifiers("  123abc"), Vec::<&str>::new());
    }

    fn ctx_for(old_src: &str, new_src: &str) -> Context {
        let runs = line_runs(old_src, new_src);
        let mut blob_cache = HashMap::new();
        blob_cache.insert("lib.rs".to_string(), new_src.to_string());
        Context {
            time: 0,
            index: 0,
            hash: CommitHash::from_bytes([4; 20]),
            is_merge: false,
            author_id: 0,
            author: "a <a@x>".into(),
            tick: 0,
            tree_changes: Vec::new(),
            blob_cache,
            file_diffs: vec![FileDiff {
                file: "lib.rs".into(),
                old_name: Some("lib.rs".into()),
                old_text: Some(old_src.to_string()),
                runs,
            }],
            uast_changes: Vec::new(),
        }
    }

    #[test]
    fn fixed_identifier_becomes_candidate() {
        let old_src = "fn main() {\n    let recieved = 1;\n}\n";
        let new_src = "fn main() {\n    let received = 1;\n}\n";
        let tc = TyposAnalyzer::new().consume(&ctx_for(old_src, new_src)).unwrap();
        match tc.data {
            TcData::Typos(data) => {
                assert_eq!(data.candidates.len(), 1);
                let candidate = &data.candidates[0];
                assert_eq!(candidate.wrong, "recieved");
                assert_eq!(candidate.correct, "received");
                assert_eq!(candidate.line, 2);
            }
            _ => panic!("expected typos payload"),
        }
    }

    #[test]
    fn unrelated_rewrite_is_not_a_typo() {
        let old_src = "fn main() {\n    let alpha = 1;\n}\n";
        let new_src = "fn main() {\n    let omega = 1;\n}\n";
        let tc = TyposAnalyzer::new().consume(&ctx_for(old_src, new_src)).unwrap();
        assert!(tc.data.is_none());
    }

    #[test]
    fn merge_commits_are_skipped() {
        let old_src = "let recieved = 1;\n";
        let new_src = "let received = 1;\n";
        let mut ctx = ctx_for(old_src, new_src);
        ctx.is_merge = true;
        let tc = TyposAnalyzer::new().consume(&ctx).unwrap();
        assert!(tc.data.is_none());
    }

    #[test]
    fn aggregator_groups_by_tick() {
        let mut agg = make_aggregator(&Config::default());
        let candidate = TypoCandidate {
            wrong: "recieve".into(),
            correct: "receive".into(),
            file: "a.rs".into(),
            line: 1,
        };
        agg.add(Tc {
            tick: 2,
            author_id: 0,
            commit_hash: CommitHash::from_bytes([1; 20]),
            data: TcData::Typos(TyposCommitData { candidates: vec![candidate.clone()] }),
        })
        .unwrap();
        let records = agg.flush_all_ticks().unwrap().unwrap();
        assert_eq!(records[0].tick, 2);
        let typos: Vec<TypoCandidate> =
            serde_json::from_value(records[0].data["typos"].clone()).unwrap();
        assert_eq!(typos, vec![candidate]);
        agg.close().unwrap();
    }
}
