use std::collections::BTreeMap;

use anyhow::Result;

use crate::aggregate::GenericAggregator;
use crate::aggregate::TickSemantics;
use crate::core::AuthorId;
use crate::core::Config;
use crate::core::Tc;
use crate::core::TcData;
use crate::core::Tick;
use crate::core::TickRecord;
use crate::languages::Lang;
use crate::plumbing::Context;
use crate::uast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
    pub lang: String,
    pub path: String,
}

/// Per-commit payload: every import visible in the changed files' "after"
/// trees.
#[derive(Debug, Clone, Default)]
pub struct ImportsCommitData {
    pub entries: Vec<ImportEntry>,
}

/// Extracts language-tagged import lists from UAST changes.
#[derive(Debug, Default)]
pub struct ImportsAnalyzer;

impl ImportsAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn consume(&mut self, ctx: &Context) -> Result<Tc> {
        let mut entries = Vec::new();
        for change in &ctx.uast_changes {
            let Some(after) = &change.after else {
                continue;
            };
            let Some(file) = change.file_after.as_deref() else {
                continue;
            };
            let Some(lang) = Lang::of(file) else {
                continue;
            };
            for path in uast::collect_imports(after) {
                entries.push(ImportEntry { lang: lang.to_string(), path });
            }
        }

        if entries.is_empty() {
            return Ok(Tc::empty(ctx.tick, ctx.author_id, ctx.hash));
        }
        Ok(Tc {
            tick: ctx.tick,
            author_id: ctx.author_id,
            commit_hash: ctx.hash,
            data: TcData::Imports(ImportsCommitData { entries }),
        })
    }
}

/// Per-tick state: `author -> language -> import -> count`. The final
/// report pivots ticks to the innermost level.
pub type ImportsTickState = BTreeMap<AuthorId, BTreeMap<String, BTreeMap<String, u64>>>;

pub struct ImportsSemantics;

impl TickSemantics for ImportsSemantics {
    type State = ImportsTickState;

    fn extract(&self, tc: &Tc, state: &mut Self::State) -> Result<()> {
        let TcData::Imports(data) = &tc.data else {
            return Ok(());
        };
        let by_lang = state.entry(tc.author_id).or_default();
        for entry in &data.entries {
            *by_lang
                .entry(entry.lang.clone())
                .or_default()
                .entry(entry.path.clone())
                .or_default() += 1;
        }
        Ok(())
    }

    fn merge(&self, mut existing: Self::State, incoming: Self::State) -> Self::State {
        for (author, langs) in incoming {
            let by_lang = existing.entry(author).or_default();
            for (lang, imports) in langs {
                let by_import = by_lang.entry(lang).or_default();
                for (import, count) in imports {
                    *by_import.entry(import).or_default() += count;
                }
            }
        }
        existing
    }

    fn size(&self, state: &Self::State) -> usize {
        let entries: usize =
            state.values().flat_map(|langs| langs.values()).map(|imports| imports.len()).sum();
        entries * 100
    }

    fn build(&self, tick: Tick, state: &Self::State) -> TickRecord {
        TickRecord { tick, data: serde_json::to_value(state).unwrap_or_default() }
    }
}

pub fn make_aggregator(config: &Config) -> GenericAggregator<ImportsSemantics> {
    GenericAggregator::new(ImportsSemantics, &config.tmp_dir, config.spill_budget)
}

/// Pivot per-tick records into the 4-level report map
/// `author -> language -> import -> tick -> count`.
pub fn pivot_ticks(
    records: &[TickRecord],
) -> BTreeMap<AuthorId, BTreeMap<String, BTreeMap<String, BTreeMap<Tick, u64>>>> {
    let mut result: BTreeMap<AuthorId, BTreeMap<String, BTreeMap<String, BTreeMap<Tick, u64>>>> =
        BTreeMap::new();
    for record in records {
        let Ok(state) = serde_json::from_value::<ImportsTickState>(record.data.clone()) else {
            continue;
        };
        for (author, langs) in state {
            for (lang, imports) in langs {
                for (import, count) in imports {
                    *result
                        .entry(author)
                        .or_default()
                        .entry(lang.clone())
                        .or_default()
                        .entry(import)
                        .or_default()
                        .entry(record.tick)
                        .or_default() += count;
                }
            }
        }
    }
    result
}
