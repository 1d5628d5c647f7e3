use anyhow::Result;

use crate::analyzer::CouplesHistory;
use crate::analyzer::HistoryAnalyzer;
use crate::analyzer::ImportsHistory;
use crate::analyzer::ShotnessHistory;
use crate::analyzer::TyposHistory;
use crate::core::Config;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown analyzer id: {0}")]
    UnknownAnalyzerId(String),
    #[error("duplicate analyzer id: {0}")]
    DuplicateAnalyzerId(String),
    #[error("invalid analyzer mode: {0}")]
    InvalidAnalyzerMode(String),
    #[error("invalid analyzer glob {pattern:?}: {source}")]
    InvalidAnalyzerGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum AnalyzerMode {
    Static,
    History,
}

impl AnalyzerMode {
    pub fn parse(text: &str) -> Result<Self, RegistryError> {
        text.parse().map_err(|_| RegistryError::InvalidAnalyzerMode(text.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerInfo {
    pub id: &'static str,
    pub flag: &'static str,
    pub mode: AnalyzerMode,
    pub description: &'static str,
}

/// Flat analyzer registry: metadata lookup, selector expansion, and
/// factory dispatch.
pub struct Registry {
    infos: Vec<AnalyzerInfo>,
}

impl Registry {
    pub fn builtin() -> Self {
        let mut registry = Registry { infos: Vec::new() };
        for info in [
            AnalyzerInfo {
                id: "couples",
                flag: "couples",
                mode: AnalyzerMode::History,
                description: "file and developer co-change coupling",
            },
            AnalyzerInfo {
                id: "shotness",
                flag: "shotness",
                mode: AnalyzerMode::History,
                description: "structural node hotness and coupling",
            },
            AnalyzerInfo {
                id: "imports",
                flag: "imports",
                mode: AnalyzerMode::History,
                description: "per-author import usage over time",
            },
            AnalyzerInfo {
                id: "typos",
                flag: "typos",
                mode: AnalyzerMode::History,
                description: "identifier typo fix candidates",
            },
        ] {
            registry.register(info).expect("builtin ids are unique");
        }
        registry
    }

    pub fn register(&mut self, info: AnalyzerInfo) -> Result<(), RegistryError> {
        if self.infos.iter().any(|existing| existing.id == info.id) {
            return Err(RegistryError::DuplicateAnalyzerId(info.id.to_string()));
        }
        self.infos.push(info);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&AnalyzerInfo, RegistryError> {
        self.infos
            .iter()
            .find(|info| info.id == id)
            .ok_or_else(|| RegistryError::UnknownAnalyzerId(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.infos.iter().map(|info| info.id).collect()
    }

    /// Expand selectors into analyzer ids, in registration order. Each
    /// selector is an exact id or a glob; a selector matching nothing is
    /// an error.
    pub fn expand(&self, selectors: &[String]) -> Result<Vec<&'static str>, RegistryError> {
        let mut selected = Vec::new();
        for selector in selectors {
            let pattern = glob::Pattern::new(selector).map_err(|source| {
                RegistryError::InvalidAnalyzerGlob { pattern: selector.clone(), source }
            })?;
            let mut matched = false;
            for info in &self.infos {
                if pattern.matches(info.id) {
                    matched = true;
                    if !selected.contains(&info.id) {
                        selected.push(info.id);
                    }
                }
            }
            if !matched {
                return Err(RegistryError::UnknownAnalyzerId(selector.clone()));
            }
        }
        Ok(selected)
    }

    pub fn make(&self, id: &str, config: &Config) -> Result<Box<dyn HistoryAnalyzer>> {
        self.get(id)?;
        Ok(match id {
            "couples" => Box::new(CouplesHistory::new()),
            "shotness" => Box::new(ShotnessHistory::new(config)?),
            "imports" => Box::new(ImportsHistory::new()),
            "typos" => Box::new(TyposHistory::new()),
            _ => return Err(RegistryError::UnknownAnalyzerId(id.to_string()).into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_ids_resolve() {
        let registry = Registry::builtin();
        assert_eq!(registry.ids(), ["couples", "shotness", "imports", "typos"]);
        assert!(registry.get("couples").is_ok());
        assert!(matches!(
            registry.get("nope"),
            Err(RegistryError::UnknownAnalyzerId(_))
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = Registry::builtin();
        let err = registry
            .register(AnalyzerInfo {
                id: "couples",
                flag: "couples2",
                mode: AnalyzerMode::History,
                description: "dup",
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateAnalyzerId(_)));
    }

    #[test]
    fn glob_expansion() {
        let registry = Registry::builtin();
        let all = registry.expand(&["*".to_string()]).unwrap();
        assert_eq!(all, ["couples", "shotness", "imports", "typos"]);

        let some = registry.expand(&["c*".to_string(), "imports".to_string()]).unwrap();
        assert_eq!(some, ["couples", "imports"]);

        // Overlapping selectors dedup in registration order.
        let overlap = registry.expand(&["imports".to_string(), "*".to_string()]).unwrap();
        assert_eq!(overlap, ["imports", "couples", "shotness", "typos"]);
    }

    #[test]
    fn unmatched_selector_fails() {
        let registry = Registry::builtin();
        assert!(matches!(
            registry.expand(&["z*".to_string()]),
            Err(RegistryError::UnknownAnalyzerId(_))
        ));
    }

    #[test]
    fn bad_glob_is_reported_as_such() {
        let registry = Registry::builtin();
        assert!(matches!(
            registry.expand(&["[".to_string()]),
            Err(RegistryError::InvalidAnalyzerGlob { .. })
        ));
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(AnalyzerMode::parse("static").unwrap(), AnalyzerMode::Static);
        assert_eq!(AnalyzerMode::parse("history").unwrap(), AnalyzerMode::History);
        assert!(matches!(
            AnalyzerMode::parse("live"),
            Err(RegistryError::InvalidAnalyzerMode(_))
        ));
    }

    #[test]
    fn factory_builds_each_builtin() {
        let registry = Registry::builtin();
        let config = Config::default();
        for id in registry.ids() {
            let analyzer = registry.make(id, &config).unwrap();
            assert_eq!(analyzer.id(), id);
        }
    }
}
