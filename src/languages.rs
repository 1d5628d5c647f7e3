use std::collections::HashMap;

use lazy_static::lazy_static;
use tree_sitter::Language;

/// Each programming language codefang can extract structure from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(strum::Display, strum::EnumString, strum::VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum Lang {
    Go,
    Java,
    Python,
    Rust,
    TypeScript,
}

impl Lang {
    /// Get the language for a filename, by extension.
    pub fn of<S: AsRef<str>>(filename: S) -> Option<Self> {
        LANG_TABLE.get_lang(filename)
    }

    pub fn language(&self) -> Language {
        match self {
            Lang::Go => tree_sitter_go::language(),
            Lang::Java => tree_sitter_java::language(),
            Lang::Python => tree_sitter_python::language(),
            Lang::Rust => tree_sitter_rust::language(),
            Lang::TypeScript => tree_sitter_typescript::language_typescript(),
        }
    }

    /// Node kinds that carry a Function role in this grammar.
    pub fn function_kinds(&self) -> &'static [&'static str] {
        match self {
            Lang::Go => &["function_declaration", "method_declaration"],
            Lang::Java => &["method_declaration", "constructor_declaration"],
            Lang::Python => &["function_definition"],
            Lang::Rust => &["function_item"],
            Lang::TypeScript => &["function_declaration", "method_definition"],
        }
    }

    /// Node kinds that carry an Import role in this grammar.
    pub fn import_kinds(&self) -> &'static [&'static str] {
        match self {
            Lang::Go => &["import_spec"],
            Lang::Java => &["import_declaration"],
            Lang::Python => &["import_statement", "import_from_statement"],
            Lang::Rust => &["use_declaration"],
            Lang::TypeScript => &["import_statement"],
        }
    }
}

#[derive(Debug, Default)]
struct LangLookupTable {
    extensions: HashMap<String, Lang>,
}

impl LangLookupTable {
    fn get_lang<S: AsRef<str>>(&self, filename: S) -> Option<Lang> {
        filename
            .as_ref()
            .to_lowercase()
            .rsplit('.')
            .next()
            .and_then(|ext| self.extensions.get(ext))
            .copied()
    }

    fn insert_extension(&mut self, lang: Lang, ext: &str) {
        self.extensions.insert(ext.to_lowercase(), lang);
    }
}

lazy_static! {
    static ref LANG_TABLE: LangLookupTable = {
        let mut table = LangLookupTable::default();
        table.insert_extension(Lang::Go, "go");
        table.insert_extension(Lang::Java, "java");
        table.insert_extension(Lang::Python, "py");
        table.insert_extension(Lang::Rust, "rs");
        table.insert_extension(Lang::TypeScript, "ts");
        table.insert_extension(Lang::TypeScript, "tsx");
        table
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_lookup() {
        assert_eq!(Lang::of("pkg/main.go"), Some(Lang::Go));
        assert_eq!(Lang::of("Deep/Path/File.JAVA"), Some(Lang::Java));
        assert_eq!(Lang::of("noext"), None);
        assert_eq!(Lang::of("vendor.min.js"), None);
    }

    #[test]
    fn display_round_trips_through_from_str() {
        use std::str::FromStr;
        assert_eq!(Lang::from_str("python").unwrap(), Lang::Python);
        assert_eq!(Lang::Python.to_string(), "python");
    }
}
