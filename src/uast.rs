use anyhow::bail;
use anyhow::Result;
use tree_sitter::Node;
use tree_sitter::Parser;

use crate::languages::Lang;

/// Roles a UAST node can carry, independent of the source grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(strum::Display, strum::EnumString)]
pub enum Role {
    Function,
    Import,
}

/// One node of the language-agnostic structural tree the analyzers consume.
/// Lines are 1-based and inclusive.
#[derive(Debug, Clone)]
pub struct UastNode {
    pub kind: String,
    pub name: String,
    pub roles: Vec<Role>,
    pub start_line: u32,
    pub end_line: u32,
    pub children: Vec<UastNode>,
}

impl UastNode {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Pre-order walk over the subtree, including self.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a UastNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }
}

/// One file's structural change within a commit. A missing `after` is a
/// deletion, a missing `before` an insertion.
#[derive(Debug, Clone)]
pub struct UastChange {
    pub file_before: Option<String>,
    pub file_after: Option<String>,
    pub before: Option<UastNode>,
    pub after: Option<UastNode>,
}

/// Node-selection query. The default selects Function-role nodes; a kind
/// query pins one grammar's node kind instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeQuery {
    Role(Role),
    Kind(String),
}

impl NodeQuery {
    pub fn parse(text: &str) -> Result<Self> {
        if let Some(role) = text.strip_prefix("//*[@role='").and_then(|t| t.strip_suffix("']")) {
            return Ok(NodeQuery::Role(role.parse().map_err(|_| {
                anyhow::anyhow!("unknown role in node query: {:?}", role)
            })?));
        }
        if let Some(kind) = text.strip_prefix("//") {
            if !kind.is_empty() && !kind.contains(['[', '*']) {
                return Ok(NodeQuery::Kind(kind.to_string()));
            }
        }
        bail!("unsupported node query: {:?}", text)
    }

    pub fn matches(&self, node: &UastNode) -> bool {
        match self {
            NodeQuery::Role(role) => node.has_role(*role),
            NodeQuery::Kind(kind) => node.kind == *kind,
        }
    }

    /// All matching nodes of the subtree, pre-order.
    pub fn select<'a>(&self, root: &'a UastNode) -> Vec<&'a UastNode> {
        let mut matches = Vec::new();
        root.walk(&mut |node| {
            if self.matches(node) {
                matches.push(node);
            }
        });
        matches
    }
}

/// Name-extraction query applied to selected nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameQuery {
    Name,
    Kind,
}

impl NameQuery {
    pub fn parse(text: &str) -> Result<Self> {
        match text {
            "@name" => Ok(NameQuery::Name),
            "@kind" => Ok(NameQuery::Kind),
            _ => bail!("unsupported name query: {:?}", text),
        }
    }

    pub fn apply<'a>(&self, node: &'a UastNode) -> &'a str {
        match self {
            NameQuery::Name => &node.name,
            NameQuery::Kind => &node.kind,
        }
    }
}

/// Parse one file into a [UastNode] tree. Returns None for unsupported
/// languages or unparseable content; the caller skips the file.
pub fn extract_tree(filename: &str, content: &str) -> Option<UastNode> {
    let lang = Lang::of(filename)?;
    let mut parser = Parser::new();
    if parser.set_language(&lang.language()).is_err() {
        log::debug!("grammar rejected for {}", filename);
        return None;
    }
    let tree = match parser.parse(content, None) {
        Some(tree) => tree,
        None => {
            log::debug!("parse failed for {}", filename);
            return None;
        }
    };
    Some(convert(lang, tree.root_node(), content.as_bytes()))
}

/// Import paths of every Import-role node in the tree.
pub fn collect_imports(root: &UastNode) -> Vec<String> {
    let mut imports = Vec::new();
    root.walk(&mut |node| {
        if node.has_role(Role::Import) && !node.name.is_empty() {
            imports.push(node.name.clone());
        }
    });
    imports
}

fn convert(lang: Lang, node: Node<'_>, src: &[u8]) -> UastNode {
    let kind = node.kind().to_string();
    let mut roles = Vec::new();
    let mut name = String::new();

    if lang.function_kinds().contains(&node.kind()) {
        roles.push(Role::Function);
        name = node_name(node, src).unwrap_or_default();
    } else if lang.import_kinds().contains(&node.kind()) {
        roles.push(Role::Import);
        name = import_path(lang, node, src).unwrap_or_default();
    }

    let mut children = Vec::new();
    for i in 0..node.named_child_count() {
        if let Some(child) = node.named_child(i) {
            children.push(convert(lang, child, src));
        }
    }

    UastNode {
        kind,
        name,
        roles,
        start_line: node.start_position().row as u32 + 1,
        end_line: node.end_position().row as u32 + 1,
        children,
    }
}

fn node_name(node: Node<'_>, src: &[u8]) -> Option<String> {
    let name = node.child_by_field_name("name").or_else(|| {
        (0..node.named_child_count())
            .filter_map(|i| node.named_child(i))
            .find(|c| c.kind() == "identifier")
    })?;
    name.utf8_text(src).ok().map(|t| t.to_string())
}

fn import_path(lang: Lang, node: Node<'_>, src: &[u8]) -> Option<String> {
    let text = |n: Node<'_>| n.utf8_text(src).ok().map(|t| t.to_string());
    match lang {
        Lang::Go => first_child_of_kind(node, "interpreted_string_literal")
            .and_then(text)
            .map(|t| t.trim_matches('"').to_string()),
        Lang::Java => first_child_of_kind(node, "scoped_identifier")
            .or_else(|| first_child_of_kind(node, "identifier"))
            .and_then(text),
        Lang::Python => node
            .child_by_field_name("module_name")
            .or_else(|| first_child_of_kind(node, "dotted_name"))
            .or_else(|| first_child_of_kind(node, "aliased_import"))
            .and_then(text),
        Lang::Rust => node.child_by_field_name("argument").and_then(text),
        Lang::TypeScript => node
            .child_by_field_name("source")
            .and_then(text)
            .map(|t| t.trim_matches(['"', '\'']).to_string()),
    }
}

fn first_child_of_kind<'t>(node: Node<'t>, kind: &str) -> Option<Node<'t>> {
    (0..node.named_child_count())
        .filter_map(|i| node.named_child(i))
        .find(|c| c.kind() == kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PY: &str = "\
import os
from sys import path

def alpha():
    return 1

def beta():
    x = 1
    return x
";

    #[test]
    fn python_functions_are_extracted() {
        let tree = extract_tree("m.py", PY).unwrap();
        let funcs = NodeQuery::Role(Role::Function).select(&tree);
        let names: Vec<_> = funcs.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(funcs[0].start_line, 4);
        assert!(funcs[1].end_line >= 8);
    }

    #[test]
    fn python_imports_are_collected() {
        let tree = extract_tree("m.py", PY).unwrap();
        let imports = collect_imports(&tree);
        assert_eq!(imports, vec!["os", "sys"]);
    }

    #[test]
    fn go_functions_and_imports() {
        let src = "package main\n\nimport \"fmt\"\n\nfunc Greet() {\n\tfmt.Println(\"hi\")\n}\n";
        let tree = extract_tree("main.go", src).unwrap();
        let funcs = NodeQuery::Role(Role::Function).select(&tree);
        assert_eq!(funcs.len(), 1);
        assert_eq!(funcs[0].name, "Greet");
        assert_eq!(collect_imports(&tree), vec!["fmt"]);
    }

    #[test]
    fn unsupported_language_is_skipped() {
        assert!(extract_tree("notes.txt", "hello").is_none());
    }

    #[test]
    fn node_query_parsing() {
        assert_eq!(
            NodeQuery::parse("//*[@role='Function']").unwrap(),
            NodeQuery::Role(Role::Function)
        );
        assert_eq!(
            NodeQuery::parse("//function_definition").unwrap(),
            NodeQuery::Kind("function_definition".into())
        );
        assert!(NodeQuery::parse("//*").is_err());
        assert!(NodeQuery::parse("//*[@role='Banana']").is_err());
    }

    #[test]
    fn kind_query_selects_by_grammar_kind() {
        let tree = extract_tree("m.py", PY).unwrap();
        let query = NodeQuery::parse("//function_definition").unwrap();
        assert_eq!(query.select(&tree).len(), 2);
    }

    #[test]
    fn name_query_dispatch() {
        assert_eq!(NameQuery::parse("@name").unwrap(), NameQuery::Name);
        assert_eq!(NameQuery::parse("@kind").unwrap(), NameQuery::Kind);
        assert!(NameQuery::parse(".props.name").is_err());
    }
}
