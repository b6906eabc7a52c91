//! Function and method extraction on top of tree-sitter grammars.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use tree_sitter::{Node, Parser};

const UNKNOWN_NAME: &str = "<unknown>";
const EMPTY_PARAMETERS: &str = "()";

/// Source language of the repository being indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLanguage {
    Python,
    Java,
}

impl SourceLanguage {
    /// File extension, including the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            SourceLanguage::Python => ".py",
            SourceLanguage::Java => ".java",
        }
    }

    pub fn collection_name(&self) -> &'static str {
        match self {
            SourceLanguage::Python => "python-files",
            SourceLanguage::Java => "java-files",
        }
    }

    pub fn is_source_path(&self, path: &str) -> bool {
        path.ends_with(self.extension())
    }

    fn entity_kinds(&self) -> &'static [&'static str] {
        match self {
            SourceLanguage::Python => &["function_definition"],
            SourceLanguage::Java => &["method_declaration", "constructor_declaration"],
        }
    }

    fn grammar(&self) -> tree_sitter::Language {
        match self {
            SourceLanguage::Python => tree_sitter_python::LANGUAGE.into(),
            SourceLanguage::Java => tree_sitter_java::LANGUAGE.into(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceLanguage::Python => "python",
            SourceLanguage::Java => "java",
        }
    }
}

impl fmt::Display for SourceLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceLanguage {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(SourceLanguage::Python),
            "java" => Ok(SourceLanguage::Java),
            other => Err(ParseError::UnsupportedLanguage(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),
    #[error("failed to load the {language} grammar: {message}")]
    Grammar {
        language: SourceLanguage,
        message: String,
    },
}

/// Extracts `signature -> body` pairs for every function or method in a file.
///
/// The signature is the entity name followed by the raw parameter list text as
/// written in source. When two entities share a signature the later body wins
/// but the entry keeps its original position.
pub struct EntityParser {
    language: SourceLanguage,
    parser: Parser,
}

impl EntityParser {
    pub fn new(language: SourceLanguage) -> Result<Self, ParseError> {
        let mut parser = Parser::new();
        parser
            .set_language(&language.grammar())
            .map_err(|error| ParseError::Grammar {
                language,
                message: error.to_string(),
            })?;
        Ok(Self { language, parser })
    }

    pub fn language(&self) -> SourceLanguage {
        self.language
    }

    pub fn extract(&mut self, content: &str) -> IndexMap<String, String> {
        let mut entities = IndexMap::new();
        if content.is_empty() {
            return entities;
        }

        let Some(tree) = self.parser.parse(content, None) else {
            warn!(language = %self.language, "tree-sitter returned no tree");
            return entities;
        };

        collect_entities(
            tree.root_node(),
            content.as_bytes(),
            self.language.entity_kinds(),
            &mut entities,
        );
        entities
    }
}

fn collect_entities(
    node: Node<'_>,
    source: &[u8],
    kinds: &[&str],
    entities: &mut IndexMap<String, String>,
) {
    if kinds.contains(&node.kind()) {
        let name = field_text(node, "name", source).unwrap_or(UNKNOWN_NAME);
        let parameters = field_text(node, "parameters", source).unwrap_or(EMPTY_PARAMETERS);
        let body = node.utf8_text(source).unwrap_or_default();
        entities.insert(format!("{name}{parameters}"), body.to_string());
    }

    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        collect_entities(child, source, kinds, entities);
    }
}

fn field_text<'a>(node: Node<'_>, field: &str, source: &'a [u8]) -> Option<&'a str> {
    node.child_by_field_name(field)
        .and_then(|child| child.utf8_text(source).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_functions_and_methods_are_extracted() {
        let source = "\
import os

def top_level(a, b=2):
    return a + b

class Widget:
    def __init__(self, name):
        self.name = name

    def render(self,  width ,height):
        def inner():
            return width
        return inner()
";
        let mut parser = EntityParser::new(SourceLanguage::Python).unwrap();
        let entities = parser.extract(source);

        let signatures: Vec<&str> = entities.keys().map(String::as_str).collect();
        assert_eq!(
            signatures,
            vec![
                "top_level(a, b=2)",
                "__init__(self, name)",
                "render(self,  width ,height)",
                "inner()",
            ]
        );
        assert!(entities["top_level(a, b=2)"].starts_with("def top_level"));
        assert!(entities["render(self,  width ,height)"].contains("return inner()"));
    }

    #[test]
    fn duplicate_python_signatures_keep_the_later_body() {
        let source = "def f(x):\n    return 1\n\ndef f(x):\n    return 2\n";
        let mut parser = EntityParser::new(SourceLanguage::Python).unwrap();
        let entities = parser.extract(source);

        assert_eq!(entities.len(), 1);
        assert!(entities["f(x)"].contains("return 2"));
    }

    #[test]
    fn java_methods_and_constructors_are_extracted() {
        let source = "\
package org.example;

public class Account {
    private int balance;

    public Account(int initial) {
        this.balance = initial;
    }

    public void deposit(int amount, String memo) {
        balance += amount;
    }
}
";
        let mut parser = EntityParser::new(SourceLanguage::Java).unwrap();
        let entities = parser.extract(source);

        assert_eq!(entities.len(), 2);
        assert!(entities.contains_key("Account(int initial)"));
        assert!(entities.contains_key("deposit(int amount, String memo)"));
    }

    #[test]
    fn empty_or_entity_free_content_yields_nothing() {
        let mut parser = EntityParser::new(SourceLanguage::Python).unwrap();
        assert!(parser.extract("").is_empty());
        assert!(parser.extract("X = 1\nY = [X]\n").is_empty());
    }

    #[test]
    fn language_parsing_accepts_common_spellings() {
        assert_eq!("Python".parse::<SourceLanguage>().unwrap(), SourceLanguage::Python);
        assert_eq!("java".parse::<SourceLanguage>().unwrap(), SourceLanguage::Java);
        assert!("cobol".parse::<SourceLanguage>().is_err());
    }
}
