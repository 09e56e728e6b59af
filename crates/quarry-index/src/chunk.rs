use serde::{Deserialize, Serialize};

use crate::languages::{Lang, PLAIN_TEXT};

/// Semantic category of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Function,
    Method,
    Class,
    Interface,
    Type,
    Module,
    Import,
    Comment,
    /// Run of sibling nodes with no single entity.
    Block,
    /// Fixed-size window from the text fallback.
    TextWindow,
    /// Whole file with no finer structure.
    File,
}

impl ChunkKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Type => "type",
            Self::Module => "module",
            Self::Import => "import",
            Self::Comment => "comment",
            Self::Block => "block",
            Self::TextWindow => "text_window",
            Self::File => "file",
        }
    }

    #[must_use]
    pub fn from_str_opt(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_owned())).ok()
    }

    /// Classify a tree-sitter node kind.
    #[must_use]
    pub fn for_node_kind(node_kind: &str) -> Self {
        match node_kind {
            "function_item"
            | "function_definition"
            | "function_declaration"
            | "generator_function_declaration"
            | "arrow_function"
            | "macro_definition" => Self::Function,
            "method_definition" | "method_declaration" => Self::Method,
            "class_definition"
            | "class_declaration"
            | "abstract_class_declaration"
            | "struct_item"
            | "enum_item"
            | "impl_item" => Self::Class,
            "trait_item" | "interface_declaration" => Self::Interface,
            "type_item" | "type_declaration" | "type_alias_declaration" | "enum_declaration" => {
                Self::Type
            }
            "mod_item" | "module" | "namespace_declaration" => Self::Module,
            "use_declaration" | "import_statement" | "import_from_statement"
            | "import_declaration" => Self::Import,
            "comment" | "line_comment" | "block_comment" => Self::Comment,
            _ => Self::Block,
        }
    }

    /// Kinds that open a scope in which functions are methods.
    #[must_use]
    pub fn is_type_scope(self) -> bool {
        matches!(self, Self::Class | Self::Interface)
    }
}

impl std::fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definitions and references supplied by an external language service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub definitions: Vec<String>,
    pub references: Vec<String>,
}

/// One unit of source text prepared for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeChunk {
    /// Workspace-relative path with `/` separators.
    pub file_path: String,
    /// `None` for files without a grammar.
    pub language: Option<Lang>,
    pub kind: ChunkKind,
    /// Raw tree-sitter node kind, or `text_window` / `file`.
    pub node_type: String,
    pub name: Option<String>,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub content: String,
    /// Embedding text: content with file/scope/language/import context.
    pub processed_content: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    pub start_byte: usize,
    pub end_byte: usize,
    pub scope_chain: String,
    pub imports: String,
    pub content_hash: String,
    pub symbols: Option<SymbolInfo>,
}

impl CodeChunk {
    #[must_use]
    pub fn language_id(&self) -> &'static str {
        self.language.map_or(PLAIN_TEXT, Lang::id)
    }
}

pub(crate) fn non_ws_len(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

pub(crate) fn blake3_hex(input: &[u8]) -> String {
    blake3::hash(input).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kinds_classify() {
        assert_eq!(ChunkKind::for_node_kind("function_item"), ChunkKind::Function);
        assert_eq!(ChunkKind::for_node_kind("impl_item"), ChunkKind::Class);
        assert_eq!(
            ChunkKind::for_node_kind("interface_declaration"),
            ChunkKind::Interface
        );
        assert_eq!(ChunkKind::for_node_kind("line_comment"), ChunkKind::Comment);
        assert_eq!(ChunkKind::for_node_kind("expression_statement"), ChunkKind::Block);
    }

    #[test]
    fn kind_string_roundtrip() {
        for kind in [
            ChunkKind::Function,
            ChunkKind::Method,
            ChunkKind::TextWindow,
            ChunkKind::File,
        ] {
            assert_eq!(ChunkKind::from_str_opt(kind.as_str()), Some(kind));
        }
        assert_eq!(ChunkKind::from_str_opt("nope"), None);
    }

    #[test]
    fn non_ws_len_counts_correctly() {
        assert_eq!(non_ws_len("fn  foo () { }"), 9);
        assert_eq!(non_ws_len(""), 0);
        assert_eq!(non_ws_len("   \n\t"), 0);
    }

    #[test]
    fn blake3_hex_is_stable() {
        let h1 = blake3_hex(b"test input");
        assert_eq!(h1, blake3_hex(b"test input"));
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, blake3_hex(b"test input!"));
    }
}
