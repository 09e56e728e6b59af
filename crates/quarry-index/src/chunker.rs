//! AST-based chunking via tree-sitter with greedy sibling merge.
//!
//! Entity nodes (functions, classes, ...) become their own chunk. Runs of
//! other siblings are batched up to `target_size` non-whitespace characters.
//! Nodes above `max_size` are split recursively, carrying a scope chain.
//! Chunks below `min_size` are merged into their successor.

use serde::Deserialize;
use tree_sitter::{Node, Tree};

use crate::chunk::{ChunkKind, CodeChunk, blake3_hex, non_ws_len};
use crate::context::contextualize_for_embedding;
use crate::languages::Lang;

const MAX_SIGNATURE_CHARS: usize = 240;

/// Chunker configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Target chunk size in non-whitespace characters (default: 600).
    pub target_size: usize,
    /// Maximum chunk size before forced recursive split (default: 1200).
    pub max_size: usize,
    /// Minimum chunk size; smaller pieces merge with the next sibling (default: 100).
    pub min_size: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_size: 600,
            max_size: 1200,
            min_size: 100,
        }
    }
}

/// Shared context passed through the recursive chunking process.
struct ChunkCtx<'a> {
    source: &'a str,
    file_path: &'a str,
    lang: Lang,
    imports: &'a str,
    config: &'a ChunkerConfig,
}

/// Split a parsed file into chunks with embedding text filled in.
#[must_use]
pub fn chunk_tree(
    source: &str,
    tree: &Tree,
    file_path: &str,
    lang: Lang,
    config: &ChunkerConfig,
) -> Vec<CodeChunk> {
    if non_ws_len(source) == 0 {
        return Vec::new();
    }

    let root = tree.root_node();
    let imports = extract_imports(source, &root, lang);
    let ctx = ChunkCtx {
        source,
        file_path,
        lang,
        imports: &imports,
        config,
    };

    let mut chunks = Vec::new();
    if lang.entity_node_kinds().is_empty() && non_ws_len(source) <= config.max_size {
        chunks.push(file_chunk(&ctx));
    } else {
        chunk_children(&ctx, &root, "", None, &mut chunks);
        merge_small_chunks(&mut chunks, source, config);
        if chunks.is_empty() {
            chunks.push(file_chunk(&ctx));
        }
    }

    for chunk in &mut chunks {
        chunk.processed_content = contextualize_for_embedding(chunk);
    }
    chunks
}

fn chunk_children(
    ctx: &ChunkCtx<'_>,
    parent: &Node,
    parent_scope: &str,
    parent_kind: Option<ChunkKind>,
    output: &mut Vec<CodeChunk>,
) {
    let mut cursor = parent.walk();
    let children: Vec<Node> = parent.named_children(&mut cursor).collect();

    let mut batch: Vec<Node> = Vec::new();
    let mut batch_size: usize = 0;

    for child in children {
        let child_nws = non_ws_len(&ctx.source[child.byte_range()]);
        if child_nws == 0 {
            continue;
        }
        let is_entity = ctx.lang.entity_node_kinds().contains(&child.kind());

        if child_nws > ctx.config.max_size && child.named_child_count() > 0 {
            flush_batch(ctx, &batch, parent_scope, output);
            batch.clear();
            batch_size = 0;

            if is_entity {
                let scope = extend_scope(parent_scope, &child, ctx.source);
                let kind = classify(&child, parent_kind);
                chunk_children(ctx, &child, &scope, Some(kind), output);
            } else {
                chunk_children(ctx, &child, parent_scope, parent_kind, output);
            }
            continue;
        }

        if is_entity || child_nws > ctx.config.max_size {
            let leading = if is_entity {
                take_leading_docs(&mut batch, &child)
            } else {
                None
            };
            flush_batch(ctx, &batch, parent_scope, output);
            batch.clear();
            batch_size = 0;
            output.push(entity_chunk(ctx, &child, leading.as_ref(), parent_scope, parent_kind));
            continue;
        }

        if batch_size + child_nws > ctx.config.target_size && !batch.is_empty() {
            flush_batch(ctx, &batch, parent_scope, output);
            batch.clear();
            batch_size = 0;
        }

        batch.push(child);
        batch_size += child_nws;
    }

    flush_batch(ctx, &batch, parent_scope, output);
}

/// Pop comment/attribute nodes directly above `entity` off the end of `batch`.
/// Returns the earliest one so the entity chunk can start there.
fn take_leading_docs<'t>(batch: &mut Vec<Node<'t>>, entity: &Node<'t>) -> Option<Node<'t>> {
    let mut first = None;
    let mut boundary = entity.start_position().row;
    while let Some(last) = batch.last() {
        if !is_doc_node(last) || last.end_position().row + 1 < boundary {
            break;
        }
        boundary = last.start_position().row;
        first = batch.pop();
    }
    first
}

fn is_doc_node(node: &Node) -> bool {
    node.kind().contains("comment") || matches!(node.kind(), "attribute_item" | "decorator")
}

fn entity_chunk(
    ctx: &ChunkCtx<'_>,
    node: &Node,
    leading: Option<&Node>,
    scope: &str,
    parent_kind: Option<ChunkKind>,
) -> CodeChunk {
    let decl = unwrap_declaration(node);
    let kind = classify(node, parent_kind);
    let signature = matches!(
        kind,
        ChunkKind::Function
            | ChunkKind::Method
            | ChunkKind::Class
            | ChunkKind::Interface
            | ChunkKind::Type
    )
    .then(|| extract_signature(&decl, ctx.source))
    .flatten();

    let first = leading.unwrap_or(node);
    let mut chunk = base_chunk(
        ctx,
        first.start_byte(),
        node.end_byte(),
        start_line(first),
        end_line(node),
    );
    chunk.kind = kind;
    chunk.node_type = decl.kind().to_string();
    chunk.name = extract_entity_name(&decl, ctx.source);
    chunk.signature = signature;
    chunk.docstring = extract_docstring(node, &decl, ctx.source, ctx.lang);
    chunk.scope_chain = scope.to_string();
    chunk
}

fn flush_batch(ctx: &ChunkCtx<'_>, batch: &[Node], scope: &str, output: &mut Vec<CodeChunk>) {
    let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
        return;
    };

    let first_kind = ChunkKind::for_node_kind(first.kind());
    let kind = if batch
        .iter()
        .all(|n| ChunkKind::for_node_kind(n.kind()) == first_kind)
    {
        first_kind
    } else {
        ChunkKind::Block
    };

    let mut chunk = base_chunk(
        ctx,
        first.start_byte(),
        last.end_byte(),
        start_line(first),
        end_line(last),
    );
    chunk.kind = kind;
    chunk.node_type = if batch.len() == 1 {
        first.kind().to_string()
    } else {
        format!("{}x{}", first.kind(), batch.len())
    };
    chunk.name = batch
        .iter()
        .find_map(|n| extract_entity_name(n, ctx.source));
    chunk.scope_chain = scope.to_string();
    output.push(chunk);
}

fn file_chunk(ctx: &ChunkCtx<'_>) -> CodeChunk {
    let lines = ctx.source.lines().count().max(1);
    let mut chunk = base_chunk(ctx, 0, ctx.source.len(), 1, lines);
    chunk.kind = ChunkKind::File;
    chunk.node_type = "file".to_string();
    chunk
}

fn base_chunk(
    ctx: &ChunkCtx<'_>,
    start_byte: usize,
    end_byte: usize,
    start_line: usize,
    end_line: usize,
) -> CodeChunk {
    let content = &ctx.source[start_byte..end_byte];
    CodeChunk {
        file_path: ctx.file_path.to_string(),
        language: Some(ctx.lang),
        kind: ChunkKind::Block,
        node_type: String::new(),
        name: None,
        signature: None,
        docstring: None,
        content: content.to_string(),
        processed_content: String::new(),
        start_line,
        end_line,
        start_byte,
        end_byte,
        scope_chain: String::new(),
        imports: ctx.imports.to_string(),
        content_hash: blake3_hex(content.as_bytes()),
        symbols: None,
    }
}

fn start_line(node: &Node) -> usize {
    node.start_position().row + 1
}

/// Nodes ending at column 0 belong to the previous line.
fn end_line(node: &Node) -> usize {
    let start = node.start_position().row;
    let end = node.end_position();
    if end.column == 0 && end.row > start {
        end.row
    } else {
        end.row + 1
    }
}

/// Look through `export` / decorator wrappers to the declared item.
fn unwrap_declaration<'t>(node: &Node<'t>) -> Node<'t> {
    match node.kind() {
        "export_statement" => node.child_by_field_name("declaration").unwrap_or(*node),
        "decorated_definition" => node.child_by_field_name("definition").unwrap_or(*node),
        _ => *node,
    }
}

fn classify(node: &Node, parent_kind: Option<ChunkKind>) -> ChunkKind {
    let decl = unwrap_declaration(node);
    let kind = if decl.kind() == "lexical_declaration" {
        let mut cursor = decl.walk();
        let holds_function = decl.named_children(&mut cursor).any(|d| {
            d.child_by_field_name("value").is_some_and(|v| {
                matches!(v.kind(), "arrow_function" | "function_expression" | "function")
            })
        });
        if holds_function {
            ChunkKind::Function
        } else {
            ChunkKind::Block
        }
    } else {
        ChunkKind::for_node_kind(decl.kind())
    };

    if kind == ChunkKind::Function && parent_kind.is_some_and(ChunkKind::is_type_scope) {
        ChunkKind::Method
    } else {
        kind
    }
}

fn extract_imports(source: &str, root: &Node, lang: Lang) -> String {
    let import_kinds = lang.import_node_kinds();
    if import_kinds.is_empty() {
        return String::new();
    }

    let mut imports = String::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        if import_kinds.contains(&child.kind()) {
            imports.push_str(&source[child.byte_range()]);
            imports.push('\n');
        }
    }
    imports
}

fn extract_entity_name(node: &Node, source: &str) -> Option<String> {
    // tree-sitter-rust: impl_item uses "type" field, most others use "name"
    if let Some(n) = node
        .child_by_field_name("name")
        .or_else(|| node.child_by_field_name("type"))
    {
        return Some(source[n.byte_range()].to_string());
    }
    // `const x = ...` and Go `type X struct` keep the name one level down.
    if matches!(
        node.kind(),
        "lexical_declaration" | "type_declaration" | "const_declaration"
    ) {
        let mut cursor = node.walk();
        return node
            .named_children(&mut cursor)
            .find_map(|c| c.child_by_field_name("name"))
            .map(|n| source[n.byte_range()].to_string());
    }
    None
}

fn extract_signature(decl: &Node, source: &str) -> Option<String> {
    let raw = match decl.child_by_field_name("body") {
        Some(body) if body.start_byte() > decl.start_byte() => {
            &source[decl.start_byte()..body.start_byte()]
        }
        _ => source[decl.byte_range()].lines().next().unwrap_or_default(),
    };
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches(['{', ':', ' ']).trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_SIGNATURE_CHARS).collect())
}

fn extract_docstring(node: &Node, decl: &Node, source: &str, lang: Lang) -> Option<String> {
    if lang == Lang::Python
        && let Some(doc) = python_docstring(decl, source)
    {
        return Some(doc);
    }

    let mut lines: Vec<String> = Vec::new();
    let mut boundary = node.start_position().row;
    let mut prev = node.prev_named_sibling();
    while let Some(p) = prev {
        if p.end_position().row + 1 < boundary {
            break;
        }
        if p.kind().contains("comment") {
            let text = &source[p.byte_range()];
            for line in text.lines().rev() {
                let cleaned = strip_comment_marker(line);
                if !cleaned.is_empty() {
                    lines.push(cleaned.to_string());
                }
            }
        } else if p.kind() != "attribute_item" && p.kind() != "decorator" {
            break;
        }
        boundary = p.start_position().row;
        prev = p.prev_named_sibling();
    }

    if lines.is_empty() {
        return None;
    }
    lines.reverse();
    Some(lines.join("\n"))
}

fn python_docstring(decl: &Node, source: &str) -> Option<String> {
    let body = decl.child_by_field_name("body")?;
    let first = body.named_child(0)?;
    if first.kind() != "expression_statement" {
        return None;
    }
    let literal = first.named_child(0)?;
    if literal.kind() != "string" {
        return None;
    }
    let text = source[literal.byte_range()]
        .trim_start_matches(['r', 'b', 'u', 'R', 'B', 'U'])
        .trim_matches('"')
        .trim_matches('\'')
        .trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn strip_comment_marker(line: &str) -> &str {
    let trimmed = line.trim();
    for marker in ["///", "//!", "//", "/**", "/*", "*/", "#", "*"] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return rest.trim_end_matches("*/").trim();
        }
    }
    trimmed.trim_end_matches("*/").trim()
}

fn extend_scope(parent_scope: &str, node: &Node, source: &str) -> String {
    let decl = unwrap_declaration(node);
    let name = extract_entity_name(&decl, source).unwrap_or_else(|| decl.kind().to_string());
    if parent_scope.is_empty() {
        name
    } else {
        format!("{parent_scope} > {name}")
    }
}

fn merge_small_chunks(chunks: &mut Vec<CodeChunk>, source: &str, config: &ChunkerConfig) {
    if chunks.len() < 2 {
        return;
    }

    let mut i = 0;
    while i + 1 < chunks.len() {
        let cur_nws = non_ws_len(&chunks[i].content);
        let next_nws = non_ws_len(&chunks[i + 1].content);

        if cur_nws < config.min_size && cur_nws + next_nws <= config.target_size {
            let next = chunks.remove(i + 1);
            let cur = &mut chunks[i];
            cur.content = source[cur.start_byte..next.end_byte].to_string();
            cur.end_byte = next.end_byte;
            cur.end_line = next.end_line;
            cur.content_hash = blake3_hex(cur.content.as_bytes());
            if matches!(
                cur.kind,
                ChunkKind::Block | ChunkKind::Import | ChunkKind::Comment
            ) && !matches!(next.kind, ChunkKind::Block | ChunkKind::Import | ChunkKind::Comment)
            {
                cur.kind = next.kind;
                cur.node_type = next.node_type;
                cur.name = next.name.or(cur.name.take());
                cur.signature = next.signature;
                cur.docstring = next.docstring.or(cur.docstring.take());
                cur.scope_chain = next.scope_chain;
            } else if cur.kind != next.kind {
                cur.kind = ChunkKind::Block;
            }
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{LanguageParser, TreeSitterParser};

    fn chunk(source: &str, path: &str, lang: Lang, config: &ChunkerConfig) -> Vec<CodeChunk> {
        let parser = TreeSitterParser::new(lang).expect("grammar compiled in");
        let tree = parser.parse(source).unwrap();
        chunk_tree(source, &tree, path, lang, config)
    }

    fn tiny_min() -> ChunkerConfig {
        ChunkerConfig {
            target_size: 600,
            max_size: 1200,
            min_size: 5,
        }
    }

    fn assert_spans_match_source(chunks: &[CodeChunk], source: &str) {
        let mut last_end = 0;
        for c in chunks {
            assert!(c.start_byte >= last_end, "chunks overlap or are out of order");
            assert_eq!(c.content, &source[c.start_byte..c.end_byte]);
            assert!(c.start_line <= c.end_line);
            last_end = c.end_byte;
        }
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn rust_function_with_doc_and_signature() {
        let source = r#"
/// Greets the caller.
/// Twice.
fn hello(name: &str) -> String {
    format!("hello {name}")
}
"#;
        let chunks = chunk(source, "src/main.rs", Lang::Rust, &tiny_min());
        assert_eq!(chunks.len(), 1);
        let c = &chunks[0];
        assert_eq!(c.kind, ChunkKind::Function);
        assert_eq!(c.name.as_deref(), Some("hello"));
        assert_eq!(c.signature.as_deref(), Some("fn hello(name: &str) -> String"));
        assert_eq!(c.docstring.as_deref(), Some("Greets the caller.\nTwice."));
        assert!(c.content.starts_with("/// Greets"));
        assert_eq!(c.start_line, 2);
        assert_eq!(c.end_line, 6);
        assert!(c.processed_content.contains("# src/main.rs"));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn oversized_impl_yields_methods_in_scope() {
        let config = ChunkerConfig {
            target_size: 30,
            max_size: 60,
            min_size: 1,
        };
        let source = r#"
impl MyStruct {
    fn method_one(&self) -> i32 {
        let a = 1;
        let b = 2;
        a + b
    }
    fn method_two(&self) -> i32 {
        let c = 3;
        c
    }
}
"#;
        let chunks = chunk(source, "src/lib.rs", Lang::Rust, &config);
        let methods: Vec<_> = chunks
            .iter()
            .filter(|c| c.kind == ChunkKind::Method)
            .collect();
        assert_eq!(methods.len(), 2, "{chunks:#?}");
        assert!(methods.iter().all(|m| m.scope_chain == "MyStruct"));
        assert_eq!(methods[0].name.as_deref(), Some("method_one"));
        assert_spans_match_source(&chunks, source);
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn imports_extracted_for_rust() {
        let source = r#"
use std::io;
use std::path::Path;

fn main() {
    println!("hello");
}
"#;
        let chunks = chunk(source, "src/main.rs", Lang::Rust, &ChunkerConfig::default());
        assert!(!chunks.is_empty());
        assert!(chunks[0].imports.contains("use std::io"));
        assert!(chunks[0].imports.contains("use std::path::Path"));
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn small_functions_merge() {
        let config = ChunkerConfig {
            target_size: 600,
            max_size: 1200,
            min_size: 50,
        };
        let source = "fn a() { 1 }\nfn b() { 2 }\nfn c() { 3 }\n";
        let chunks = chunk(source, "src/main.rs", Lang::Rust, &config);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Function);
        assert_eq!(chunks[0].content, source.trim_end());
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn large_function_splits() {
        let config = ChunkerConfig {
            target_size: 50,
            max_size: 100,
            min_size: 10,
        };
        let mut body = String::from("fn big() {\n");
        for i in 0..30 {
            body.push_str(&format!("    let var{i} = {i};\n"));
        }
        body.push_str("}\n");

        let chunks = chunk(&body, "src/big.rs", Lang::Rust, &config);
        assert!(chunks.len() > 1, "expected split, got {}", chunks.len());
        assert!(chunks.iter().any(|c| c.scope_chain == "big"));
        assert_spans_match_source(&chunks, &body);
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn content_hash_deterministic() {
        let source = "fn test() { 42 }";
        let c1 = chunk(source, "a.rs", Lang::Rust, &ChunkerConfig::default());
        let c2 = chunk(source, "a.rs", Lang::Rust, &ChunkerConfig::default());
        assert_eq!(c1[0].content_hash, c2[0].content_hash);
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn python_class_with_docstring() {
        let source = r#"
class Greeter:
    """Greets people."""

    def hello(self):
        print("hello")
"#;
        let chunks = chunk(source, "app.py", Lang::Python, &tiny_min());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Class);
        assert_eq!(chunks[0].name.as_deref(), Some("Greeter"));
        assert_eq!(chunks[0].docstring.as_deref(), Some("Greets people."));
    }

    #[cfg(feature = "lang-js")]
    #[test]
    fn typescript_entities_classified() {
        let source = r#"
import { readFile } from "fs";

export interface Config {
  path: string;
}

export function parseConfig(text: string): Config {
  return JSON.parse(text);
}

const load = async (p: string) => parseConfig(await readFile(p, "utf8"));
"#;
        let chunks = chunk(source, "src/config.ts", Lang::TypeScript, &tiny_min());
        let find = |name: &str| chunks.iter().find(|c| c.name.as_deref() == Some(name));
        assert_eq!(find("Config").map(|c| c.kind), Some(ChunkKind::Interface));
        let parse = find("parseConfig").unwrap();
        assert_eq!(parse.kind, ChunkKind::Function);
        assert_eq!(
            parse.signature.as_deref(),
            Some("function parseConfig(text: string): Config")
        );
        assert_eq!(find("load").map(|c| c.kind), Some(ChunkKind::Function));
        assert!(chunks.iter().any(|c| c.kind == ChunkKind::Import));
        assert!(chunks[0].imports.contains("readFile"));
        assert_spans_match_source(&chunks, source);
    }

    #[cfg(feature = "lang-go")]
    #[test]
    fn go_method_declaration_is_method() {
        let source = "package main\n\nfunc (s *Server) Start() error {\n\treturn nil\n}\n";
        let chunks = chunk(source, "main.go", Lang::Go, &tiny_min());
        let start = chunks
            .iter()
            .find(|c| c.name.as_deref() == Some("Start"))
            .unwrap();
        assert_eq!(start.kind, ChunkKind::Method);
    }

    #[cfg(feature = "lang-config")]
    #[test]
    fn small_toml_is_one_file_chunk() {
        let source = "[package]\nname = \"test\"\nversion = \"0.1.0\"\n";
        let chunks = chunk(source, "Cargo.toml", Lang::Toml, &ChunkerConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::File);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
    }

    #[cfg(feature = "lang-config")]
    #[test]
    fn large_json_is_split() {
        let config = ChunkerConfig {
            target_size: 40,
            max_size: 80,
            min_size: 5,
        };
        let entries: Vec<String> = (0..40).map(|i| format!("\"key{i}\": {i}")).collect();
        let source = format!("{{\n{}\n}}\n", entries.join(",\n"));
        let chunks = chunk(&source, "data.json", Lang::Json, &config);
        assert!(chunks.len() > 1);
        assert_spans_match_source(&chunks, &source);
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn empty_source_yields_nothing() {
        assert!(chunk("  \n\n", "a.rs", Lang::Rust, &ChunkerConfig::default()).is_empty());
    }
}
