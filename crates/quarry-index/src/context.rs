//! Embedding text for chunks.
//!
//! Raw code embeds poorly for conceptual queries, so each chunk carries a
//! header with its path, scope chain, language and a few import lines.

use crate::chunk::CodeChunk;

/// Maximum number of import lines included in the embedding text.
pub const MAX_IMPORT_LINES: usize = 5;

/// Build the text that is embedded for `chunk` (never shown to users).
#[must_use]
pub fn contextualize_for_embedding(chunk: &CodeChunk) -> String {
    let mut text = String::with_capacity(chunk.content.len() + 256);

    text.push_str("# ");
    text.push_str(&chunk.file_path);
    text.push('\n');

    if !chunk.scope_chain.is_empty() {
        text.push_str("# Scope: ");
        text.push_str(&chunk.scope_chain);
        text.push('\n');
    }

    text.push_str("# Language: ");
    text.push_str(chunk.language_id());
    text.push('\n');

    if let Some(doc) = chunk.docstring.as_deref().filter(|d| !d.is_empty()) {
        text.push_str("# Doc: ");
        text.push_str(doc.lines().next().unwrap_or_default());
        text.push('\n');
    }

    if !chunk.imports.is_empty() {
        for line in chunk.imports.lines().take(MAX_IMPORT_LINES) {
            text.push_str(line);
            text.push('\n');
        }
    }

    text.push_str(&chunk.content);
    text
}

/// Short header for display: `path :: name (lines a-b)`.
#[must_use]
pub fn chunk_display_header(chunk: &CodeChunk) -> String {
    let name = chunk.name.as_deref().unwrap_or(&chunk.node_type);
    format!(
        "{} :: {} (lines {}-{})",
        chunk.file_path, name, chunk.start_line, chunk.end_line
    )
}
