//! Fixed-size text windows for files that are too large or cannot be parsed.

use serde::Deserialize;

use crate::chunk::{ChunkKind, CodeChunk, blake3_hex, non_ws_len};
use crate::context::contextualize_for_embedding;
use crate::languages::Lang;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Target window size in characters.
    pub window_chars: usize,
    /// Lines repeated at the start of the next window.
    pub overlap_lines: usize,
    /// Hard cap on windows per file.
    pub max_chunks: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_chars: 2000,
            overlap_lines: 3,
            max_chunks: 20,
        }
    }
}

struct Line {
    start: usize,
    /// Exclusive, including the line terminator.
    end: usize,
}

/// Split `source` into at most `max_chunks` overlapping line windows.
///
/// A single line longer than `window_chars` is cut at character boundaries.
#[must_use]
pub fn window_chunks(
    source: &str,
    file_path: &str,
    language: Option<Lang>,
    config: &WindowConfig,
) -> Vec<CodeChunk> {
    if non_ws_len(source) == 0 || config.max_chunks == 0 {
        return Vec::new();
    }
    let window_chars = config.window_chars.max(1);
    let lines = split_lines(source);
    let mut chunks = Vec::new();
    let mut first = 0usize;

    while first < lines.len() && chunks.len() < config.max_chunks {
        let line = &lines[first];
        if source[line.start..line.end].chars().count() > window_chars {
            for (start, end) in char_slices(source, line.start, line.end, window_chars) {
                if chunks.len() >= config.max_chunks {
                    break;
                }
                push_window(&mut chunks, source, file_path, language, (start, end), (first, first));
            }
            first += 1;
            continue;
        }

        let mut last = first;
        let mut chars = source[line.start..line.end].chars().count();
        while last + 1 < lines.len() {
            let next = &lines[last + 1];
            let next_chars = source[next.start..next.end].chars().count();
            if chars + next_chars > window_chars {
                break;
            }
            chars += next_chars;
            last += 1;
        }

        push_window(
            &mut chunks,
            source,
            file_path,
            language,
            (lines[first].start, lines[last].end),
            (first, last),
        );

        if last + 1 >= lines.len() {
            break;
        }
        let overlap_start = (last + 1).saturating_sub(config.overlap_lines);
        first = overlap_start.max(first + 1);
    }

    if chunks.len() == config.max_chunks && chunks.last().is_some_and(|c| c.end_byte < source.len()) {
        tracing::debug!(
            file = %file_path,
            max_chunks = config.max_chunks,
            "text windows truncated"
        );
    }
    chunks
}

fn push_window(
    chunks: &mut Vec<CodeChunk>,
    source: &str,
    file_path: &str,
    language: Option<Lang>,
    (start_byte, end_byte): (usize, usize),
    (first_line, last_line): (usize, usize),
) {
    let content = &source[start_byte..end_byte];
    if non_ws_len(content) == 0 {
        return;
    }
    let mut chunk = CodeChunk {
        file_path: file_path.to_string(),
        language,
        kind: ChunkKind::TextWindow,
        node_type: "text_window".to_string(),
        name: None,
        signature: None,
        docstring: None,
        content: content.to_string(),
        processed_content: String::new(),
        start_line: first_line + 1,
        end_line: last_line + 1,
        start_byte,
        end_byte,
        scope_chain: String::new(),
        imports: String::new(),
        content_hash: blake3_hex(content.as_bytes()),
        symbols: None,
    };
    chunk.processed_content = contextualize_for_embedding(&chunk);
    chunks.push(chunk);
}

fn split_lines(source: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut start = 0;
    for (idx, _) in source.match_indices('\n') {
        lines.push(Line {
            start,
            end: idx + 1,
        });
        start = idx + 1;
    }
    if start < source.len() {
        lines.push(Line {
            start,
            end: source.len(),
        });
    }
    lines
}

fn char_slices(source: &str, start: usize, end: usize, max_chars: usize) -> Vec<(usize, usize)> {
    let mut slices = Vec::new();
    let mut slice_start = start;
    let mut count = 0;
    for (offset, _) in source[start..end].char_indices() {
        if count == max_chars {
            slices.push((slice_start, start + offset));
            slice_start = start + offset;
            count = 0;
        }
        count += 1;
    }
    if slice_start < end {
        slices.push((slice_start, end));
    }
    slices
}
