//! Mapping between chunks and vector points.

use std::collections::HashMap;

use quarry_vector::VectorPoint;
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::chunk::{ChunkKind, CodeChunk, SymbolInfo};
use crate::languages::extension_of;

/// Payload keys with filter indexes in the vector store.
pub mod fields {
    pub use quarry_vector::FILE_PATH_FIELD as FILE_PATH;
    pub const LANGUAGE: &str = "language";
    pub const EXTENSION: &str = "extension";
    pub const CHUNK_KIND: &str = "chunk_kind";
    pub const MODIFIED_AT: &str = "modified_at";
    pub const INDEXED_AT: &str = "indexed_at";
}

/// Stable point id for chunk `index` of `rel_path`.
///
/// Re-indexing the same file produces the same ids, so upserts replace
/// instead of duplicating.
#[must_use]
pub fn point_id(rel_path: &str, index: usize) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{rel_path}#{index}").as_bytes()).to_string()
}

/// Build the point for one embedded chunk. Timestamps are unix seconds.
#[must_use]
pub fn chunk_to_point(
    chunk: &CodeChunk,
    index: usize,
    vector: Vec<f32>,
    modified_at: i64,
    indexed_at: i64,
) -> VectorPoint {
    let extension = extension_of(std::path::Path::new(&chunk.file_path)).unwrap_or_default();
    let mut payload: HashMap<String, Value> = HashMap::with_capacity(20);
    payload.insert(fields::FILE_PATH.into(), json!(chunk.file_path));
    payload.insert(fields::LANGUAGE.into(), json!(chunk.language_id()));
    payload.insert(fields::EXTENSION.into(), json!(extension));
    payload.insert(fields::CHUNK_KIND.into(), json!(chunk.kind.as_str()));
    payload.insert("node_type".into(), json!(chunk.node_type));
    payload.insert("name".into(), json!(chunk.name));
    payload.insert("signature".into(), json!(chunk.signature));
    payload.insert("docstring".into(), json!(chunk.docstring));
    payload.insert("scope".into(), json!(chunk.scope_chain));
    payload.insert("start_line".into(), json!(chunk.start_line));
    payload.insert("end_line".into(), json!(chunk.end_line));
    payload.insert("start_byte".into(), json!(chunk.start_byte));
    payload.insert("end_byte".into(), json!(chunk.end_byte));
    payload.insert("content".into(), json!(chunk.content));
    payload.insert("content_hash".into(), json!(chunk.content_hash));
    payload.insert("chunk_index".into(), json!(index));
    payload.insert(fields::MODIFIED_AT.into(), json!(modified_at));
    payload.insert(fields::INDEXED_AT.into(), json!(indexed_at));
    if let Some(symbols) = &chunk.symbols {
        payload.insert("symbols".into(), json!(symbols));
    }

    VectorPoint {
        id: point_id(&chunk.file_path, index),
        vector,
        payload,
    }
}

/// A chunk as read back from a search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRef {
    pub file_path: String,
    pub language: String,
    pub kind: ChunkKind,
    pub node_type: String,
    pub name: Option<String>,
    pub signature: Option<String>,
    pub docstring: Option<String>,
    pub scope: String,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
    pub content_hash: String,
    pub chunk_index: usize,
    pub modified_at: i64,
    pub symbols: Option<SymbolInfo>,
}

impl ChunkRef {
    /// `None` when a required key is missing, e.g. points written by
    /// something other than the indexer.
    #[must_use]
    pub fn from_payload(p: &HashMap<String, Value>) -> Option<Self> {
        let get_str = |key: &str| p.get(key).and_then(Value::as_str).map(str::to_owned);
        let get_usize = |key: &str| {
            p.get(key)
                .and_then(Value::as_u64)
                .and_then(|v| usize::try_from(v).ok())
        };

        Some(Self {
            file_path: get_str(fields::FILE_PATH)?,
            language: get_str(fields::LANGUAGE).unwrap_or_default(),
            kind: get_str(fields::CHUNK_KIND)
                .and_then(|k| ChunkKind::from_str_opt(&k))
                .unwrap_or(ChunkKind::Block),
            node_type: get_str("node_type").unwrap_or_default(),
            name: get_str("name"),
            signature: get_str("signature"),
            docstring: get_str("docstring"),
            scope: get_str("scope").unwrap_or_default(),
            start_line: get_usize("start_line")?,
            end_line: get_usize("end_line")?,
            content: get_str("content")?,
            content_hash: get_str("content_hash").unwrap_or_default(),
            chunk_index: get_usize("chunk_index").unwrap_or_default(),
            modified_at: p
                .get(fields::MODIFIED_AT)
                .and_then(Value::as_i64)
                .unwrap_or_default(),
            symbols: p
                .get("symbols")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::Lang;

    fn chunk() -> CodeChunk {
        CodeChunk {
            file_path: "src/config.rs".into(),
            language: Some(Lang::Rust),
            kind: ChunkKind::Function,
            node_type: "function_item".into(),
            name: Some("parse_config".into()),
            signature: Some("fn parse_config(s: &str) -> Config".into()),
            docstring: None,
            content: "fn parse_config(s: &str) -> Config { todo!() }".into(),
            processed_content: String::new(),
            start_line: 3,
            end_line: 5,
            start_byte: 10,
            end_byte: 60,
            scope_chain: String::new(),
            imports: String::new(),
            content_hash: "h".into(),
            symbols: Some(SymbolInfo {
                definitions: vec!["parse_config".into()],
                references: vec![],
            }),
        }
    }

    #[test]
    fn point_ids_are_stable_and_distinct() {
        assert_eq!(point_id("a.rs", 0), point_id("a.rs", 0));
        assert_ne!(point_id("a.rs", 0), point_id("a.rs", 1));
        assert_ne!(point_id("a.rs", 0), point_id("b.rs", 0));
        assert!(Uuid::parse_str(&point_id("a.rs", 0)).is_ok());
    }

    #[test]
    fn payload_carries_filter_fields() {
        let point = chunk_to_point(&chunk(), 2, vec![0.5; 4], 1_700_000_000, 1_700_000_100);
        assert_eq!(point.id, point_id("src/config.rs", 2));
        assert_eq!(point.payload[fields::FILE_PATH], "src/config.rs");
        assert_eq!(point.payload[fields::LANGUAGE], "rust");
        assert_eq!(point.payload[fields::EXTENSION], "rs");
        assert_eq!(point.payload[fields::CHUNK_KIND], "function");
        assert_eq!(point.payload[fields::MODIFIED_AT], 1_700_000_000);
    }

    #[test]
    fn chunk_ref_reads_back_payload() {
        let point = chunk_to_point(&chunk(), 2, vec![0.5; 4], 7, 8);
        let chunk_ref = ChunkRef::from_payload(&point.payload).unwrap();
        assert_eq!(chunk_ref.file_path, "src/config.rs");
        assert_eq!(chunk_ref.kind, ChunkKind::Function);
        assert_eq!(chunk_ref.name.as_deref(), Some("parse_config"));
        assert_eq!((chunk_ref.start_line, chunk_ref.end_line), (3, 5));
        assert_eq!(chunk_ref.chunk_index, 2);
        assert_eq!(chunk_ref.modified_at, 7);
        assert_eq!(chunk_ref.symbols.unwrap().definitions, vec!["parse_config"]);
    }

    #[test]
    fn foreign_payload_is_rejected() {
        let payload = HashMap::from([("text".to_string(), json!("hello"))]);
        assert!(ChunkRef::from_payload(&payload).is_none());
    }
}
