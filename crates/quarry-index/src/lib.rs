//! Code indexing and semantic search.
//!
//! Source files are discovered with gitignore semantics, parsed with
//! tree-sitter into AST chunks (or sliding text windows when no grammar
//! applies), embedded through an [`quarry_llm::LlmProvider`] and stored as
//! points in a vector collection. A SQLite metadata store tracks content
//! hashes so re-runs only touch changed files.
//!
//! [`IndexOrchestrator`] drives a worker pool through a session with
//! pause, resume and cancel. [`FileChangeMonitor`] keeps the index current
//! as files change, and [`QueryEngine`] answers searches with optional LLM
//! query expansion and re-ranking.

pub mod chunk;
pub mod chunker;
pub mod config;
pub mod context;
pub mod discovery;
pub mod encoding;
pub mod error;
pub mod languages;
pub mod metadata;
pub mod orchestrator;
pub mod parser;
pub mod points;
pub mod query;
pub mod session;
pub mod watcher;
pub mod window;
pub mod worker;

pub use chunk::{ChunkKind, CodeChunk, SymbolInfo};
pub use config::{ExpansionConfig, IndexerConfig, RerankConfig, SearchConfig, WatchConfig};
pub use error::{IndexError, Result};
pub use languages::Lang;
pub use metadata::MetadataStore;
pub use orchestrator::IndexOrchestrator;
pub use parser::ParserRegistry;
pub use points::ChunkRef;
pub use query::{QueryEngine, RankedResult, SearchFilters, SearchQuery, SearchResponse};
pub use session::{IndexPhase, IndexReport, IndexStatus, ProgressEvent, StatusSnapshot};
pub use watcher::{ChangeEvent, ChangeKind, ChangeOutcome, FileChangeMonitor};
