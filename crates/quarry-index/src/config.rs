//! Configuration structs owned by the indexing crate.

use serde::Deserialize;

use crate::chunker::ChunkerConfig;
use crate::window::WindowConfig;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IndexerConfig {
    /// Whitelist globs. Empty means every non-excluded file.
    #[serde(default)]
    pub include: Vec<String>,
    /// Gitignore-style globs; a bare name matches at any depth.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    /// Files above this size are skipped at discovery.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Files above this size skip parsing and use text windows.
    #[serde(default = "default_parse_size_limit")]
    pub parse_size_limit: u64,
    #[serde(default = "default_true")]
    pub respect_gitignore: bool,
    #[serde(default)]
    pub include_hidden: bool,
    /// Worker count override; `None` sizes the pool from available cores.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Embed inside workers (one batch per file) instead of a separate phase.
    #[serde(default = "default_true")]
    pub embed_in_workers: bool,
    /// Texts per embedding request in the separate embedding phase.
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub window: WindowConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: default_exclude(),
            max_file_size: default_max_file_size(),
            parse_size_limit: default_parse_size_limit(),
            respect_gitignore: true,
            include_hidden: false,
            workers: None,
            embed_in_workers: true,
            embedding_batch_size: default_embedding_batch_size(),
            chunker: ChunkerConfig::default(),
            window: WindowConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// `max(1, cores - 1)` unless `workers` is set.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        if let Some(n) = self.workers {
            return n.max(1);
        }
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .saturating_sub(1)
            .max(1)
    }
}

fn default_exclude() -> Vec<String> {
    [
        "node_modules",
        "target",
        ".git",
        "dist",
        "build",
        "*.lock",
        "*.min.js",
        "package-lock.json",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

fn default_parse_size_limit() -> u64 {
    1024 * 1024
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchConfig {
    /// Candidates fetched per requested result, before dedup.
    #[serde(default = "default_oversample_factor")]
    pub oversample_factor: usize,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            oversample_factor: default_oversample_factor(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            expansion: ExpansionConfig::default(),
            rerank: RerankConfig::default(),
        }
    }
}

fn default_oversample_factor() -> usize {
    5
}

fn default_page_size() -> usize {
    10
}

fn default_max_page_size() -> usize {
    100
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExpansionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_terms")]
    pub max_terms: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    /// How many times the original query is repeated in the combined text.
    #[serde(default = "default_original_weight")]
    pub original_weight: usize,
    #[serde(default = "default_expansion_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_terms: default_max_terms(),
            min_confidence: default_min_confidence(),
            original_weight: default_original_weight(),
            timeout_secs: default_expansion_timeout_secs(),
        }
    }
}

fn default_max_terms() -> usize {
    5
}

fn default_min_confidence() -> f32 {
    0.6
}

fn default_original_weight() -> usize {
    2
}

fn default_expansion_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RerankConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Number of top deduplicated candidates scored by the LLM.
    #[serde(default = "default_top_m")]
    pub top_m: usize,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_llm_weight")]
    pub llm_weight: f32,
    #[serde(default = "default_rerank_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_rerank_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            top_m: default_top_m(),
            vector_weight: default_vector_weight(),
            llm_weight: default_llm_weight(),
            concurrency: default_rerank_concurrency(),
            timeout_secs: default_rerank_timeout_secs(),
        }
    }
}

fn default_top_m() -> usize {
    10
}

fn default_vector_weight() -> f32 {
    0.3
}

fn default_llm_weight() -> f32 {
    0.7
}

fn default_rerank_concurrency() -> usize {
    4
}

fn default_rerank_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_debounce_ms() -> u64 {
    500
}
