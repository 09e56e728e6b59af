//! Semantic search over the indexed workspace.
//!
//! A query is embedded (optionally after LLM expansion), matched against the
//! vector store with payload filters, thresholded, collapsed to the best chunk
//! per file, optionally re-ranked by an LLM and then paginated.

pub mod expansion;
pub mod rerank;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use quarry_llm::LlmProvider;
use quarry_vector::{FieldValue, VectorFilter, VectorStoreClient};
use serde::{Deserialize, Serialize};

use crate::config::{RerankConfig, SearchConfig};
use crate::error::{IndexError, Result};
use crate::points::{ChunkRef, fields};

/// Payload filters applied inside the vector store, plus a client-side
/// similarity floor.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SearchFilters {
    /// Language ids such as `rust` or `python`. Empty means any.
    #[serde(default)]
    pub languages: Vec<String>,
    /// Extensions without the dot, case-insensitive. Empty means any.
    #[serde(default)]
    pub file_types: Vec<String>,
    #[serde(default)]
    pub modified_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_before: Option<DateTime<Utc>>,
    /// Hits scoring below this are dropped before per-file dedup.
    #[serde(default)]
    pub min_similarity: Option<f32>,
}

impl SearchFilters {
    fn to_vector_filter(&self) -> Option<VectorFilter> {
        let mut filter = VectorFilter::default();
        let languages: Vec<String> = self
            .languages
            .iter()
            .map(|l| l.trim().to_ascii_lowercase())
            .filter(|l| !l.is_empty())
            .collect();
        if !languages.is_empty() {
            filter = filter.and(fields::LANGUAGE, FieldValue::AnyText(languages));
        }
        let extensions: Vec<String> = self
            .file_types
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        if !extensions.is_empty() {
            filter = filter.and(fields::EXTENSION, FieldValue::AnyText(extensions));
        }
        if self.modified_after.is_some() || self.modified_before.is_some() {
            #[allow(clippy::cast_precision_loss)]
            let ts = |d: &DateTime<Utc>| d.timestamp() as f64;
            filter = filter.and(
                fields::MODIFIED_AT,
                FieldValue::Range {
                    gte: self.modified_after.as_ref().map(ts),
                    lte: self.modified_before.as_ref().map(ts),
                },
            );
        }
        (!filter.is_empty()).then_some(filter)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SearchQuery {
    pub text: String,
    #[serde(default)]
    pub filters: SearchFilters,
    /// 1-based.
    #[serde(default = "first_page")]
    pub page: usize,
    /// `None` uses the configured default.
    #[serde(default)]
    pub page_size: Option<usize>,
    /// Per-query override of the configured expansion toggle.
    #[serde(default)]
    pub expand: Option<bool>,
    /// Per-query override of the configured re-rank toggle.
    #[serde(default)]
    pub rerank: Option<bool>,
}

fn first_page() -> usize {
    1
}

impl SearchQuery {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            filters: SearchFilters::default(),
            page: 1,
            page_size: None,
            expand: None,
            rerank: None,
        }
    }

    #[must_use]
    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    #[must_use]
    pub fn with_page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = Some(page_size);
        self
    }

    #[must_use]
    pub fn with_expansion(mut self, enabled: bool) -> Self {
        self.expand = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_rerank(mut self, enabled: bool) -> Self {
        self.rerank = Some(enabled);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub chunk: ChunkRef,
    /// Raw vector similarity of the best chunk in the file.
    pub similarity: f32,
    pub llm_score: Option<f32>,
    /// Blended score when re-ranked, otherwise equal to `similarity`.
    pub final_score: f32,
    pub explanation: Option<String>,
    pub reranked: bool,
}

impl RankedResult {
    fn new(chunk: ChunkRef, similarity: f32) -> Self {
        Self {
            chunk,
            similarity,
            llm_score: None,
            final_score: similarity,
            explanation: None,
            reranked: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<RankedResult>,
    /// Distinct files among the fetched candidates.
    pub total_results: usize,
    pub page: usize,
    pub page_size: usize,
    pub has_more: bool,
    pub processing_time_ms: u64,
    /// Text actually embedded, when expansion produced terms.
    pub expanded_query: Option<String>,
    pub reranked: bool,
}

/// Search front end. `E` embeds queries; `L` serves expansion and re-ranking.
pub struct QueryEngine<E, L = E> {
    embedder: Arc<E>,
    llm: Option<Arc<L>>,
    store: Arc<VectorStoreClient>,
    config: SearchConfig,
}

impl<E: LlmProvider> QueryEngine<E, E> {
    /// Engine without an LLM; expansion and re-ranking are unavailable until
    /// [`QueryEngine::with_llm`] is called.
    #[must_use]
    pub fn new(embedder: Arc<E>, store: Arc<VectorStoreClient>, config: SearchConfig) -> Self {
        Self {
            embedder,
            llm: None,
            store,
            config,
        }
    }
}

impl<E: LlmProvider, L: LlmProvider> QueryEngine<E, L> {
    #[must_use]
    pub fn with_llm<M: LlmProvider>(self, llm: Arc<M>) -> QueryEngine<E, M> {
        QueryEngine {
            embedder: self.embedder,
            llm: Some(llm),
            store: self.store,
            config: self.config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Run one search.
    ///
    /// # Errors
    ///
    /// [`IndexError::InvalidArgument`] for an empty query or out-of-range
    /// paging, otherwise embedding or vector store failures. Expansion and
    /// re-ranking never fail the search.
    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        let started = Instant::now();
        let text = query.text.trim();
        let page_size = self.validate(query, text)?;
        let page = query.page;

        let collection = self.store.collection();
        if self.store.collection_info(collection).await?.is_none() {
            tracing::debug!(collection, "search against missing collection");
            return Ok(SearchResponse {
                results: Vec::new(),
                total_results: 0,
                page,
                page_size,
                has_more: false,
                processing_time_ms: elapsed_ms(started),
                expanded_query: None,
                reranked: false,
            });
        }

        let expanded = match (&self.llm, query.expand.unwrap_or(self.config.expansion.enabled)) {
            (Some(llm), true) => {
                expansion::expand_query(llm.as_ref(), text, &self.config.expansion).await
            }
            (None, true) => {
                tracing::debug!("query expansion requested without an LLM");
                None
            }
            _ => None,
        };
        let embed_text = expanded.as_ref().map_or(text, |e| e.combined.as_str());
        let vector = self.embedder.embed(embed_text).await?;

        let rerank = query.rerank.unwrap_or(self.config.rerank.enabled);
        let fetch = page_size
            .saturating_mul(self.config.oversample_factor.max(1))
            .saturating_mul(page)
            .max(if rerank { self.config.rerank.top_m } else { 0 });
        let hits = self
            .store
            .search(
                collection,
                vector,
                u64::try_from(fetch).unwrap_or(u64::MAX),
                query.filters.to_vector_filter(),
            )
            .await?;
        let fetched = hits.len();

        let floor = query.filters.min_similarity;
        let candidates: Vec<RankedResult> = hits
            .into_iter()
            .filter(|h| floor.is_none_or(|min| h.score >= min))
            .filter_map(|h| match ChunkRef::from_payload(&h.payload) {
                Some(chunk) => Some(RankedResult::new(chunk, h.score)),
                None => {
                    tracing::debug!(id = %h.id, "skipping point without chunk payload");
                    None
                }
            })
            .collect();
        let mut results = best_per_file(candidates);

        let mut reranked = false;
        if rerank {
            if let Some(llm) = &self.llm {
                reranked = rerank_top(llm.as_ref(), text, &mut results, &self.config.rerank).await;
            } else {
                tracing::debug!("re-ranking requested without an LLM");
            }
        }

        let total_results = results.len();
        let start = (page - 1).saturating_mul(page_size);
        let has_more = start.saturating_add(page_size) < total_results;
        let results: Vec<RankedResult> = results.into_iter().skip(start).take(page_size).collect();

        let processing_time_ms = elapsed_ms(started);
        tracing::info!(
            query = text,
            fetched,
            total_results,
            returned = results.len(),
            reranked,
            processing_time_ms,
            "search complete"
        );
        Ok(SearchResponse {
            results,
            total_results,
            page,
            page_size,
            has_more,
            processing_time_ms,
            expanded_query: expanded.map(|e| e.combined),
            reranked,
        })
    }

    fn validate(&self, query: &SearchQuery, text: &str) -> Result<usize> {
        if text.is_empty() {
            return Err(IndexError::InvalidArgument("query text must not be empty".into()));
        }
        if query.page == 0 {
            return Err(IndexError::InvalidArgument("page is 1-based".into()));
        }
        let page_size = query.page_size.unwrap_or(self.config.default_page_size);
        if page_size == 0 || page_size > self.config.max_page_size {
            return Err(IndexError::InvalidArgument(format!(
                "page_size must be between 1 and {}",
                self.config.max_page_size
            )));
        }
        if let Some(min) = query.filters.min_similarity
            && !min.is_finite()
        {
            return Err(IndexError::InvalidArgument("min_similarity must be finite".into()));
        }
        Ok(page_size)
    }
}

/// Keep the highest-scoring chunk per file, ordered by score descending.
/// Ties break on file path so output is deterministic.
pub(crate) fn best_per_file(candidates: Vec<RankedResult>) -> Vec<RankedResult> {
    let mut best: HashMap<String, RankedResult> = HashMap::with_capacity(candidates.len());
    for candidate in candidates {
        match best.get(&candidate.chunk.file_path) {
            Some(current) if current.similarity >= candidate.similarity => {}
            _ => {
                best.insert(candidate.chunk.file_path.clone(), candidate);
            }
        }
    }
    let mut results: Vec<RankedResult> = best.into_values().collect();
    results.sort_by(|a, b| {
        b.final_score
            .total_cmp(&a.final_score)
            .then_with(|| a.chunk.file_path.cmp(&b.chunk.file_path))
    });
    results
}

/// Blend LLM relevance into the first `top_m` results and re-sort that
/// prefix. Results past the prefix keep their similarity order. Returns
/// whether scores were applied.
async fn rerank_top<L: LlmProvider>(
    llm: &L,
    query: &str,
    results: &mut [RankedResult],
    config: &RerankConfig,
) -> bool {
    let m = config.top_m.min(results.len());
    if m == 0 {
        return false;
    }
    let chunks: Vec<&ChunkRef> = results[..m].iter().map(|r| &r.chunk).collect();
    let Some(judgments) = rerank::judge_candidates(llm, query, &chunks, config).await else {
        return false;
    };
    for (result, judgment) in results[..m].iter_mut().zip(judgments) {
        result.llm_score = Some(judgment.score);
        result.final_score =
            config.vector_weight * result.similarity + config.llm_weight * judgment.score;
        result.explanation = judgment.reason;
        result.reranked = true;
    }
    results[..m].sort_by(|a, b| {
        b.final_score
            .total_cmp(&a.final_score)
            .then_with(|| a.chunk.file_path.cmp(&b.chunk.file_path))
    });
    true
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
