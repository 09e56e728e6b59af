mod env;
mod types;


pub use types::*;

use std::path::Path;

use anyhow::{Context, bail};

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_index()?;
        self.validate_search()?;

        if self.vector.client.collection.trim().is_empty() {
            bail!("vector.collection must not be empty");
        }
        if self.vector.client.batch_size == 0 {
            bail!("vector.batch_size must be greater than zero");
        }
        if self.vector.client.retry.max_attempts == 0 {
            bail!("vector.retry.max_attempts must be at least 1");
        }
        if self.vector.backend == VectorBackend::Qdrant && self.vector.url.trim().is_empty() {
            bail!("vector.url is required for the qdrant backend");
        }
        if self.llm.base_url.trim().is_empty() {
            bail!("llm.base_url must not be empty");
        }
        if self.llm.embedding_model.trim().is_empty() {
            bail!("llm.embedding_model must not be empty");
        }
        if self.watch.debounce_ms == 0 {
            bail!("watch.debounce_ms must be greater than zero");
        }
        if self.storage.sqlite_path.trim().is_empty() {
            bail!("storage.sqlite_path must not be empty");
        }
        Ok(())
    }

    fn validate_index(&self) -> anyhow::Result<()> {
        let index = &self.index;
        if index.max_file_size == 0 {
            bail!("index.max_file_size must be greater than zero");
        }
        if index.parse_size_limit > index.max_file_size {
            bail!(
                "index.parse_size_limit ({}) exceeds index.max_file_size ({})",
                index.parse_size_limit,
                index.max_file_size
            );
        }
        if index.workers == Some(0) {
            bail!("index.workers must be at least 1 when set");
        }
        if index.embedding_batch_size == 0 {
            bail!("index.embedding_batch_size must be greater than zero");
        }
        if index.window.window_chars == 0 || index.window.max_chunks == 0 {
            bail!("index.window.window_chars and index.window.max_chunks must be positive");
        }
        let chunker = &index.chunker;
        if !(chunker.min_size <= chunker.target_size && chunker.target_size <= chunker.max_size) {
            bail!(
                "index.chunker sizes must satisfy min_size <= target_size <= max_size, got {} / {} / {}",
                chunker.min_size,
                chunker.target_size,
                chunker.max_size
            );
        }
        Ok(())
    }

    fn validate_search(&self) -> anyhow::Result<()> {
        let search = &self.search;
        if search.oversample_factor == 0 {
            bail!("search.oversample_factor must be at least 1");
        }
        if search.default_page_size == 0 || search.default_page_size > search.max_page_size {
            bail!(
                "search.default_page_size must be between 1 and search.max_page_size ({})",
                search.max_page_size
            );
        }
        let expansion = &search.expansion;
        if !(0.0..=1.0).contains(&expansion.min_confidence) {
            bail!("search.expansion.min_confidence must be within [0, 1]");
        }
        let rerank = &search.rerank;
        let weights_ok = rerank.vector_weight.is_finite()
            && rerank.llm_weight.is_finite()
            && rerank.vector_weight >= 0.0
            && rerank.llm_weight >= 0.0
            && rerank.vector_weight + rerank.llm_weight > 0.0;
        if !weights_ok {
            bail!("search.rerank weights must be non-negative and not both zero");
        }
        if rerank.top_m == 0 || rerank.concurrency == 0 {
            bail!("search.rerank.top_m and search.rerank.concurrency must be at least 1");
        }
        Ok(())
    }
}
