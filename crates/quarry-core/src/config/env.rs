use std::path::PathBuf;

use super::Config;

/// Parse `name` as `T`, warning and returning `None` on a malformed value.
fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let v = std::env::var(name).ok()?;
    match v.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("ignoring invalid {name} value: {v}");
            None
        }
    }
}

fn list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_backends();
        self.apply_env_overrides_pipeline();
    }

    fn apply_env_overrides_backends(&mut self) {
        if let Ok(v) = std::env::var("QUARRY_WORKSPACE") {
            self.workspace.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_PROVIDER") {
            if let Ok(kind) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.llm.provider = kind;
            } else {
                tracing::warn!("ignoring invalid QUARRY_LLM_PROVIDER value: {v}");
            }
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(secs) = parsed::<u64>("QUARRY_LLM_TIMEOUT") {
            self.llm.request_timeout_secs = secs;
        }
        if let Ok(v) = std::env::var("QUARRY_VECTOR_BACKEND") {
            if let Ok(backend) = serde_json::from_value(serde_json::Value::String(v.clone())) {
                self.vector.backend = backend;
            } else {
                tracing::warn!("ignoring invalid QUARRY_VECTOR_BACKEND value: {v}");
            }
        }
        if let Ok(v) = std::env::var("QUARRY_QDRANT_URL") {
            self.vector.url = v;
        }
        if let Ok(v) = std::env::var("QUARRY_QDRANT_API_KEY") {
            self.vector.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("QUARRY_COLLECTION") {
            self.vector.client.collection = v;
        }
        if let Ok(v) = std::env::var("QUARRY_SQLITE_PATH") {
            self.storage.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("QUARRY_LOG_FILE") {
            self.logging.file = Some(PathBuf::from(v));
        }
    }

    fn apply_env_overrides_pipeline(&mut self) {
        if let Some(n) = parsed::<usize>("QUARRY_INDEX_WORKERS") {
            self.index.workers = Some(n);
        }
        if let Some(bytes) = parsed::<u64>("QUARRY_INDEX_MAX_FILE_SIZE") {
            self.index.max_file_size = bytes;
        }
        if let Ok(v) = std::env::var("QUARRY_INDEX_EXCLUDE") {
            self.index.exclude.extend(list(&v));
        }
        if let Some(n) = parsed::<usize>("QUARRY_INDEX_BATCH_SIZE") {
            self.index.embedding_batch_size = n;
        }
        if let Some(enabled) = parsed::<bool>("QUARRY_SEARCH_EXPANSION_ENABLED") {
            self.search.expansion.enabled = enabled;
        }
        if let Some(enabled) = parsed::<bool>("QUARRY_SEARCH_RERANK_ENABLED") {
            self.search.rerank.enabled = enabled;
        }
        if let Some(enabled) = parsed::<bool>("QUARRY_WATCH_ENABLED") {
            self.watch.enabled = enabled;
        }
        if let Some(ms) = parsed::<u64>("QUARRY_WATCH_DEBOUNCE_MS") {
            self.watch.debounce_ms = ms;
        }
    }
}
