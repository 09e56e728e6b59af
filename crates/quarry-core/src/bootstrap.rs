//! Component wiring: provider, vector store, metadata store, orchestrator
//! and query engine, all built from one [`Config`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use quarry_index::{
    FileChangeMonitor, IndexOrchestrator, MetadataStore, QueryEngine, watcher::ChangeTarget,
};
use quarry_llm::any::AnyProvider;
use quarry_llm::http::{HttpTimeouts, build_client};
use quarry_llm::ollama::OllamaProvider;
use quarry_llm::openai::OpenAiProvider;
use quarry_vector::{InMemoryVectorStore, QdrantOps, VectorStore, VectorStoreClient};

use crate::config::{Config, ProviderKind, VectorBackend};

/// Priority: explicit path > `QUARRY_CONFIG` env > `quarry.toml`.
#[must_use]
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("QUARRY_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("quarry.toml")
}

/// # Errors
///
/// Returns an error if the HTTP client cannot be built.
pub fn create_provider(config: &Config) -> anyhow::Result<AnyProvider> {
    let llm = &config.llm;
    match llm.provider {
        ProviderKind::Ollama => Ok(AnyProvider::Ollama(OllamaProvider::new(
            &llm.base_url,
            llm.model.clone(),
            llm.embedding_model.clone(),
        ))),
        ProviderKind::OpenAi => {
            let client = build_client(HttpTimeouts {
                connect: Duration::from_secs(llm.connect_timeout_secs),
                request: Duration::from_secs(llm.request_timeout_secs),
            })
            .context("failed to build HTTP client")?;
            if llm.api_key.is_none() {
                tracing::debug!("no llm.api_key set, sending unauthenticated requests");
            }
            Ok(AnyProvider::OpenAi(
                OpenAiProvider::new(
                    client,
                    llm.api_key.clone(),
                    llm.base_url.clone(),
                    llm.model.clone(),
                    Some(llm.embedding_model.clone()),
                )
                .with_max_tokens(llm.max_tokens),
            ))
        }
    }
}

/// # Errors
///
/// Returns an error if the Qdrant client cannot be created or the client
/// configuration is invalid.
pub fn create_vector_store(config: &Config) -> anyhow::Result<VectorStoreClient> {
    let backend: Arc<dyn VectorStore> = match config.vector.backend {
        VectorBackend::Qdrant => Arc::new(
            QdrantOps::new(
                &config.vector.url,
                config.vector.api_key.clone(),
                Duration::from_secs(config.vector.timeout_secs),
            )
            .map_err(|e| anyhow::anyhow!("failed to create Qdrant client: {e}"))?,
        ),
        VectorBackend::Memory => {
            tracing::info!("using in-memory vector store, index is not persisted");
            Arc::new(InMemoryVectorStore::new())
        }
    };
    VectorStoreClient::new(backend, config.vector.client.clone())
        .context("invalid vector store configuration")
}

/// Log whether the provider answers; never fails startup.
pub async fn health_check(provider: &AnyProvider) {
    if let AnyProvider::Ollama(ollama) = provider {
        match ollama.health_check().await {
            Ok(()) => tracing::info!("ollama health check passed"),
            Err(e) => tracing::warn!("ollama health check failed: {e:#}"),
        }
    }
}

/// Metadata path resolved against the workspace root.
#[must_use]
pub fn metadata_path(config: &Config, root: &Path) -> PathBuf {
    let path = Path::new(&config.storage.sqlite_path);
    if config.storage.sqlite_path == ":memory:" || path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Fully wired application components.
pub struct App {
    config: Config,
    root: PathBuf,
    provider: Arc<AnyProvider>,
    store: Arc<VectorStoreClient>,
    metadata: MetadataStore,
    orchestrator: Arc<IndexOrchestrator<AnyProvider>>,
}

impl App {
    /// Validate `config` and build every component.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration, a missing workspace, or
    /// when the provider, vector store or metadata database cannot be created.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        config.validate()?;

        let root = config
            .workspace
            .root
            .canonicalize()
            .with_context(|| format!("workspace {} not found", config.workspace.root.display()))?;
        if !root.is_dir() {
            bail!("workspace {} is not a directory", root.display());
        }

        let provider = Arc::new(create_provider(&config)?);
        health_check(&provider).await;

        let store = Arc::new(create_vector_store(&config)?);

        let db_path = metadata_path(&config, &root);
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
            && config.storage.sqlite_path != ":memory:"
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let db_path_str = db_path
            .to_str()
            .with_context(|| format!("non UTF-8 metadata path {}", db_path.display()))?;
        let metadata = MetadataStore::open(db_path_str)
            .await
            .with_context(|| format!("failed to open metadata store {db_path_str}"))?;

        let orchestrator = Arc::new(IndexOrchestrator::new(
            root.clone(),
            Arc::clone(&provider),
            Arc::clone(&store),
            metadata.clone(),
            config.index.clone(),
        ));
        tracing::info!(
            workspace = %root.display(),
            provider = config.llm.provider.as_str(),
            collection = store.collection(),
            "quarry initialized"
        );

        Ok(Self {
            config,
            root,
            provider,
            store,
            metadata,
            orchestrator,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn store(&self) -> &Arc<VectorStoreClient> {
        &self.store
    }

    #[must_use]
    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<IndexOrchestrator<AnyProvider>> {
        &self.orchestrator
    }

    /// Search engine sharing the application provider for embeddings,
    /// expansion and re-ranking.
    #[must_use]
    pub fn query_engine(&self) -> QueryEngine<AnyProvider> {
        QueryEngine::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.store),
            self.config.search.clone(),
        )
        .with_llm(Arc::clone(&self.provider))
    }

    /// Change monitor feeding the orchestrator. Not started.
    ///
    /// # Errors
    ///
    /// Returns an error if the index path filters cannot be compiled.
    pub fn change_monitor(&self) -> anyhow::Result<FileChangeMonitor> {
        let target: Arc<dyn ChangeTarget> = self.orchestrator.clone();
        FileChangeMonitor::new(&self.root, target, &self.config.index, &self.config.watch)
            .context("failed to create change monitor")
    }
}
