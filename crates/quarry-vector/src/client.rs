use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VectorStoreError};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::validation::{validate_collection_name, validate_points, validate_vector};
use crate::vector_store::{
    CollectionInfo, Distance, FieldValue, ScoredVectorPoint, VectorFilter, VectorPoint,
    VectorStore,
};

/// Payload key holding the workspace-relative source path.
pub const FILE_PATH_FIELD: &str = "file_path";

fn default_collection() -> String {
    "quarry_code".into()
}

fn default_batch_size() -> usize {
    100
}

fn default_health_ttl_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorClientConfig {
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default)]
    pub distance: Distance,
    /// Maximum points per upsert request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_health_ttl_secs")]
    pub health_ttl_secs: u64,
}

impl Default for VectorClientConfig {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            distance: Distance::default(),
            batch_size: default_batch_size(),
            retry: RetryPolicy::default(),
            health_ttl_secs: default_health_ttl_secs(),
        }
    }
}

/// Result of a probe against the vector database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub response_time_ms: u64,
    pub checked_at: DateTime<Utc>,
    /// Number of collections visible to the client, when the listing succeeded.
    pub collections_count: Option<usize>,
    pub error: Option<String>,
}

struct CachedHealth {
    report: HealthReport,
    at: Instant,
}

/// Validating, batching, retrying front end over a [`VectorStore`] backend.
pub struct VectorStoreClient {
    store: Arc<dyn VectorStore>,
    config: VectorClientConfig,
    dimensions: RwLock<HashMap<String, usize>>,
    health: RwLock<Option<CachedHealth>>,
}

impl std::fmt::Debug for VectorStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStoreClient")
            .field("collection", &self.config.collection)
            .field("batch_size", &self.config.batch_size)
            .finish_non_exhaustive()
    }
}

impl VectorStoreClient {
    /// # Errors
    ///
    /// Returns [`VectorStoreError::Validation`] if the default collection name or
    /// batch size is invalid.
    pub fn new(store: Arc<dyn VectorStore>, config: VectorClientConfig) -> Result<Self> {
        validate_collection_name(&config.collection)?;
        if config.batch_size == 0 {
            return Err(VectorStoreError::Validation(
                "batch_size must be greater than zero".into(),
            ));
        }
        Ok(Self {
            store,
            config,
            dimensions: RwLock::new(HashMap::new()),
            health: RwLock::new(None),
        })
    }

    /// Default collection this client was configured with.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.config.collection
    }

    #[must_use]
    pub fn config(&self) -> &VectorClientConfig {
        &self.config
    }

    /// Create `name` if missing. Returns `true` when the collection was created.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad names or a zero vector size, otherwise
    /// the backend error after retries.
    pub async fn ensure_collection(
        &self,
        name: &str,
        vector_size: u64,
        distance: Distance,
    ) -> Result<bool> {
        validate_collection_name(name)?;
        if vector_size == 0 {
            return Err(VectorStoreError::Validation(
                "vector size must be greater than zero".into(),
            ));
        }

        let existing = self.collection_info(name).await?;
        if let Some(info) = existing {
            if let Some(size) = info.vector_size
                && size != vector_size
            {
                return Err(VectorStoreError::Validation(format!(
                    "collection {name} has vector size {size}, embedder produces {vector_size}"
                )));
            }
            return Ok(false);
        }

        let created = retry_with_backoff(&self.config.retry, "ensure_collection", || {
            self.store.ensure_collection(name, vector_size, distance)
        })
        .await?;
        self.remember_dimension(name, vector_size);
        if created {
            tracing::info!(collection = name, vector_size, "vector collection created");
        }
        Ok(created)
    }

    /// Describe `name`, caching its vector dimension for later validation.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad names or the backend error after retries.
    pub async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>> {
        validate_collection_name(name)?;
        let info = retry_with_backoff(&self.config.retry, "collection_info", || {
            self.store.collection_info(name)
        })
        .await?;
        if let Some(size) = info.as_ref().and_then(|i| i.vector_size) {
            self.remember_dimension(name, size);
        }
        Ok(info)
    }

    /// # Errors
    ///
    /// Returns the backend error after retries.
    pub async fn list_collections(&self) -> Result<Vec<String>> {
        retry_with_backoff(&self.config.retry, "list_collections", || {
            self.store.list_collections()
        })
        .await
    }

    /// # Errors
    ///
    /// Returns a validation error for bad names or the backend error after retries.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        validate_collection_name(name)?;
        retry_with_backoff(&self.config.retry, "delete_collection", || {
            self.store.delete_collection(name)
        })
        .await?;
        if let Ok(mut dims) = self.dimensions.write() {
            dims.remove(name);
        }
        tracing::info!(collection = name, "vector collection deleted");
        Ok(())
    }

    /// Validate every point, then upsert in batches of `batch_size`.
    ///
    /// Nothing is sent when any point is invalid.
    ///
    /// # Errors
    ///
    /// Returns a validation error before any network call, or the first batch
    /// failure after retries.
    pub async fn upsert_points(&self, collection: &str, points: Vec<VectorPoint>) -> Result<()> {
        validate_collection_name(collection)?;
        if points.is_empty() {
            return Ok(());
        }
        let expected = self.dimension_of(collection).await?;
        validate_points(&points, expected)?;

        let total = points.len();
        for (i, batch) in points.chunks(self.config.batch_size).enumerate() {
            retry_with_backoff(&self.config.retry, "upsert", || {
                self.store.upsert(collection, batch.to_vec())
            })
            .await?;
            tracing::debug!(collection, batch = i, size = batch.len(), "upserted batch");
        }
        tracing::debug!(collection, total, "upserted points");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a validation error for a bad name or vector, otherwise the backend
    /// error after retries.
    pub async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
    ) -> Result<Vec<ScoredVectorPoint>> {
        validate_collection_name(collection)?;
        let expected = self.dimension_of(collection).await?;
        validate_vector(&vector, expected)?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let filter = filter.filter(|f| !f.is_empty());
        retry_with_backoff(&self.config.retry, "search", || {
            self.store
                .search(collection, vector.clone(), limit, filter.clone())
        })
        .await
    }

    /// Remove every point whose payload `file_path` equals `file_path`.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty path or the backend error after retries.
    pub async fn delete_by_file_path(&self, collection: &str, file_path: &str) -> Result<()> {
        if file_path.trim().is_empty() {
            return Err(VectorStoreError::Validation(
                "file path must not be empty".into(),
            ));
        }
        self.delete_by_filter(
            collection,
            VectorFilter::must(FILE_PATH_FIELD, FieldValue::Text(file_path.to_owned())),
        )
        .await
    }

    /// # Errors
    ///
    /// Refuses an empty filter, which would wipe the collection.
    pub async fn delete_by_filter(&self, collection: &str, filter: VectorFilter) -> Result<()> {
        validate_collection_name(collection)?;
        if filter.is_empty() {
            return Err(VectorStoreError::Validation(
                "refusing to delete with an empty filter".into(),
            ));
        }
        retry_with_backoff(&self.config.retry, "delete", || {
            self.store.delete_by_filter(collection, filter.clone())
        })
        .await
    }

    /// # Errors
    ///
    /// Returns a validation error for a bad name or the backend error after retries.
    pub async fn count(&self, collection: &str, filter: Option<VectorFilter>) -> Result<u64> {
        validate_collection_name(collection)?;
        retry_with_backoff(&self.config.retry, "count", || {
            self.store.count(collection, filter.clone())
        })
        .await
    }

    /// Cached liveness probe. `force` bypasses the cache.
    pub async fn health_check(&self, force: bool) -> bool {
        if !force && let Some(healthy) = self.cached_health() {
            return healthy;
        }
        self.health_report().await.healthy
    }

    /// Probe the backend now and refresh the cache.
    pub async fn health_report(&self) -> HealthReport {
        let started = Instant::now();
        let probe = self.store.health_check().await;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let report = match probe {
            Ok(()) => {
                let collections_count = self.store.list_collections().await.ok().map(|c| c.len());
                HealthReport {
                    healthy: true,
                    response_time_ms: elapsed,
                    checked_at: Utc::now(),
                    collections_count,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!("vector store health check failed: {e}");
                HealthReport {
                    healthy: false,
                    response_time_ms: elapsed,
                    checked_at: Utc::now(),
                    collections_count: None,
                    error: Some(e.to_string()),
                }
            }
        };

        if let Ok(mut slot) = self.health.write() {
            *slot = Some(CachedHealth {
                report: report.clone(),
                at: Instant::now(),
            });
        }
        report
    }

    fn cached_health(&self) -> Option<bool> {
        let ttl = Duration::from_secs(self.config.health_ttl_secs);
        let slot = self.health.read().ok()?;
        slot.as_ref()
            .filter(|c| c.at.elapsed() < ttl)
            .map(|c| c.report.healthy)
    }

    fn remember_dimension(&self, collection: &str, size: u64) {
        if let (Ok(mut dims), Ok(size)) = (self.dimensions.write(), usize::try_from(size)) {
            dims.insert(collection.to_owned(), size);
        }
    }

    async fn dimension_of(&self, collection: &str) -> Result<Option<usize>> {
        let cached = self
            .dimensions
            .read()
            .ok()
            .and_then(|d| d.get(collection).copied());
        if cached.is_some() {
            return Ok(cached);
        }
        let info = self.collection_info(collection).await?;
        Ok(info
            .and_then(|i| i.vector_size)
            .and_then(|s| usize::try_from(s).ok()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::in_memory_store::InMemoryVectorStore;
    use crate::vector_store::BoxFuture;

    /// Delegates to an in-memory store, failing the first `fail_first` calls of
    /// every operation with a connection error and counting traffic.
    struct FlakyStore {
        inner: InMemoryVectorStore,
        fail_first: usize,
        upserts: AtomicUsize,
        health_probes: AtomicUsize,
        failures_left: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fail_first: usize) -> Self {
            Self {
                inner: InMemoryVectorStore::new(),
                fail_first,
                upserts: AtomicUsize::new(0),
                health_probes: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(fail_first),
            }
        }

        fn trip(&self) -> Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(VectorStoreError::Connection("refused".into()));
            }
            Ok(())
        }

        fn reset(&self) {
            self.failures_left.store(self.fail_first, Ordering::SeqCst);
        }
    }

    impl VectorStore for FlakyStore {
        fn ensure_collection(
            &self,
            collection: &str,
            vector_size: u64,
            distance: Distance,
        ) -> BoxFuture<'_, Result<bool>> {
            self.inner.ensure_collection(collection, vector_size, distance)
        }

        fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool>> {
            self.inner.collection_exists(collection)
        }

        fn collection_info(&self, collection: &str) -> BoxFuture<'_, Result<Option<CollectionInfo>>> {
            self.inner.collection_info(collection)
        }

        fn list_collections(&self) -> BoxFuture<'_, Result<Vec<String>>> {
            self.inner.list_collections()
        }

        fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<()>> {
            self.inner.delete_collection(collection)
        }

        fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> BoxFuture<'_, Result<()>> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.trip() {
                return Box::pin(async move { Err(e) });
            }
            self.reset();
            self.inner.upsert(collection, points)
        }

        fn search(
            &self,
            collection: &str,
            vector: Vec<f32>,
            limit: u64,
            filter: Option<VectorFilter>,
        ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>>> {
            self.inner.search(collection, vector, limit, filter)
        }

        fn delete_by_filter(&self, collection: &str, filter: VectorFilter) -> BoxFuture<'_, Result<()>> {
            self.inner.delete_by_filter(collection, filter)
        }

        fn count(&self, collection: &str, filter: Option<VectorFilter>) -> BoxFuture<'_, Result<u64>> {
            self.inner.count(collection, filter)
        }

        fn health_check(&self) -> BoxFuture<'_, Result<()>> {
            self.health_probes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn point(id: &str, file: &str, vector: Vec<f32>) -> VectorPoint {
        VectorPoint {
            id: id.into(),
            vector,
            payload: HashMap::from([(FILE_PATH_FIELD.into(), serde_json::json!(file))]),
        }
    }

    fn client_with(store: Arc<dyn VectorStore>, batch_size: usize) -> VectorStoreClient {
        VectorStoreClient::new(
            store,
            VectorClientConfig {
                batch_size,
                ..VectorClientConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_default_collection() {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        let config = VectorClientConfig {
            collection: "Bad Name".into(),
            ..VectorClientConfig::default()
        };
        assert!(VectorStoreClient::new(store, config).is_err());
    }

    #[tokio::test]
    async fn ensure_collection_is_idempotent() {
        let client = client_with(Arc::new(InMemoryVectorStore::new()), 100);
        assert!(client.ensure_collection("code", 3, Distance::Cosine).await.unwrap());
        assert!(!client.ensure_collection("code", 3, Distance::Cosine).await.unwrap());
    }

    #[tokio::test]
    async fn ensure_collection_detects_dimension_change() {
        let client = client_with(Arc::new(InMemoryVectorStore::new()), 100);
        client.ensure_collection("code", 3, Distance::Cosine).await.unwrap();
        let err = client
            .ensure_collection("code", 8, Distance::Cosine)
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::Validation(_)));
    }

    #[tokio::test]
    async fn upsert_splits_into_batches() {
        let store = Arc::new(FlakyStore::new(0));
        let client = client_with(store.clone(), 2);
        client.ensure_collection("code", 2, Distance::Cosine).await.unwrap();
        let points = (0..5)
            .map(|i| point(&format!("p{i}"), "a.rs", vec![1.0, 0.0]))
            .collect();
        client.upsert_points("code", points).await.unwrap();
        assert_eq!(store.upserts.load(Ordering::SeqCst), 3);
        assert_eq!(client.count("code", None).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn invalid_points_never_reach_backend() {
        let store = Arc::new(FlakyStore::new(0));
        let client = client_with(store.clone(), 100);
        client.ensure_collection("code", 2, Distance::Cosine).await.unwrap();
        let err = client
            .upsert_points(
                "code",
                vec![
                    point("ok", "a.rs", vec![1.0, 0.0]),
                    point("bad", "a.rs", vec![f32::NAN, 0.0]),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::Validation(_)));
        assert_eq!(store.upserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected_locally() {
        let store = Arc::new(FlakyStore::new(0));
        let client = client_with(store.clone(), 100);
        client.ensure_collection("code", 2, Distance::Cosine).await.unwrap();
        let err = client
            .upsert_points("code", vec![point("a", "a.rs", vec![1.0, 0.0, 0.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, VectorStoreError::Validation(_)));
        assert_eq!(store.upserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_upsert_failures_are_retried() {
        let store = Arc::new(FlakyStore::new(2));
        let client = client_with(store.clone(), 100);
        client.ensure_collection("code", 2, Distance::Cosine).await.unwrap();
        client
            .upsert_points("code", vec![point("a", "a.rs", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(store.upserts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_surface_after_cap() {
        let store = Arc::new(FlakyStore::new(10));
        let client = client_with(store.clone(), 100);
        client.ensure_collection("code", 2, Distance::Cosine).await.unwrap();
        let err = client
            .upsert_points("code", vec![point("a", "a.rs", vec![1.0, 0.0])])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.upserts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn delete_by_file_path_removes_all_chunks() {
        let client = client_with(Arc::new(InMemoryVectorStore::new()), 100);
        client.ensure_collection("code", 2, Distance::Cosine).await.unwrap();
        client
            .upsert_points(
                "code",
                vec![
                    point("a0", "a.rs", vec![1.0, 0.0]),
                    point("a1", "a.rs", vec![0.9, 0.1]),
                    point("b0", "b.rs", vec![0.0, 1.0]),
                ],
            )
            .await
            .unwrap();
        client.delete_by_file_path("code", "a.rs").await.unwrap();
        let hits = client
            .search("code", vec![1.0, 0.0], 10, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].payload[FILE_PATH_FIELD], "b.rs");
    }

    #[tokio::test]
    async fn empty_delete_filter_is_refused() {
        let client = client_with(Arc::new(InMemoryVectorStore::new()), 100);
        assert!(client
            .delete_by_filter("code", VectorFilter::default())
            .await
            .is_err());
        assert!(client.delete_by_file_path("code", "  ").await.is_err());
    }

    #[tokio::test]
    async fn search_validates_query_vector() {
        let client = client_with(Arc::new(InMemoryVectorStore::new()), 100);
        client.ensure_collection("code", 2, Distance::Cosine).await.unwrap();
        assert!(client.search("code", vec![], 5, None).await.is_err());
        assert!(client.search("code", vec![1.0], 5, None).await.is_err());
        assert!(client.search("code", vec![1.0, 0.0], 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_is_cached_until_forced() {
        let store = Arc::new(FlakyStore::new(0));
        let client = client_with(store.clone(), 100);
        assert!(client.health_check(false).await);
        assert!(client.health_check(false).await);
        assert_eq!(store.health_probes.load(Ordering::SeqCst), 1);
        assert!(client.health_check(true).await);
        assert_eq!(store.health_probes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn health_report_counts_collections() {
        let client = client_with(Arc::new(InMemoryVectorStore::new()), 100);
        client.ensure_collection("code", 2, Distance::Cosine).await.unwrap();
        let report = client.health_report().await;
        assert!(report.healthy);
        assert_eq!(report.collections_count, Some(1));
        assert!(report.error.is_none());
    }
}
