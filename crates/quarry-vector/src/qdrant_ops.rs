//! Qdrant backend for [`VectorStore`].

use std::collections::HashMap;
use std::time::Duration;

use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, FieldType, Filter, PointStruct, Range, ScoredPoint, SearchPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder, value::Kind, vectors_config,
};
use qdrant_client::{Qdrant, QdrantError};

use crate::error::VectorStoreError;
use crate::vector_store::{
    BoxFuture, CollectionInfo, Distance, FieldCondition, FieldValue, ScoredVectorPoint,
    VectorFilter, VectorPoint, VectorStore,
};

type QdrantResult<T> = Result<T, Box<QdrantError>>;

const GRPC_DEADLINE_EXCEEDED: i32 = 4;
const GRPC_RESOURCE_EXHAUSTED: i32 = 8;
const GRPC_ABORTED: i32 = 10;
const GRPC_UNAVAILABLE: i32 = 14;

/// Payload fields that get a keyword index on collection creation.
const KEYWORD_INDEXES: &[&str] = &["file_path", "language", "extension", "chunk_kind"];
/// Payload fields that get an integer index on collection creation.
const INTEGER_INDEXES: &[&str] = &["modified_at", "indexed_at"];

/// Thin wrapper over [`Qdrant`] client encapsulating collection operations.
#[derive(Clone)]
pub struct QdrantOps {
    client: Qdrant,
}

impl std::fmt::Debug for QdrantOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QdrantOps").finish_non_exhaustive()
    }
}

impl QdrantOps {
    /// Create a new `QdrantOps` connected to the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the Qdrant client cannot be created.
    pub fn new(url: &str, api_key: Option<String>, timeout: Duration) -> QdrantResult<Self> {
        let client = Qdrant::from_url(url)
            .api_key(api_key)
            .timeout(timeout)
            .build()
            .map_err(Box::new)?;
        Ok(Self { client })
    }

    /// Create the collection with payload indexes unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if Qdrant cannot be reached or collection creation fails.
    pub async fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
        distance: Distance,
    ) -> QdrantResult<bool> {
        if self
            .client
            .collection_exists(collection)
            .await
            .map_err(Box::new)?
        {
            return Ok(false);
        }
        self.client
            .create_collection(
                CreateCollectionBuilder::new(collection)
                    .vectors_config(VectorParamsBuilder::new(vector_size, to_qdrant_distance(distance))),
            )
            .await
            .map_err(Box::new)?;

        for field in KEYWORD_INDEXES {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    collection,
                    *field,
                    FieldType::Keyword,
                ))
                .await
                .map_err(Box::new)?;
        }
        for field in INTEGER_INDEXES {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    collection,
                    *field,
                    FieldType::Integer,
                ))
                .await
                .map_err(Box::new)?;
        }
        tracing::info!(collection, vector_size, "created collection");
        Ok(true)
    }

    /// # Errors
    ///
    /// Returns an error if Qdrant cannot be reached.
    pub async fn collection_exists(&self, collection: &str) -> QdrantResult<bool> {
        self.client
            .collection_exists(collection)
            .await
            .map_err(Box::new)
    }

    /// Describe a collection, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if Qdrant cannot be reached.
    pub async fn collection_info(&self, collection: &str) -> QdrantResult<Option<CollectionInfo>> {
        if !self.collection_exists(collection).await? {
            return Ok(None);
        }
        let response = self
            .client
            .collection_info(collection)
            .await
            .map_err(Box::new)?;
        let Some(info) = response.result else {
            return Ok(None);
        };

        let params = info
            .config
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|vc| vc.config);
        let (vector_size, distance) = match params {
            Some(vectors_config::Config::Params(p)) => (Some(p.size), from_qdrant_distance(p.distance)),
            _ => (None, None),
        };

        Ok(Some(CollectionInfo {
            name: collection.to_owned(),
            vector_size,
            distance,
            points_count: info.points_count.unwrap_or(0),
        }))
    }

    /// # Errors
    ///
    /// Returns an error if Qdrant cannot be reached.
    pub async fn list_collections(&self) -> QdrantResult<Vec<String>> {
        let response = self.client.list_collections().await.map_err(Box::new)?;
        Ok(response.collections.into_iter().map(|c| c.name).collect())
    }

    /// # Errors
    ///
    /// Returns an error if the collection cannot be deleted.
    pub async fn delete_collection(&self, collection: &str) -> QdrantResult<()> {
        self.client
            .delete_collection(collection)
            .await
            .map_err(Box::new)?;
        Ok(())
    }

    /// Upsert points and wait until they are searchable.
    ///
    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub async fn upsert(&self, collection: &str, points: Vec<PointStruct>) -> QdrantResult<()> {
        self.client
            .upsert_points(UpsertPointsBuilder::new(collection, points).wait(true))
            .await
            .map_err(Box::new)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the search fails.
    pub async fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<Filter>,
    ) -> QdrantResult<Vec<ScoredPoint>> {
        let mut builder = SearchPointsBuilder::new(collection, vector, limit).with_payload(true);
        if let Some(f) = filter {
            builder = builder.filter(f);
        }
        let results = self.client.search_points(builder).await.map_err(Box::new)?;
        Ok(results.result)
    }

    /// Delete every point matching `filter`, waiting for completion.
    ///
    /// # Errors
    ///
    /// Returns an error if the deletion fails.
    pub async fn delete_by_filter(&self, collection: &str, filter: Filter) -> QdrantResult<()> {
        self.client
            .delete_points(DeletePointsBuilder::new(collection).points(filter).wait(true))
            .await
            .map_err(Box::new)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the count request fails.
    pub async fn count(&self, collection: &str, filter: Option<Filter>) -> QdrantResult<u64> {
        let mut builder = CountPointsBuilder::new(collection).exact(true);
        if let Some(f) = filter {
            builder = builder.filter(f);
        }
        let response = self.client.count(builder).await.map_err(Box::new)?;
        Ok(response.result.map_or(0, |r| r.count))
    }

    /// # Errors
    ///
    /// Returns an error if Qdrant does not answer the health probe.
    pub async fn health_check(&self) -> QdrantResult<()> {
        self.client.health_check().await.map_err(Box::new)?;
        Ok(())
    }

    /// Convert a JSON payload map to a Qdrant payload map.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if deserialization fails.
    pub fn json_to_payload(
        payload: HashMap<String, serde_json::Value>,
    ) -> Result<HashMap<String, qdrant_client::qdrant::Value>, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(payload.into_iter().collect()))
    }
}

impl VectorStore for QdrantOps {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
        distance: Distance,
    ) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.ensure_collection(&collection, vector_size, distance)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Collection))
        })
    }

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.collection_exists(&collection)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Collection))
        })
    }

    fn collection_info(
        &self,
        collection: &str,
    ) -> BoxFuture<'_, Result<Option<CollectionInfo>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.collection_info(&collection)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Collection))
        })
    }

    fn list_collections(&self) -> BoxFuture<'_, Result<Vec<String>, VectorStoreError>> {
        Box::pin(async move {
            self.list_collections()
                .await
                .map_err(|e| classify(&e, VectorStoreError::Collection))
        })
    }

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.delete_collection(&collection)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Collection))
        })
    }

    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let qdrant_points = points
                .into_iter()
                .map(|p| {
                    let payload = Self::json_to_payload(p.payload)
                        .map_err(|e| VectorStoreError::Serialization(e.to_string()))?;
                    Ok(PointStruct::new(p.id, p.vector, payload))
                })
                .collect::<Result<Vec<_>, VectorStoreError>>()?;
            self.upsert(&collection, qdrant_points)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Upsert))
        })
    }

    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            let qdrant_filter = filter.map(vector_filter_to_qdrant);
            let results = self
                .search(&collection, vector, limit, qdrant_filter)
                .await
                .map_err(|e| classify(&e, VectorStoreError::Search))?;
            Ok(results.into_iter().map(scored_point_to_vector).collect())
        })
    }

    fn delete_by_filter(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.delete_by_filter(&collection, vector_filter_to_qdrant(filter))
                .await
                .map_err(|e| classify(&e, VectorStoreError::Delete))
        })
    }

    fn count(
        &self,
        collection: &str,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<u64, VectorStoreError>> {
        let collection = collection.to_owned();
        Box::pin(async move {
            self.count(&collection, filter.map(vector_filter_to_qdrant))
                .await
                .map_err(|e| classify(&e, VectorStoreError::Search))
        })
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), VectorStoreError>> {
        Box::pin(async move {
            self.health_check()
                .await
                .map_err(|e| classify(&e, VectorStoreError::Connection))
        })
    }
}

/// Map a Qdrant error onto the retryable/non-retryable taxonomy.
///
/// `fallback` builds the error used for backend rejections.
fn classify(err: &QdrantError, fallback: fn(String) -> VectorStoreError) -> VectorStoreError {
    let msg = err.to_string();
    match err {
        QdrantError::ResponseError { status, .. } => match status.code() as i32 {
            GRPC_DEADLINE_EXCEEDED => VectorStoreError::Timeout(msg),
            GRPC_RESOURCE_EXHAUSTED | GRPC_ABORTED | GRPC_UNAVAILABLE => {
                VectorStoreError::Connection(msg)
            }
            _ => fallback(msg),
        },
        QdrantError::ResourceExhaustedError { .. } | QdrantError::Io(_) => {
            VectorStoreError::Connection(msg)
        }
        _ => fallback(msg),
    }
}

fn to_qdrant_distance(distance: Distance) -> qdrant_client::qdrant::Distance {
    match distance {
        Distance::Cosine => qdrant_client::qdrant::Distance::Cosine,
        Distance::Euclid => qdrant_client::qdrant::Distance::Euclid,
        Distance::Dot => qdrant_client::qdrant::Distance::Dot,
    }
}

fn from_qdrant_distance(raw: i32) -> Option<Distance> {
    match qdrant_client::qdrant::Distance::try_from(raw).ok()? {
        qdrant_client::qdrant::Distance::Cosine => Some(Distance::Cosine),
        qdrant_client::qdrant::Distance::Euclid => Some(Distance::Euclid),
        qdrant_client::qdrant::Distance::Dot => Some(Distance::Dot),
        _ => None,
    }
}

fn vector_filter_to_qdrant(filter: VectorFilter) -> Filter {
    let mut f = Filter::default();
    f.must = filter.must.into_iter().map(field_condition_to_qdrant).collect();
    f.must_not = filter
        .must_not
        .into_iter()
        .map(field_condition_to_qdrant)
        .collect();
    f
}

fn field_condition_to_qdrant(cond: FieldCondition) -> Condition {
    match cond.value {
        FieldValue::Integer(v) => Condition::matches(cond.field, v),
        FieldValue::Text(v) => Condition::matches(cond.field, v),
        FieldValue::AnyText(values) => Condition::matches(cond.field, values),
        FieldValue::Range { gte, lte } => Condition::range(
            cond.field,
            Range {
                gte,
                lte,
                ..Range::default()
            },
        ),
    }
}

fn scored_point_to_vector(point: ScoredPoint) -> ScoredVectorPoint {
    let payload: HashMap<String, serde_json::Value> = point
        .payload
        .into_iter()
        .filter_map(|(k, v)| {
            let json_val = match v.kind? {
                Kind::StringValue(s) => serde_json::Value::String(s),
                Kind::IntegerValue(i) => serde_json::Value::Number(i.into()),
                Kind::DoubleValue(d) => {
                    serde_json::Number::from_f64(d).map(serde_json::Value::Number)?
                }
                Kind::BoolValue(b) => serde_json::Value::Bool(b),
                _ => return None,
            };
            Some((k, json_val))
        })
        .collect();

    let id = match point.id.and_then(|pid| pid.point_id_options) {
        Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(u)) => u,
        Some(qdrant_client::qdrant::point_id::PointIdOptions::Num(n)) => n.to_string(),
        None => String::new(),
    };

    ScoredVectorPoint {
        id,
        score: point.score,
        payload,
    }
}
