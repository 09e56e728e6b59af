//! Vector store access for quarry.
//!
//! [`VectorStore`] is the backend seam (Qdrant or in-memory).
//! [`VectorStoreClient`] wraps a backend with local validation, request
//! batching, retry with exponential backoff and a cached health status.

pub mod client;
pub mod error;
pub mod in_memory_store;
pub mod qdrant_ops;
pub mod retry;
pub mod validation;
pub mod vector_store;

pub use client::{FILE_PATH_FIELD, HealthReport, VectorClientConfig, VectorStoreClient};
pub use error::VectorStoreError;
pub use in_memory_store::InMemoryVectorStore;
pub use qdrant_ops::QdrantOps;
pub use retry::RetryPolicy;
pub use vector_store::{
    CollectionInfo, Distance, FieldCondition, FieldValue, ScoredVectorPoint, VectorFilter,
    VectorPoint, VectorStore,
};
