//! Requires docker: `cargo test -p quarry-vector -- --ignored`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use quarry_vector::{
    Distance, FieldValue, QdrantOps, VectorClientConfig, VectorFilter, VectorPoint,
    VectorStoreClient,
};
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};

const QDRANT_GRPC_PORT: ContainerPort = ContainerPort::Tcp(6334);

fn qdrant_image() -> GenericImage {
    GenericImage::new("qdrant/qdrant", "v1.16.0")
        .with_wait_for(WaitFor::message_on_stdout("gRPC listening"))
        .with_exposed_port(QDRANT_GRPC_PORT)
}

async fn setup() -> (VectorStoreClient, ContainerAsync<GenericImage>) {
    let container = qdrant_image().start().await.unwrap();
    let grpc_port = container.get_host_port_ipv4(6334).await.unwrap();
    let url = format!("http://127.0.0.1:{grpc_port}");
    let ops = QdrantOps::new(&url, None, Duration::from_secs(10)).unwrap();
    let client = VectorStoreClient::new(Arc::new(ops), VectorClientConfig::default()).unwrap();
    (client, container)
}

fn point(file: &str, language: &str, vector: Vec<f32>) -> VectorPoint {
    VectorPoint {
        id: uuid::Uuid::new_v4().to_string(),
        vector,
        payload: HashMap::from([
            ("file_path".into(), serde_json::json!(file)),
            ("language".into(), serde_json::json!(language)),
            ("modified_at".into(), serde_json::json!(1_700_000_000)),
        ]),
    }
}

#[tokio::test]
#[ignore = "requires docker"]
async fn ensure_collection_is_idempotent() {
    let (client, _container) = setup().await;
    assert!(client.ensure_collection("code", 4, Distance::Cosine).await.unwrap());
    assert!(!client.ensure_collection("code", 4, Distance::Cosine).await.unwrap());

    let info = client.collection_info("code").await.unwrap().unwrap();
    assert_eq!(info.vector_size, Some(4));
    assert_eq!(info.distance, Some(Distance::Cosine));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn upsert_search_and_delete_by_file() {
    let (client, _container) = setup().await;
    client.ensure_collection("code", 4, Distance::Cosine).await.unwrap();
    client
        .upsert_points(
            "code",
            vec![
                point("src/a.rs", "rust", vec![1.0, 0.0, 0.0, 0.0]),
                point("src/a.rs", "rust", vec![0.9, 0.1, 0.0, 0.0]),
                point("src/b.py", "python", vec![0.0, 1.0, 0.0, 0.0]),
            ],
        )
        .await
        .unwrap();
    assert_eq!(client.count("code", None).await.unwrap(), 3);

    let filter = VectorFilter::must("language", FieldValue::AnyText(vec!["python".into()]));
    let hits = client
        .search("code", vec![1.0, 0.0, 0.0, 0.0], 10, Some(filter))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].payload["file_path"], "src/b.py");

    client.delete_by_file_path("code", "src/a.rs").await.unwrap();
    assert_eq!(client.count("code", None).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn health_report_sees_collections() {
    let (client, _container) = setup().await;
    client.ensure_collection("code", 4, Distance::Cosine).await.unwrap();
    let report = client.health_report().await;
    assert!(report.healthy);
    assert_eq!(report.collections_count, Some(1));
}
