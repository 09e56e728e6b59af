mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{HashingEmbedder, PARSER_TS, RENDER_TS, Workspace};
use quarry_index::{IndexerConfig, QueryEngine, SearchConfig, SearchQuery};

fn seed(ws: &Workspace) {
    ws.write("src/parser.ts", PARSER_TS);
    ws.write("src/render.ts", RENDER_TS);
    ws.write(
        "tools/build.py",
        "import os\n\n\ndef build(target):\n    return os.path.join('out', target)\n\n\nclass Builder:\n    def run(self):\n        return build('all')\n",
    );
    ws.write("docs/notes.md", "# Notes\n\nParsing config happens at startup.\n");
}

#[tokio::test]
async fn point_count_per_file_matches_chunk_count() {
    let ws = Workspace::new().await;
    seed(&ws);
    let report = ws
        .orchestrator(IndexerConfig::default())
        .start_indexing()
        .await
        .unwrap();

    let mut total = 0;
    for path in ws.metadata.indexed_paths().await.unwrap() {
        let record = ws.metadata.get_file(&path).await.unwrap().unwrap();
        assert_eq!(ws.points_for(&path).await, record.chunk_count as u64, "{path}");
        total += record.chunk_count;
    }
    assert_eq!(total, report.stats.total_chunks);
    assert_eq!(ws.total_points().await, total as u64);
}

#[tokio::test]
async fn reindexing_unchanged_tree_is_idempotent() {
    let ws = Workspace::new().await;
    seed(&ws);
    let orch = ws.orchestrator(IndexerConfig::default());
    orch.start_indexing().await.unwrap();
    let points = ws.total_points().await;
    let hashes = ws.metadata.file_hashes().await.unwrap();

    let second = orch.start_indexing().await.unwrap();
    assert_eq!(second.stats.files_unchanged, 4);
    assert_eq!(ws.total_points().await, points);
    assert_eq!(ws.metadata.file_hashes().await.unwrap(), hashes);
}

#[tokio::test]
async fn edited_file_replaces_its_points() {
    let ws = Workspace::new().await;
    seed(&ws);
    let orch = ws.orchestrator(IndexerConfig::default());
    orch.start_indexing().await.unwrap();

    ws.write("src/render.ts", "export const tiny = 1;\n");
    let stored = orch
        .update_file_in_index(&ws.root().join("src/render.ts"))
        .await
        .unwrap();
    assert_eq!(ws.points_for("src/render.ts").await, stored as u64);
}

#[tokio::test]
async fn search_never_returns_a_file_twice() {
    let ws = Workspace::new().await;
    seed(&ws);
    ws.orchestrator(IndexerConfig::default())
        .start_indexing()
        .await
        .unwrap();
    let engine = QueryEngine::new(
        Arc::new(HashingEmbedder),
        Arc::clone(&ws.store),
        SearchConfig::default(),
    );
    for text in ["parse config", "render widget", "build target", "notes startup"] {
        let response = engine.search(&SearchQuery::new(text)).await.unwrap();
        let mut seen = HashSet::new();
        for r in &response.results {
            assert!(seen.insert(r.chunk.file_path.clone()), "{text}: {}", r.chunk.file_path);
        }
    }
}
