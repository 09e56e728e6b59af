#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use quarry_index::{IndexOrchestrator, IndexerConfig, MetadataStore};
use quarry_llm::LlmError;
use quarry_llm::LlmProvider;
use quarry_llm::provider::Message;
use quarry_vector::{InMemoryVectorStore, VectorClientConfig, VectorStoreClient};

pub const DIMENSIONS: usize = 256;

/// Bag-of-words embedder: each lowercase alphanumeric token hashes into one
/// of [`DIMENSIONS`] buckets, and the result is L2-normalized. Texts sharing
/// tokens get positive cosine similarity, disjoint texts get (almost) zero.
#[derive(Debug, Clone, Default)]
pub struct HashingEmbedder;

impl HashingEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMENSIONS];
        for token in text
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_ascii_lowercase();
            v[fnv1a(token.as_bytes()) % DIMENSIONS] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            v[0] = 1.0;
        } else {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    usize::try_from(hash % DIMENSIONS as u64).unwrap()
}

impl LlmProvider for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn chat(&self, _messages: &[Message]) -> Result<String, LlmError> {
        Err(LlmError::Unavailable)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        Ok(Self::vector(text))
    }

    fn supports_embeddings(&self) -> bool {
        true
    }
}

pub struct Workspace {
    pub dir: tempfile::TempDir,
    pub store: Arc<VectorStoreClient>,
    pub metadata: MetadataStore,
}

impl Workspace {
    pub async fn new() -> Self {
        let store = VectorStoreClient::new(
            Arc::new(InMemoryVectorStore::new()),
            VectorClientConfig::default(),
        )
        .unwrap();
        Self {
            dir: tempfile::tempdir().unwrap(),
            store: Arc::new(store),
            metadata: MetadataStore::in_memory().await.unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    pub fn orchestrator(&self, config: IndexerConfig) -> IndexOrchestrator<HashingEmbedder> {
        IndexOrchestrator::new(
            self.dir.path(),
            Arc::new(HashingEmbedder),
            Arc::clone(&self.store),
            self.metadata.clone(),
            config,
        )
    }

    pub async fn points_for(&self, rel: &str) -> u64 {
        self.store
            .count(
                self.store.collection(),
                Some(quarry_vector::VectorFilter::must(
                    quarry_vector::FILE_PATH_FIELD,
                    quarry_vector::FieldValue::Text(rel.into()),
                )),
            )
            .await
            .unwrap()
    }

    pub async fn total_points(&self) -> u64 {
        self.store.count(self.store.collection(), None).await.unwrap()
    }
}

pub const PARSER_TS: &str = r"import { readFileSync } from 'fs';

export interface Config {
  name: string;
  port: number;
}

/** Parse the config file at `path`. */
export function parseConfig(path: string): Config {
  const raw = readFileSync(path, 'utf8');
  return JSON.parse(raw) as Config;
}

export function validateConfig(config: Config): boolean {
  return config.port > 0 && config.name.length > 0;
}
";

pub const RENDER_TS: &str = r"export class WidgetRenderer {
  private count = 0;

  render(widget: string): string {
    this.count += 1;
    return `<div>${widget}</div>`;
  }

  reset(): void {
    this.count = 0;
  }
}
";

/// Roughly `target` bytes of TypeScript-looking lines.
pub fn oversized_source(target: usize) -> String {
    let mut out = String::with_capacity(target + 64);
    let mut i = 0usize;
    while out.len() < target {
        out.push_str(&format!("const generatedValue{i} = {i} * 2; // padding line\n"));
        i += 1;
    }
    out
}
