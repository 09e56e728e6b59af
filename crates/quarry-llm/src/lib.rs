//! Provider abstraction for embeddings and text completion.
//!
//! The indexing pipeline only needs `embed_batch`; query expansion and
//! re-ranking use `chat`. Backends: Ollama and any OpenAI-compatible API.

pub mod any;
pub mod error;
pub mod http;
#[cfg(feature = "mock")]
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;
pub(crate) mod retry;

pub use error::LlmError;
pub use provider::LlmProvider;
