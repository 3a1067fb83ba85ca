//! Document-retrieval abstractions.
//!
//! A [`DocumentStore`] answers "the k most relevant passages for this query".
//! How the index was built is not its concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::StoreError;

/// A retrievable chunk of a source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    /// Unique ID within its corpus
    pub id: String,

    /// The passage text
    pub content: String,

    /// Where it came from (file name, page, row)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Free-form attributes (user id, sentiment, page number, ...)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Relevance score (set by search operations)
    #[serde(default, skip_serializing)]
    pub score: f32,

    /// Optional precomputed embedding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Passage {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            source: None,
            metadata: serde_json::Map::new(),
            score: 0.0,
            embedding: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// How a corpus ranks passages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Term-frequency keyword matching only
    #[default]
    Keyword,
    /// Keyword and embedding similarity fused together
    Hybrid,
}

/// Given a query, return the k most relevant passages.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Corpus name (e.g., "product", "feedback").
    fn name(&self) -> &str;

    /// Number of passages in the corpus.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-`k` passages, best first.
    async fn search(&self, query: &str, k: usize) -> std::result::Result<Vec<Passage>, StoreError>;
}

/// Turns text into embedding vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, StoreError>;
}
