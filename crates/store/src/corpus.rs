//! JSONL passage corpora with keyword and hybrid search.
//!
//! A corpus file holds one serialized [`Passage`] per line, as written by
//! [`crate::index::write_corpus`]. The whole corpus is loaded into memory;
//! corpora here are product brochures and feedback exports, not web crawls.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use routeqa_core::error::StoreError;
use routeqa_core::{DocumentStore, Embedder, Passage, SearchMode};
use tracing::{debug, info, warn};

use crate::vector::{RRF_K, rank_by_similarity, reciprocal_rank_fusion, sort_by_score};

/// Lowercased alphanumeric terms of at least two characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .collect()
}

struct Indexed {
    passage: Passage,
    term_counts: HashMap<String, u32>,
    length: usize,
}

/// An in-memory corpus searched by term frequency, optionally fused with
/// embedding similarity.
pub struct JsonlCorpus {
    name: String,
    entries: Vec<Indexed>,
    mode: SearchMode,
    embedder: Option<Arc<dyn Embedder>>,
}

impl JsonlCorpus {
    /// Build a corpus from passages already in memory.
    pub fn from_passages(name: impl Into<String>, passages: Vec<Passage>) -> Self {
        let entries = passages
            .into_iter()
            .map(|passage| {
                let tokens = tokenize(&passage.content);
                let mut term_counts = HashMap::new();
                for t in &tokens {
                    *term_counts.entry(t.clone()).or_insert(0) += 1;
                }
                Indexed {
                    passage,
                    term_counts,
                    length: tokens.len(),
                }
            })
            .collect();

        Self {
            name: name.into(),
            entries,
            mode: SearchMode::Keyword,
            embedder: None,
        }
    }

    /// Load a corpus file. Unparseable lines are skipped with a warning.
    pub fn load(name: impl Into<String>, path: &Path) -> Result<Self, StoreError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::CorpusMissing(path.display().to_string()));
            }
            Err(e) => {
                return Err(StoreError::Storage(format!(
                    "Failed to read corpus {}: {e}",
                    path.display()
                )));
            }
        };

        let passages: Vec<Passage> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str::<Passage>(line) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(path = %path.display(), line = n + 1, error = %e, "Skipping corrupted passage");
                    None
                }
            })
            .collect();

        let corpus = Self::from_passages(name, passages);
        info!(
            corpus = %corpus.name,
            passages = corpus.len(),
            embedded = corpus.embedded_count(),
            "Corpus loaded"
        );
        Ok(corpus)
    }

    /// Select the ranking mode. Hybrid needs an embedder to take effect.
    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn mode(&self) -> SearchMode {
        self.mode
    }

    /// Passages that carry a precomputed embedding.
    pub fn embedded_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.passage.embedding.is_some())
            .count()
    }

    /// Rank by summed term frequency, damped by passage length. Passages
    /// sharing no term with the query are left out.
    pub fn keyword_search(&self, query: &str, k: usize) -> Vec<Passage> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<Passage> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let tf: u32 = terms
                    .iter()
                    .map(|t| entry.term_counts.get(t).copied().unwrap_or(0))
                    .sum();
                if tf == 0 {
                    return None;
                }
                let mut p = entry.passage.clone();
                p.score = tf as f32 / (entry.length.max(1) as f32).sqrt();
                Some(p)
            })
            .collect();

        sort_by_score(&mut hits);
        hits.truncate(k);
        hits
    }

    async fn hybrid_search(&self, embedder: &dyn Embedder, query: &str, k: usize) -> Vec<Passage> {
        // Widen both candidate pools so fusion has something to reorder.
        let pool = k.saturating_mul(4).max(k);
        let keyword = self.keyword_search(query, pool);

        let query_embedding = match embedder.embed(&[query.to_string()]).await {
            Ok(mut v) if !v.is_empty() => v.swap_remove(0),
            Ok(_) => return truncate(keyword, k),
            Err(e) => {
                warn!(corpus = %self.name, error = %e, "Query embedding failed, using keyword ranking");
                return truncate(keyword, k);
            }
        };

        let passages: Vec<Passage> = self.entries.iter().map(|e| e.passage.clone()).collect();
        let semantic = rank_by_similarity(&passages, &query_embedding, pool);
        reciprocal_rank_fusion(&[keyword, semantic], RRF_K, k)
    }
}

fn truncate(mut passages: Vec<Passage>, k: usize) -> Vec<Passage> {
    passages.truncate(k);
    passages
}

#[async_trait]
impl DocumentStore for JsonlCorpus {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>, StoreError> {
        let results = match (&self.mode, &self.embedder) {
            (SearchMode::Hybrid, Some(embedder)) => self.hybrid_search(embedder.as_ref(), query, k).await,
            _ => self.keyword_search(query, k),
        };
        debug!(corpus = %self.name, query, hits = results.len(), "Corpus searched");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback_corpus() -> JsonlCorpus {
        JsonlCorpus::from_passages(
            "feedback",
            vec![
                Passage::new("f1", "Range drops sharply in winter, charging takes forever.")
                    .with_metadata("sentiment", "negative"),
                Passage::new("f2", "Love the interior, the seats are very comfortable.")
                    .with_metadata("sentiment", "positive"),
                Passage::new("f3", "Winter range is fine for my commute. Range range range.")
                    .with_metadata("sentiment", "positive"),
                Passage::new("f4", "The infotainment screen froze twice."),
            ],
        )
    }

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
            Ok(texts
                .iter()
                .map(|t| if t.contains("screen") { vec![0.0, 1.0] } else { vec![1.0, 0.0] })
                .collect())
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, StoreError> {
            Err(StoreError::EmbeddingFailed("quota exhausted".into()))
        }
    }

    #[test]
    fn tokenize_lowercases_and_drops_short_terms() {
        assert_eq!(tokenize("BMW iX: a 5-star EV!"), vec!["bmw", "ix", "star", "ev"]);
    }

    #[tokio::test]
    async fn keyword_ranks_by_term_frequency() {
        let corpus = feedback_corpus();
        let hits = corpus.search("winter range", 5).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids[0], "f3");
        assert!(ids.contains(&"f1"));
        assert!(!ids.contains(&"f2"));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn no_overlap_returns_nothing() {
        let corpus = feedback_corpus();
        assert!(corpus.search("towing capacity", 5).await.unwrap().is_empty());
        assert!(corpus.search("?!", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn hybrid_fuses_semantic_hits() {
        let mut passages = vec![
            Passage::new("a", "battery and range details"),
            Passage::new("b", "display and screen details"),
        ];
        passages[0].embedding = Some(vec![1.0, 0.0]);
        passages[1].embedding = Some(vec![0.0, 1.0]);
        let corpus = JsonlCorpus::from_passages("product", passages)
            .with_mode(SearchMode::Hybrid)
            .with_embedder(Arc::new(AxisEmbedder));

        let hits = corpus.search("screen", 1).await.unwrap();
        assert_eq!(hits[0].id, "b");
    }

    #[tokio::test]
    async fn hybrid_falls_back_to_keyword_when_embedding_fails() {
        let corpus = feedback_corpus()
            .with_mode(SearchMode::Hybrid)
            .with_embedder(Arc::new(FailingEmbedder));
        let hits = corpus.search("infotainment", 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "f4");
    }

    #[test]
    fn load_skips_bad_lines_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("product.jsonl");
        let good = serde_json::to_string(&Passage::new("p1", "Max range 630 km")).unwrap();
        std::fs::write(&path, format!("{good}\n{{broken\n\n")).unwrap();

        let corpus = JsonlCorpus::load("product", &path).unwrap();
        assert_eq!(corpus.len(), 1);

        let err = JsonlCorpus::load("product", &dir.path().join("nope.jsonl"))
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::CorpusMissing(_)));
    }
}
