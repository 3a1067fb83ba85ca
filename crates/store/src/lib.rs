//! Persistence and retrieval backends for routeqa.
//!
//! - Thread state: in-memory, JSON files, SQLite
//! - Document corpora: JSONL passages with keyword or hybrid search
//! - Index building: chunking, batched embedding, corpus output

pub mod corpus;
pub mod embedder;
pub mod file_backend;
pub mod in_memory;
pub mod index;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use corpus::JsonlCorpus;
pub use embedder::{ProviderEmbedder, RetryPolicy};
pub use file_backend::FileStateStore;
pub use in_memory::InMemoryStateStore;
pub use index::{IndexBuilder, IndexReport, chunk_text, load_sources, write_corpus};
pub use vector::{cosine_similarity, reciprocal_rank_fusion};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStateStore;
