//! Offline corpus builder.
//!
//! Reads a directory of source documents, splits them into overlapping
//! passages, optionally embeds them, and writes a JSONL corpus that
//! [`crate::corpus::JsonlCorpus`] can load.
//!
//! Supported inputs:
//! - `.txt` / `.md`: chunked by character windows
//! - `.jsonl`: one record per line; `text` (or `content`) is the passage,
//!   `id` is kept when present, other scalar fields become metadata

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use routeqa_core::error::StoreError;
use routeqa_core::{Embedder, Passage};
use tracing::{info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Split `text` into windows of at most `size` characters, each starting
/// `size - overlap` characters after the previous one. A window is pulled
/// back to the last whitespace in its second half so words stay whole.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let size = size.max(1);
    let overlap = overlap.min(size - 1);

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + size).min(chars.len());
        if end < chars.len() {
            let floor = start + size / 2;
            if let Some(ws) = (floor..end).rev().find(|&i| chars[i].is_whitespace()) {
                end = ws;
            }
        }

        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }
    chunks
}

/// Every supported file under `dir`, recursively, in path order.
fn collect_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current).map_err(|e| {
            StoreError::Storage(format!("Failed to read {}: {e}", current.display()))
        })?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if matches!(extension(&path).as_deref(), Some("txt" | "md" | "jsonl")) {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("doc")
        .to_string()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Turn every source file under `dir` into passages.
pub fn load_sources(dir: &Path, chunk_size: usize, overlap: usize) -> Result<Vec<Passage>, StoreError> {
    if !dir.is_dir() {
        return Err(StoreError::Storage(format!(
            "Input directory {} does not exist",
            dir.display()
        )));
    }

    let mut passages = Vec::new();
    for path in collect_files(dir)? {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| StoreError::Storage(format!("Failed to read {}: {e}", path.display())))?;
        let before = passages.len();
        match extension(&path).as_deref() {
            Some("jsonl") => passages.extend(records_to_passages(&path, &content)),
            _ => {
                let stem = stem(&path);
                let source = file_name(&path);
                for (i, chunk) in chunk_text(&content, chunk_size, overlap).into_iter().enumerate() {
                    passages.push(
                        Passage::new(format!("{stem}_{i}"), chunk)
                            .with_source(source.clone())
                            .with_metadata("chunk", i as u64),
                    );
                }
            }
        }
        info!(file = %path.display(), passages = passages.len() - before, "Source loaded");
    }
    Ok(passages)
}

fn records_to_passages(path: &Path, content: &str) -> Vec<Passage> {
    let stem = stem(path);
    let source = file_name(path);
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(n, line)| {
            let record = match serde_json::from_str::<serde_json::Value>(line) {
                Ok(serde_json::Value::Object(map)) => map,
                _ => {
                    warn!(file = %path.display(), line = n + 1, "Skipping record that is not a JSON object");
                    return None;
                }
            };
            let text = record
                .get("text")
                .or_else(|| record.get("content"))
                .and_then(|v| v.as_str())
                .filter(|t| !t.trim().is_empty());
            let Some(text) = text else {
                warn!(file = %path.display(), line = n + 1, "Skipping record without text");
                return None;
            };

            let id = match record.get("id") {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(serde_json::Value::Number(num)) => num.to_string(),
                _ => format!("{stem}_{n}"),
            };
            let mut passage = Passage::new(id, text).with_source(source.clone());
            for (key, value) in &record {
                if matches!(key.as_str(), "id" | "text" | "content") {
                    continue;
                }
                if value.is_string() || value.is_number() || value.is_boolean() {
                    passage.metadata.insert(key.clone(), value.clone());
                }
            }
            Some(passage)
        })
        .collect()
}

/// What a build did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub passages: usize,
    pub embedded: usize,
    pub failed_batches: usize,
}

/// Embeds passages in batches. A failed batch is logged and left without
/// embeddings; the build goes on and the corpus still supports keyword search.
pub struct IndexBuilder {
    embedder: Option<Arc<dyn Embedder>>,
    batch_size: usize,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self {
            embedder: None,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn embed_all(&self, passages: &mut [Passage]) -> IndexReport {
        let mut report = IndexReport {
            passages: passages.len(),
            ..IndexReport::default()
        };
        let Some(embedder) = &self.embedder else {
            return report;
        };

        for batch in passages.chunks_mut(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|p| p.content.clone()).collect();
            match embedder.embed(&texts).await {
                Ok(vectors) if vectors.len() == batch.len() => {
                    for (passage, vector) in batch.iter_mut().zip(vectors) {
                        passage.embedding = Some(vector);
                    }
                    report.embedded += batch.len();
                }
                Ok(vectors) => {
                    warn!(expected = batch.len(), got = vectors.len(), "Embedding count mismatch, batch skipped");
                    report.failed_batches += 1;
                }
                Err(e) => {
                    warn!(error = %e, first = %batch[0].id, "Embedding batch failed, continuing without it");
                    report.failed_batches += 1;
                }
            }
        }
        report
    }
}

impl Default for IndexBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Write passages as JSONL. An existing file is only replaced with `force`.
pub fn write_corpus(path: &Path, passages: &[Passage], force: bool) -> Result<(), StoreError> {
    if path.exists() && !force {
        return Err(StoreError::Storage(format!(
            "{} already exists (use --force to rebuild)",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Storage(format!("Failed to create {}: {e}", parent.display())))?;
    }

    let tmp = path.with_extension("jsonl.tmp");
    let mut file = std::io::BufWriter::new(
        std::fs::File::create(&tmp)
            .map_err(|e| StoreError::Storage(format!("Failed to create {}: {e}", tmp.display())))?,
    );
    for passage in passages {
        let line = serde_json::to_string(passage)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize passage: {e}")))?;
        writeln!(file, "{line}").map_err(|e| StoreError::Storage(format!("Write failed: {e}")))?;
    }
    file.flush()
        .map_err(|e| StoreError::Storage(format!("Write failed: {e}")))?;
    drop(file);

    std::fs::rename(&tmp, path)
        .map_err(|e| StoreError::Storage(format!("Failed to replace {}: {e}", path.display())))?;
    info!(path = %path.display(), passages = passages.len(), "Corpus written");
    Ok(())
}
