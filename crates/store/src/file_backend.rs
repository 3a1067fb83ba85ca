//! File-based state store: one pretty-printed JSON document per thread.
//!
//! Layout: `<dir>/<percent-encoded thread id>.json`. The original id is kept
//! inside the document so listing does not depend on the file name, and a
//! load only accepts a document whose stored id matches.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use routeqa_core::error::StoreError;
use routeqa_core::{ConversationState, StateStore, ThreadId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Serialize, Deserialize)]
struct ThreadDocument {
    thread_id: ThreadId,
    state: ConversationState,
}

/// Persists each thread as `<dir>/<id>.json`.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Store threads under `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, thread: &ThreadId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(thread.as_str())))
    }
}

/// Map a thread id onto a file stem. Distinct ids never share a stem.
fn file_stem(id: &str) -> String {
    // The encoder never emits a bare `%`, so the empty id cannot collide.
    if id.is_empty() {
        return "%".into();
    }
    urlencoding::encode(id).into_owned()
}

#[async_trait]
impl StateStore for FileStateStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self, thread: &ThreadId) -> Result<Option<ConversationState>, StoreError> {
        let path = self.path_for(thread);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Storage(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let doc: ThreadDocument = serde_json::from_str(&content).map_err(|e| {
            StoreError::Storage(format!("Corrupted thread file {}: {e}", path.display()))
        })?;
        if doc.thread_id != *thread {
            warn!(
                thread = %thread,
                stored = %doc.thread_id,
                path = %path.display(),
                "Thread file belongs to another thread"
            );
            return Ok(None);
        }
        debug!(thread = %thread, messages = doc.state.len(), "Loaded thread from file");
        Ok(Some(doc.state))
    }

    async fn save(&self, thread: &ThreadId, state: &ConversationState) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            StoreError::Storage(format!("Failed to create {}: {e}", self.dir.display()))
        })?;

        let doc = ThreadDocument {
            thread_id: thread.clone(),
            state: state.clone(),
        };
        let json = serde_json::to_string_pretty(&doc)
            .map_err(|e| StoreError::Storage(format!("Failed to serialize thread: {e}")))?;

        // Write-then-rename so a crash never leaves a half-written thread.
        let path = self.path_for(thread);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to replace {}: {e}", path.display())))?;
        Ok(())
    }

    async fn delete(&self, thread: &ThreadId) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.path_for(thread)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Storage(format!("Failed to delete thread: {e}"))),
        }
    }

    async fn list_threads(&self) -> Result<Vec<ThreadId>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Storage(format!("Failed to list threads: {e}"))),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to list threads: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read_to_string(&path)
                .await
                .ok()
                .and_then(|c| serde_json::from_str::<ThreadDocument>(&c).ok());
            match parsed {
                Some(doc) => ids.push(doc.thread_id),
                None => warn!(path = %path.display(), "Skipping unreadable thread file"),
            }
        }
        ids.sort();
        Ok(ids)
    }
}
