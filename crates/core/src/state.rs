//! Persistence trait for conversation state.
//!
//! The loop never stores anything itself. A turn loads the thread's state
//! through a [`StateStore`] at the start and hands it back at the end.

use async_trait::async_trait;
use crate::error::StoreError;
use crate::message::{ConversationState, ThreadId};

/// Load/save capability for thread state.
///
/// Implementations: in-memory (for tests and single-process use), JSON files,
/// SQLite.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// The backend name (e.g., "memory", "file", "sqlite").
    fn name(&self) -> &str;

    /// Load a thread's state, or `None` if the thread has never been saved.
    async fn load(&self, thread: &ThreadId) -> std::result::Result<Option<ConversationState>, StoreError>;

    /// Persist a thread's state, replacing what was stored before.
    async fn save(&self, thread: &ThreadId, state: &ConversationState) -> std::result::Result<(), StoreError>;

    /// Remove a thread. Returns whether anything was deleted.
    async fn delete(&self, thread: &ThreadId) -> std::result::Result<bool, StoreError>;

    /// All persisted thread ids.
    async fn list_threads(&self) -> std::result::Result<Vec<ThreadId>, StoreError>;
}
