//! In-memory state store: useful for testing and single-process sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use routeqa_core::error::StoreError;
use routeqa_core::{ConversationState, StateStore, ThreadId};
use tokio::sync::RwLock;

/// Keeps every thread's state in a map. Nothing survives the process.
#[derive(Clone, Default)]
pub struct InMemoryStateStore {
    threads: Arc<RwLock<HashMap<ThreadId, ConversationState>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn load(&self, thread: &ThreadId) -> Result<Option<ConversationState>, StoreError> {
        Ok(self.threads.read().await.get(thread).cloned())
    }

    async fn save(&self, thread: &ThreadId, state: &ConversationState) -> Result<(), StoreError> {
        self.threads
            .write()
            .await
            .insert(thread.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, thread: &ThreadId) -> Result<bool, StoreError> {
        Ok(self.threads.write().await.remove(thread).is_some())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadId>, StoreError> {
        let mut ids: Vec<ThreadId> = self.threads.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use routeqa_core::Message;

    #[tokio::test]
    async fn save_then_load() {
        let store = InMemoryStateStore::new();
        let thread = ThreadId::from("t-1");
        assert!(store.load(&thread).await.unwrap().is_none());

        let mut state = ConversationState::new();
        state.push(Message::user("How many albums are there?")).unwrap();
        store.save(&thread, &state).await.unwrap();

        let loaded = store.load(&thread).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.last_user_message(), Some("How many albums are there?"));
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let store = InMemoryStateStore::new();
        let other = store.clone();
        store
            .save(&ThreadId::from("b"), &ConversationState::new())
            .await
            .unwrap();
        other
            .save(&ThreadId::from("a"), &ConversationState::new())
            .await
            .unwrap();

        let ids = store.list_threads().await.unwrap();
        assert_eq!(ids, vec![ThreadId::from("a"), ThreadId::from("b")]);
        assert!(other.delete(&ThreadId::from("a")).await.unwrap());
        assert!(!store.delete(&ThreadId::from("a")).await.unwrap());
    }
}
