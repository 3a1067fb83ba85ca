//! Turn invocation over persisted threads.
//!
//! A turn loads the thread's state, appends the user message, runs the
//! [`AgentLoop`] and saves the result. Turns on one thread run one at a
//! time; different threads are independent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use routeqa_config::IterationPolicy;
use routeqa_core::event::{DomainEvent, EventBus};
use routeqa_core::{ConversationState, Error, Message, StateStore, ThreadId};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::loop_runner::{AgentLoop, TurnOutcome};
use crate::stream_event::TurnEvent;

const PREVIEW_CHARS: usize = 80;

pub struct TurnService {
    agent: AgentLoop,
    store: Arc<dyn StateStore>,
    policy: IterationPolicy,
    event_bus: Arc<EventBus>,
    locks: StdMutex<HashMap<ThreadId, Arc<Mutex<()>>>>,
}

impl TurnService {
    pub fn new(agent: AgentLoop, store: Arc<dyn StateStore>, event_bus: Arc<EventBus>) -> Self {
        Self {
            agent,
            store,
            policy: IterationPolicy::default(),
            event_bus,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_iteration_policy(mut self, policy: IterationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn agent(&self) -> &AgentLoop {
        &self.agent
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Answer `utterance` on `thread`.
    pub async fn submit_turn(&self, thread: &ThreadId, utterance: &str) -> routeqa_core::Result<String> {
        self.submit_turn_with_cancel(thread, utterance, &CancellationToken::new())
            .await
            .map(|outcome| outcome.answer)
    }

    /// Like [`submit_turn`](Self::submit_turn), abandoning the turn at the
    /// next decision once `cancel` fires.
    pub async fn submit_turn_with_cancel(
        &self,
        thread: &ThreadId,
        utterance: &str,
        cancel: &CancellationToken,
    ) -> routeqa_core::Result<TurnOutcome> {
        self.run_turn(thread, utterance, cancel, None).await
    }

    /// Run the turn in the background and stream its progress.
    ///
    /// The last event is always [`TurnEvent::Answer`] or [`TurnEvent::Failed`].
    pub fn submit_turn_streaming(
        self: &Arc<Self>,
        thread: ThreadId,
        utterance: impl Into<String>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(32);
        let service = Arc::clone(self);
        let utterance = utterance.into();
        tokio::spawn(async move {
            let last = match service.run_turn(&thread, &utterance, &cancel, Some(&tx)).await {
                Ok(outcome) => TurnEvent::Answer {
                    content: outcome.answer,
                },
                Err(e) => TurnEvent::Failed {
                    message: e.to_string(),
                },
            };
            let _ = tx.send(last).await;
        });
        rx
    }

    /// The persisted state of `thread`, if any.
    pub async fn history(&self, thread: &ThreadId) -> routeqa_core::Result<Option<ConversationState>> {
        Ok(self.store.load(thread).await?)
    }

    fn thread_lock(&self, thread: &ThreadId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(thread.clone()).or_default().clone()
    }

    async fn run_turn(
        &self,
        thread: &ThreadId,
        utterance: &str,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<TurnEvent>>,
    ) -> routeqa_core::Result<TurnOutcome> {
        let lock = self.thread_lock(thread);
        let result = {
            let _guard = lock.lock().await;
            self.run_locked(thread, utterance, cancel, events).await
        };
        self.release_thread_lock(thread, &lock);
        result
    }

    /// Drop the map entry for `thread` unless another turn still holds or
    /// awaits it.
    fn release_thread_lock(&self, thread: &ThreadId, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference in the map, one held by the caller.
        let idle = locks
            .get(thread)
            .is_some_and(|entry| Arc::ptr_eq(entry, lock) && Arc::strong_count(entry) == 2);
        if idle {
            locks.remove(thread);
        }
    }

    async fn run_locked(
        &self,
        thread: &ThreadId,
        utterance: &str,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<TurnEvent>>,
    ) -> routeqa_core::Result<TurnOutcome> {
        let mut state = self.store.load(thread).await?.unwrap_or_default();
        if self.policy == IterationPolicy::PerTurn {
            state.reset_iteration();
        }
        state.push(Message::user(utterance))?;
        debug!(thread_id = %thread, history = state.len(), policy = ?self.policy, "Turn state loaded");

        self.event_bus.publish(DomainEvent::TurnStarted {
            thread_id: thread.to_string(),
            content_preview: utterance.chars().take(PREVIEW_CHARS).collect(),
            timestamp: Utc::now(),
        });

        match self.agent.run(thread, &mut state, cancel, events).await {
            Ok(outcome) => {
                self.store.save(thread, &state).await?;
                self.event_bus.publish(DomainEvent::TurnCompleted {
                    thread_id: thread.to_string(),
                    iterations: outcome.iterations,
                    hit_ceiling: outcome.hit_ceiling,
                    timestamp: Utc::now(),
                });
                Ok(outcome)
            }
            Err(Error::Cancelled) => {
                self.store.save(thread, &state).await?;
                Err(Error::Cancelled)
            }
            Err(e) => {
                warn!(thread_id = %thread, error = %e, "Turn failed, state not saved");
                self.event_bus.publish(DomainEvent::ErrorOccurred {
                    context: format!("turn on thread {thread}"),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::APOLOGY;
    use crate::test_helpers::*;
    use routeqa_core::{Provider, Role, ToolRegistry};
    use routeqa_store::InMemoryStateStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn service_with(provider: Arc<dyn Provider>, tools: ToolRegistry, store: Arc<InMemoryStateStore>) -> TurnService {
        let bus = Arc::new(EventBus::default());
        let agent = AgentLoop::new(provider, "mock-model", Arc::new(tools), bus.clone());
        TurnService::new(agent, store, bus)
    }

    #[tokio::test]
    async fn turns_accumulate_history() {
        let store = Arc::new(InMemoryStateStore::new());
        let service = service_with(Arc::new(ToolOnceProvider::new("echo")), stub_registry(), store.clone());
        let thread = ThreadId::from("sales");

        let first = service.submit_turn(&thread, "How many customers?").await.unwrap();
        assert_eq!(first, "Answer: How many customers?");
        let second = service.submit_turn(&thread, "And employees?").await.unwrap();
        assert_eq!(second, "Answer: And employees?");

        let state = store.load(&thread).await.unwrap().unwrap();
        // user, assistant(tools), tool, assistant per turn
        assert_eq!(state.len(), 8);
        assert_eq!(state.messages()[4].role, Role::User);
        assert_eq!(state.last_user_message(), Some("And employees?"));
    }

    #[tokio::test]
    async fn per_turn_policy_resets_the_counter() {
        let provider = Arc::new(AlwaysToolProvider::new("echo"));
        let store = Arc::new(InMemoryStateStore::new());
        let bus = Arc::new(EventBus::default());
        let agent = AgentLoop::new(provider.clone(), "m", Arc::new(stub_registry()), bus.clone()).with_max_iterations(2);
        let service = TurnService::new(agent, store, bus);
        let thread = ThreadId::from("t");

        assert_eq!(service.submit_turn(&thread, "one").await.unwrap(), APOLOGY);
        assert_eq!(service.submit_turn(&thread, "two").await.unwrap(), APOLOGY);
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test]
    async fn accumulate_policy_keeps_counting() {
        let provider = Arc::new(AlwaysToolProvider::new("echo"));
        let store = Arc::new(InMemoryStateStore::new());
        let bus = Arc::new(EventBus::default());
        let agent = AgentLoop::new(provider.clone(), "m", Arc::new(stub_registry()), bus.clone()).with_max_iterations(2);
        let service = TurnService::new(agent, store.clone(), bus).with_iteration_policy(IterationPolicy::Accumulate);
        let thread = ThreadId::from("t");

        service.submit_turn(&thread, "one").await.unwrap();
        assert_eq!(provider.calls(), 2);
        assert_eq!(service.submit_turn(&thread, "two").await.unwrap(), APOLOGY);
        assert_eq!(provider.calls(), 2);
        assert_eq!(store.load(&thread).await.unwrap().unwrap().iteration(), 2);
    }

    #[tokio::test]
    async fn failed_turn_leaves_saved_state_untouched() {
        // One scripted answer: the second turn's decision fails.
        let provider = Arc::new(SequentialMockProvider::single_text("first answer"));
        let store = Arc::new(InMemoryStateStore::new());
        let service = service_with(provider, stub_registry(), store.clone());
        let thread = ThreadId::from("t");

        service.submit_turn(&thread, "first").await.unwrap();
        let err = service.submit_turn(&thread, "second").await.unwrap_err();
        assert!(matches!(err, Error::Provider(_)));

        let state = store.load(&thread).await.unwrap().unwrap();
        assert_eq!(state.len(), 2);
        assert_eq!(state.last_user_message(), Some("first"));
    }

    #[tokio::test]
    async fn cancelled_turn_saves_progress() {
        let provider = Arc::new(SequentialMockProvider::single_text("unused"));
        let store = Arc::new(InMemoryStateStore::new());
        let service = service_with(provider.clone(), stub_registry(), store.clone());
        let thread = ThreadId::from("t");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = service
            .submit_turn_with_cancel(&thread, "hello", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(provider.call_count(), 0);
        let state = service.history(&thread).await.unwrap().unwrap();
        assert_eq!(state.last_user_message(), Some("hello"));
    }

    #[tokio::test]
    async fn streaming_ends_with_answer() {
        let store = Arc::new(InMemoryStateStore::new());
        let service = Arc::new(service_with(
            Arc::new(ToolOnceProvider::new("fixed")),
            stub_registry(),
            store,
        ));

        let mut rx = service.submit_turn_streaming("s".into(), "range?", CancellationToken::new());
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], TurnEvent::ToolsRequested { names: vec!["fixed".into()] });
        assert!(matches!(&events[1], TurnEvent::ToolsCompleted { results } if results[0].success));
        assert_eq!(
            events[2],
            TurnEvent::Answer {
                content: format!("Answer: {FIXED_OUTPUT}")
            }
        );
    }

    #[tokio::test]
    async fn streaming_reports_failure() {
        let service = Arc::new(service_with(
            Arc::new(FailingProvider),
            stub_registry(),
            Arc::new(InMemoryStateStore::new()),
        ));
        let mut rx = service.submit_turn_streaming("s".into(), "hi", CancellationToken::new());
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TurnEvent::Failed { ref message } if message.contains("connection refused")));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn turn_events_are_published() {
        let store = Arc::new(InMemoryStateStore::new());
        let service = service_with(Arc::new(ToolOnceProvider::new("echo")), stub_registry(), store);
        let mut rx = service.event_bus.subscribe();

        service.submit_turn(&"t".into(), "hello").await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event.as_ref() {
                DomainEvent::TurnStarted { .. } => "started",
                DomainEvent::ResponseGenerated { .. } => "response",
                DomainEvent::ToolExecuted { .. } => "tool",
                DomainEvent::TurnCompleted { .. } => "completed",
                DomainEvent::ErrorOccurred { .. } => "error",
            });
        }
        assert_eq!(kinds, vec!["started", "response", "tool", "response", "completed"]);
    }

    /// Registry with one tool that records how many invocations overlap.
    fn overlap_registry(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register_fn("slow", "sleeps", move |input| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(input)
            }
        });
        registry
    }

    #[tokio::test(start_paused = true)]
    async fn same_thread_turns_are_serialized() {
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = overlap_registry(Arc::new(AtomicUsize::new(0)), peak.clone());
        let service = service_with(
            Arc::new(ToolOnceProvider::new("slow")),
            registry,
            Arc::new(InMemoryStateStore::new()),
        );
        let thread = ThreadId::from("shared");

        let (a, b) = tokio::join!(service.submit_turn(&thread, "a"), service.submit_turn(&thread, "b"));
        a.unwrap();
        b.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(service.history(&thread).await.unwrap().unwrap().len(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn thread_locks_are_released_after_turns() {
        let registry = overlap_registry(Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let service = service_with(
            Arc::new(ToolOnceProvider::new("slow")),
            registry,
            Arc::new(InMemoryStateStore::new()),
        );
        let (shared, other) = (ThreadId::from("shared"), ThreadId::from("other"));

        let (a, b, c) = tokio::join!(
            service.submit_turn(&shared, "a"),
            service.submit_turn(&shared, "b"),
            service.submit_turn(&other, "c"),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        assert!(service.locks.lock().unwrap().is_empty());

        let failing = service_with(
            Arc::new(FailingProvider),
            stub_registry(),
            Arc::new(InMemoryStateStore::new()),
        );
        failing.submit_turn(&shared, "x").await.unwrap_err();
        assert!(failing.locks.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn different_threads_run_concurrently() {
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = overlap_registry(Arc::new(AtomicUsize::new(0)), peak.clone());
        let service = service_with(
            Arc::new(ToolOnceProvider::new("slow")),
            registry,
            Arc::new(InMemoryStateStore::new()),
        );

        let (left, right) = (ThreadId::from("left"), ThreadId::from("right"));
        let (a, b) = tokio::join!(service.submit_turn(&left, "a"), service.submit_turn(&right, "b"));
        assert_eq!(a.unwrap(), "Answer: a");
        assert_eq!(b.unwrap(), "Answer: b");
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
