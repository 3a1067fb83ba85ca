//! The routing loop: DECIDING → EXECUTING_TOOLS → ... → DONE.

use std::sync::Arc;

use routeqa_config::AppConfig;
use routeqa_core::event::EventBus;
use routeqa_core::{ConversationState, Error, Provider, ThreadId, ToolRegistry, ToolRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::decision::{Decision, DecisionStep};
use crate::executor::ToolExecutor;
use crate::stream_event::{CompletedTool, TurnEvent};

/// How a finished turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Text of the final assistant message
    pub answer: String,
    /// Value of the iteration counter at the end of the turn
    pub iterations: u32,
    /// Whether the answer is the forced apology
    pub hit_ceiling: bool,
}

enum LoopState {
    Deciding,
    ExecutingTools(Vec<ToolRequest>),
    Done { answer: String, hit_ceiling: bool },
}

/// Alternates decisions and tool batches until an answer is reached.
pub struct AgentLoop {
    decision: DecisionStep,
    executor: ToolExecutor,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            decision: DecisionStep::new(provider, model, event_bus.clone()),
            executor: ToolExecutor::new(tools, event_bus),
        }
    }

    /// Apply the `[agent]` section and the model defaults.
    pub fn from_config(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        tools: Arc<ToolRegistry>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self::new(provider, model, tools, event_bus)
            .with_temperature(config.default_temperature)
            .with_max_tokens(config.default_max_tokens)
            .with_max_iterations(config.agent.max_iterations)
            .with_max_tool_output_chars(config.agent.max_tool_output_chars)
            .with_parallel_tools(config.agent.parallel_tools)
            .with_product_name(config.agent.product_name.clone())
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.decision = self.decision.with_temperature(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.decision = self.decision.with_max_tokens(max_tokens);
        self
    }

    /// Tool-calling iterations before the forced apology.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.decision = self.decision.with_max_iterations(max);
        self
    }

    pub fn with_max_tool_output_chars(mut self, limit: usize) -> Self {
        self.executor = self.executor.with_max_output_chars(limit);
        self
    }

    pub fn with_parallel_tools(mut self, parallel: bool) -> Self {
        self.executor = self.executor.with_parallel(parallel);
        self
    }

    pub fn with_product_name(mut self, product_name: impl Into<String>) -> Self {
        self.decision = self.decision.with_product_name(product_name);
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        self.executor.tools()
    }

    pub fn max_iterations(&self) -> u32 {
        self.decision.max_iterations()
    }

    /// Run the loop over a state whose last message is the new user message.
    ///
    /// `cancel` is checked before every decision; a cancelled run returns
    /// [`Error::Cancelled`] and leaves `state` as far as it got. Progress is
    /// sent to `events` when given.
    pub async fn run(
        &self,
        thread: &ThreadId,
        state: &mut ConversationState,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<TurnEvent>>,
    ) -> routeqa_core::Result<TurnOutcome> {
        info!(
            thread_id = %thread,
            messages = state.len(),
            iteration = state.iteration(),
            model = self.decision.model(),
            "Processing turn"
        );

        let tools = self.executor.tools().clone();
        let mut current = LoopState::Deciding;
        loop {
            current = match current {
                LoopState::Deciding => {
                    if cancel.is_cancelled() {
                        info!(thread_id = %thread, iteration = state.iteration(), "Turn cancelled");
                        return Err(Error::Cancelled);
                    }
                    debug!(thread_id = %thread, iteration = state.iteration(), "Deciding");
                    match self.decision.decide(thread, state, &tools).await? {
                        Decision::ToolsRequested(requests) => {
                            emit(
                                events,
                                TurnEvent::ToolsRequested {
                                    names: requests.iter().map(|r| r.name.clone()).collect(),
                                },
                            )
                            .await;
                            LoopState::ExecutingTools(requests)
                        }
                        Decision::Answer(answer) => LoopState::Done {
                            answer,
                            hit_ceiling: false,
                        },
                        Decision::CeilingReached(answer) => LoopState::Done {
                            answer,
                            hit_ceiling: true,
                        },
                    }
                }
                LoopState::ExecutingTools(requests) => {
                    let outcomes = self.executor.execute_batch(&requests).await;
                    let mut results = Vec::with_capacity(outcomes.len());
                    for outcome in outcomes {
                        state.push_tool_result(&outcome.request, outcome.content, outcome.is_error)?;
                        results.push(CompletedTool {
                            id: outcome.request.id,
                            name: outcome.request.name,
                            success: !outcome.is_error,
                        });
                    }
                    emit(events, TurnEvent::ToolsCompleted { results }).await;
                    LoopState::Deciding
                }
                LoopState::Done { answer, hit_ceiling } => {
                    info!(
                        thread_id = %thread,
                        iterations = state.iteration(),
                        hit_ceiling,
                        "Turn finished"
                    );
                    return Ok(TurnOutcome {
                        answer,
                        iterations: state.iteration(),
                        hit_ceiling,
                    });
                }
            };
        }
    }
}

/// Send a progress event. A receiver that went away is not an error.
async fn emit(events: Option<&mpsc::Sender<TurnEvent>>, event: TurnEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::APOLOGY;
    use crate::test_helpers::*;
    use routeqa_core::{Message, Role};
    use serde_json::json;

    fn agent(provider: Arc<dyn Provider>) -> AgentLoop {
        AgentLoop::new(
            provider,
            "mock-model",
            Arc::new(stub_registry()),
            Arc::new(EventBus::default()),
        )
    }

    fn seeded(question: &str) -> ConversationState {
        let mut state = ConversationState::new();
        state.push(Message::user(question)).unwrap();
        state
    }

    #[tokio::test]
    async fn simple_text_response() {
        let provider = Arc::new(SequentialMockProvider::single_text("Hello! How can I help?"));
        let mut state = seeded("Hello!");

        let outcome = agent(provider)
            .run(&"t".into(), &mut state, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.answer, "Hello! How can I help?");
        assert!(!outcome.hit_ceiling);
        // User + Assistant; the system prompt is not stored
        assert_eq!(state.len(), 2);
    }

    #[tokio::test]
    async fn tool_round_then_answer() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![
                ToolRequest::new("a", "fixed", json!({})),
                ToolRequest::new("b", "echo", json!({"query": "range"})),
            ],
            "Done.",
        ));
        let mut state = seeded("question");

        let outcome = agent(provider.clone())
            .run(&"t".into(), &mut state, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.answer, "Done.");
        assert_eq!(outcome.iterations, 1);

        let roles: Vec<_> = state.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Tool, Role::Assistant]
        );
        assert_eq!(state.messages()[2].tool_call_id.as_deref(), Some("a"));
        assert_eq!(state.messages()[3].content, "range");

        // The second decision sees the tool results.
        let second = &provider.requests()[1];
        assert!(second.messages.iter().any(|m| m.content == FIXED_OUTPUT));
    }

    #[tokio::test]
    async fn always_tool_model_hits_ceiling_after_exactly_ceiling_calls() {
        for ceiling in [1, 3, 5] {
            let provider = Arc::new(AlwaysToolProvider::new("echo"));
            let mut state = seeded("never ends");

            let outcome = agent(provider.clone())
                .with_max_iterations(ceiling)
                .run(&"t".into(), &mut state, &CancellationToken::new(), None)
                .await
                .unwrap();
            assert!(outcome.hit_ceiling);
            assert_eq!(outcome.answer, APOLOGY);
            assert_eq!(outcome.iterations, ceiling);
            assert_eq!(provider.calls(), ceiling as usize);
        }
    }

    #[tokio::test]
    async fn tool_failures_route_back_to_the_model() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![ToolRequest::new("x", "always_fail", json!("q"))],
            "Sorry, the database is down.",
        ));
        let mut state = seeded("How many customers?");

        let outcome = agent(provider)
            .run(&"t".into(), &mut state, &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(outcome.answer, "Sorry, the database is down.");
        let result = &state.messages()[2];
        assert!(result.is_error);
        assert!(result.content.contains("backend unreachable"));
    }

    #[tokio::test]
    async fn decision_error_aborts_the_turn() {
        let mut state = seeded("hello");
        let err = agent(Arc::new(FailingProvider))
            .run(&"t".into(), &mut state, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }

    #[tokio::test]
    async fn cancelled_before_first_decision() {
        let provider = Arc::new(SequentialMockProvider::single_text("never sent"));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut state = seeded("hello");

        let err = agent(provider.clone())
            .run(&"t".into(), &mut state, &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(provider.call_count(), 0);
        assert_eq!(state.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_is_seen_at_the_next_decision() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut registry = ToolRegistry::new();
        registry.register_fn("cancel_me", "cancels the turn", move |_| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                Ok("cancelled".to_string())
            }
        });
        let provider = Arc::new(AlwaysToolProvider::new("cancel_me"));
        let agent = AgentLoop::new(
            provider.clone(),
            "m",
            Arc::new(registry),
            Arc::new(EventBus::default()),
        );
        let mut state = seeded("hello");

        let err = agent.run(&"t".into(), &mut state, &cancel, None).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(provider.calls(), 1);
        // The finished tool batch is kept.
        assert_eq!(state.last().unwrap().role, Role::Tool);
    }

    #[tokio::test]
    async fn progress_events_in_order() {
        let provider = Arc::new(SequentialMockProvider::tool_then_answer(
            vec![
                ToolRequest::new("a", "echo", json!("x")),
                ToolRequest::new("b", "always_fail", json!("y")),
            ],
            "final",
        ));
        let (tx, mut rx) = mpsc::channel(16);
        let mut state = seeded("q");
        agent(provider)
            .run(&"t".into(), &mut state, &CancellationToken::new(), Some(&tx))
            .await
            .unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                TurnEvent::ToolsRequested {
                    names: vec!["echo".into(), "always_fail".into()],
                },
                TurnEvent::ToolsCompleted {
                    results: vec![
                        CompletedTool { id: "a".into(), name: "echo".into(), success: true },
                        CompletedTool { id: "b".into(), name: "always_fail".into(), success: false },
                    ],
                },
            ]
        );
    }

    #[test]
    fn from_config_applies_agent_section() {
        let mut config = AppConfig::default();
        config.agent.max_iterations = 2;
        let agent = AgentLoop::from_config(
            &config,
            Arc::new(FailingProvider),
            "m",
            Arc::new(stub_registry()),
            Arc::new(EventBus::default()),
        );
        assert_eq!(agent.max_iterations(), 2);
        assert_eq!(agent.tools().len(), 3);
    }
}
