//! The decision step: answer now, or delegate to tools.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use routeqa_core::event::{DomainEvent, EventBus};
use routeqa_core::{ConversationState, Message, Provider, ProviderRequest, ThreadId, ToolRegistry, ToolRequest};
use tracing::{debug, warn};

/// Final answer used when the iteration ceiling is reached.
pub const APOLOGY: &str = "I'm sorry, I couldn't reach an answer within the allowed number of steps. \
Please try rephrasing or narrowing your question.";

/// What one decision produced. The matching assistant message has already
/// been appended to the state.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The model asked for these tools.
    ToolsRequested(Vec<ToolRequest>),
    /// The model answered.
    Answer(String),
    /// The ceiling was reached; the model was not called.
    CeilingReached(String),
}

impl Decision {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::ToolsRequested(_))
    }
}

/// Calls the language model in tool-calling mode over the whole conversation.
pub struct DecisionStep {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    max_iterations: u32,
    product_name: String,
    event_bus: Arc<EventBus>,
}

impl DecisionStep {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, event_bus: Arc<EventBus>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.0,
            max_tokens: None,
            max_iterations: 5,
            product_name: "BMW iX".into(),
            event_bus,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_product_name(mut self, product_name: impl Into<String>) -> Self {
        self.product_name = product_name.into();
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// System instruction listing every registered tool plus the routing rules.
    pub fn system_prompt(&self, tools: &ToolRegistry) -> String {
        let product = &self.product_name;
        let mut prompt = format!(
            "You are an expert assistant for the {product}. Answer the user's question, \
             using the tools below whenever the answer depends on data you do not have.\n\n\
             Available tools:\n"
        );
        for (i, tool) in tools.list().iter().enumerate() {
            let _ = writeln!(prompt, "{}. {}: {}", i + 1, tool.name(), tool.description());
        }
        let _ = write!(
            prompt,
            "\nRules:\n\
             - For any question about sales, customers, artists, invoices or other business \
             data, ALWAYS call sql_db_list_tables first, then inspect the schema, then query.\n\
             - Treat generic references such as \"the car\", \"it\" or \"the product\" as \
             referring to the {product}.\n\
             - You may request several independent tools at once.\n\
             - Once the tool results contain the answer, reply in plain text without tools.\n\n\
             Examples:\n\
             - \"How many customers?\" -> sql_db_list_tables\n\
             - \"What do people think of the steering wheel?\" -> customer_feedback_search\n\
             - \"What is the charging time and are there any complaints about it?\" -> \
             product_details_search and customer_feedback_search\n"
        );
        prompt
    }

    /// Run one decision over `state`, appending exactly one assistant message.
    ///
    /// The iteration counter grows only when tools were requested. At the
    /// ceiling the model is not called and [`APOLOGY`] becomes the answer.
    pub async fn decide(
        &self,
        thread: &ThreadId,
        state: &mut ConversationState,
        tools: &ToolRegistry,
    ) -> routeqa_core::Result<Decision> {
        if state.iteration() >= self.max_iterations {
            warn!(
                thread_id = %thread,
                iteration = state.iteration(),
                ceiling = self.max_iterations,
                "Iteration ceiling reached, answering without the model"
            );
            state.push(Message::assistant(APOLOGY))?;
            return Ok(Decision::CeilingReached(APOLOGY.to_string()));
        }

        let mut messages = Vec::with_capacity(state.len() + 1);
        messages.push(Message::system(self.system_prompt(tools)));
        messages.extend(state.messages().iter().cloned());

        let request = ProviderRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tools.definitions(),
        };

        let response = self.provider.complete(request).await?;

        if let Some(usage) = &response.usage {
            self.event_bus.publish(DomainEvent::ResponseGenerated {
                thread_id: thread.to_string(),
                model: response.model.clone(),
                tokens_used: usage.total_tokens,
                timestamp: Utc::now(),
            });
        }

        let message = response.message;
        if message.has_tool_requests() {
            let requests = message.tool_calls.clone();
            state.push(Message::assistant_with_tools(message.content, requests.clone()))?;
            state.increment_iteration();
            debug!(
                thread_id = %thread,
                iteration = state.iteration(),
                tools = ?requests.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
                "Model requested tools"
            );
            return Ok(Decision::ToolsRequested(requests));
        }

        debug!(thread_id = %thread, chars = message.content.len(), "Model answered");
        state.push(Message::assistant(message.content.clone()))?;
        Ok(Decision::Answer(message.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use routeqa_core::Role;
    use serde_json::json;

    fn step(provider: Arc<dyn Provider>) -> DecisionStep {
        DecisionStep::new(provider, "mock-model", Arc::new(EventBus::default()))
    }

    fn seeded(question: &str) -> ConversationState {
        let mut state = ConversationState::new();
        state.push(Message::user(question)).unwrap();
        state
    }

    #[test]
    fn system_prompt_lists_tools_and_rules() {
        let provider = Arc::new(SequentialMockProvider::new(vec![]));
        let prompt = step(provider)
            .with_product_name("BMW iX")
            .system_prompt(&stub_registry());
        assert!(prompt.contains("echo: Echoes the input"));
        assert!(prompt.contains("always_fail"));
        assert!(prompt.contains("sql_db_list_tables first"));
        assert!(prompt.contains("referring to the BMW iX"));
    }

    #[tokio::test]
    async fn text_response_is_final() {
        let provider = Arc::new(SequentialMockProvider::single_text("59 customers."));
        let mut state = seeded("How many customers?");

        let decision = step(provider.clone())
            .decide(&"t".into(), &mut state, &stub_registry())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Answer("59 customers.".into()));
        assert!(decision.is_final());
        assert_eq!(state.iteration(), 0);
        assert_eq!(state.len(), 2);
        assert_eq!(state.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn tool_request_increments_iteration() {
        let provider = Arc::new(SequentialMockProvider::new(vec![make_tool_call_response(
            vec![ToolRequest::new("c1", "echo", json!({"query": "x"}))],
            "Let me check.",
        )]));
        let mut state = seeded("anything");

        let decision = step(provider)
            .decide(&"t".into(), &mut state, &stub_registry())
            .await
            .unwrap();
        assert!(matches!(decision, Decision::ToolsRequested(ref r) if r.len() == 1));
        assert_eq!(state.iteration(), 1);
        assert_eq!(state.pending_tool_requests().len(), 1);
    }

    #[tokio::test]
    async fn request_carries_system_prompt_and_tools() {
        let provider = Arc::new(SequentialMockProvider::single_text("ok"));
        let mut state = seeded("hello");
        step(provider.clone())
            .decide(&"t".into(), &mut state, &stub_registry())
            .await
            .unwrap();

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages[0].role, Role::System);
        assert_eq!(requests[0].messages[1].content, "hello");
        assert_eq!(requests[0].tools.len(), stub_registry().len());
    }

    #[tokio::test]
    async fn ceiling_skips_the_model() {
        let provider = Arc::new(AlwaysToolProvider::new("echo"));
        let mut state = seeded("loop forever");
        for _ in 0..3 {
            state.increment_iteration();
        }

        let decision = step(provider.clone())
            .with_max_iterations(3)
            .decide(&"t".into(), &mut state, &stub_registry())
            .await
            .unwrap();
        assert_eq!(decision, Decision::CeilingReached(APOLOGY.into()));
        assert_eq!(provider.calls(), 0);
        assert_eq!(state.iteration(), 3);
        assert_eq!(state.last().unwrap().content, APOLOGY);
    }

    #[tokio::test]
    async fn provider_failure_propagates() {
        let provider = Arc::new(FailingProvider);
        let mut state = seeded("hello");
        let err = step(provider)
            .decide(&"t".into(), &mut state, &stub_registry())
            .await
            .unwrap_err();
        assert!(matches!(err, routeqa_core::Error::Provider(_)));
        assert_eq!(state.len(), 1);
    }
}
