//! Scripted providers and stub tools shared by the loop tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use routeqa_core::error::{ProviderError, ToolError};
use routeqa_core::provider::Usage;
use routeqa_core::{Message, Provider, ProviderRequest, ProviderResponse, Role, ToolRegistry, ToolRequest};
use serde_json::json;

pub const FIXED_OUTPUT: &str = "fixed tool output";

/// Returns scripted responses in order, recording every request.
///
/// Running out of responses is reported as a malformed response.
pub struct SequentialMockProvider {
    responses: Mutex<Vec<ProviderResponse>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<ProviderResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn single_text(text: &str) -> Self {
        Self::new(vec![make_text_response(text)])
    }

    /// First the given tool calls, then a final answer.
    pub fn tool_then_answer(tool_calls: Vec<ToolRequest>, answer: &str) -> Self {
        Self::new(vec![make_tool_call_response(tool_calls, ""), make_text_response(answer)])
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        let responses = self.responses.lock().unwrap();
        let index = requests.len();
        requests.push(request);
        responses.get(index).cloned().ok_or_else(|| {
            ProviderError::MalformedResponse(format!(
                "no scripted response for call #{index} (have {})",
                responses.len()
            ))
        })
    }
}

/// Requests the same tool on every call and never answers.
pub struct AlwaysToolProvider {
    tool: String,
    calls: AtomicUsize,
}

impl AlwaysToolProvider {
    pub fn new(tool: &str) -> Self {
        Self {
            tool: tool.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Provider for AlwaysToolProvider {
    fn name(&self) -> &str {
        "always_tool"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(make_tool_call_response(
            vec![ToolRequest::new(format!("call_{n}"), &self.tool, json!({"query": format!("attempt {n}")}))],
            "",
        ))
    }
}

/// Requests `tool` once per turn, then answers with the tool's output.
pub struct ToolOnceProvider {
    tool: String,
    calls: AtomicUsize,
}

impl ToolOnceProvider {
    pub fn new(tool: &str) -> Self {
        Self {
            tool: tool.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Provider for ToolOnceProvider {
    fn name(&self) -> &str {
        "tool_once"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        match request.messages.last() {
            Some(last) if last.role == Role::Tool => Ok(make_text_response(&format!("Answer: {}", last.content))),
            Some(last) => Ok(make_tool_call_response(
                vec![ToolRequest::new(format!("call_{n}"), &self.tool, json!({"query": last.content}))],
                "",
            )),
            None => Err(ProviderError::MalformedResponse("empty conversation".into())),
        }
    }
}

/// Fails every call like an unreachable endpoint.
pub struct FailingProvider;

#[async_trait::async_trait]
impl Provider for FailingProvider {
    fn name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::Network("connection refused".into()))
    }
}

pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}

pub fn make_tool_call_response(tool_calls: Vec<ToolRequest>, thought: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_tools(thought, tool_calls),
        usage: Some(Usage {
            prompt_tokens: 20,
            completion_tokens: 10,
            total_tokens: 30,
        }),
        model: "mock-model".into(),
    }
}

/// `echo`, `always_fail` and `fixed`, in that order.
pub fn stub_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register_fn("echo", "Echoes the input", |input| async move { Ok(input) });
    registry.register_fn("always_fail", "Fails on every call", |_input| async move {
        Err(ToolError::ExecutionFailed {
            tool_name: "always_fail".into(),
            reason: "backend unreachable".into(),
        })
    });
    registry.register_fn("fixed", "Returns a fixed text", |_input| async move {
        Ok(FIXED_OUTPUT.to_string())
    });
    registry
}
