//! Tool execution: resolve, normalize, invoke, bound.
//!
//! Every request in a batch yields exactly one [`ToolOutcome`], in request
//! order. A missing tool or a failing invocation becomes an error outcome;
//! it never stops its siblings.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use routeqa_core::event::{DomainEvent, EventBus};
use routeqa_core::{ToolRegistry, ToolRequest};
use serde_json::Value;
use tracing::{debug, warn};

/// Conventional argument keys, probed in this order.
const ARGUMENT_KEYS: [&str; 5] = ["query", "input", "question", "__arg1", "tool_input"];

/// Appended to output that was cut short.
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 1500;

/// Fold a request payload into the single string a tool accepts.
///
/// A string is used as is. For an object the conventional keys are tried
/// first, then the first string value in the order the payload listed its
/// keys. Anything else is the compact JSON text of the payload.
pub fn normalize_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(s) => s.clone(),
        Value::Object(map) => ARGUMENT_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .or_else(|| map.values().find_map(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| arguments.to_string()),
        other => other.to_string(),
    }
}

/// Cut `text` to `limit` characters plus [`TRUNCATION_MARKER`]. Text within
/// the limit comes back unchanged.
pub fn truncate_output(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &text[..cut]),
        None => text.to_string(),
    }
}

/// The result of running one request.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub request: ToolRequest,
    pub content: String,
    pub is_error: bool,
    pub duration_ms: u64,
}

/// Runs batches of tool requests against a shared registry.
pub struct ToolExecutor {
    tools: Arc<ToolRegistry>,
    max_output_chars: usize,
    parallel: bool,
    event_bus: Arc<EventBus>,
}

impl ToolExecutor {
    pub fn new(tools: Arc<ToolRegistry>, event_bus: Arc<EventBus>) -> Self {
        Self {
            tools,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
            parallel: true,
            event_bus,
        }
    }

    pub fn with_max_output_chars(mut self, limit: usize) -> Self {
        self.max_output_chars = limit;
        self
    }

    /// Run sibling requests concurrently (`true`) or one after another.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Run every request and return one outcome per request, in order.
    pub async fn execute_batch(&self, requests: &[ToolRequest]) -> Vec<ToolOutcome> {
        if self.parallel {
            join_all(requests.iter().map(|r| self.execute_one(r))).await
        } else {
            let mut outcomes = Vec::with_capacity(requests.len());
            for request in requests {
                outcomes.push(self.execute_one(request).await);
            }
            outcomes
        }
    }

    async fn execute_one(&self, request: &ToolRequest) -> ToolOutcome {
        let start = Instant::now();
        let (content, is_error) = match self.tools.get(&request.name) {
            None => {
                warn!(tool = %request.name, "Model requested an unknown tool");
                let available = self.tools.names().join(", ");
                (
                    format!(
                        "Error: tool '{}' not found. Available tools: {available}",
                        request.name
                    ),
                    true,
                )
            }
            Some(tool) => {
                let input = normalize_arguments(&request.arguments);
                debug!(tool = %request.name, input = %input, "Invoking tool");
                match tool.invoke(&input).await {
                    Ok(output) => (truncate_output(&output, self.max_output_chars), false),
                    Err(e) => {
                        warn!(tool = %request.name, error = %e, "Tool execution failed");
                        (format!("Error: {e}"), true)
                    }
                }
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(tool = %request.name, duration_ms, success = !is_error, "Tool finished");

        self.event_bus.publish(DomainEvent::ToolExecuted {
            tool_name: request.name.clone(),
            success: !is_error,
            duration_ms,
            timestamp: Utc::now(),
        });

        ToolOutcome {
            request: request.clone(),
            content,
            is_error,
            duration_ms,
        }
    }
}
