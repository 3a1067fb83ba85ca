//! Tool trait: the abstraction over retrieval and query capabilities.
//!
//! Every tool takes a single text input and returns text. The registry is
//! built once at startup, then shared read-only by every turn.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// JSON Schema for the single `query` string every tool accepts.
pub fn query_schema(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "query": {
                "type": "string",
                "description": description
            }
        },
        "required": ["query"]
    })
}

/// The core Tool trait.
///
/// SQL toolkit tools and document-search tools implement this trait and are
/// registered in the [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "sql_db_query").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value {
        query_schema("The input for this tool")
    }

    /// Run the tool with an already-normalized text input.
    async fn invoke(&self, input: &str) -> std::result::Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

type BoxedInvoke = Box<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = std::result::Result<String, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// A tool backed by a closure, for registering ad-hoc capabilities.
pub struct FnTool {
    name: String,
    description: String,
    invoke: BoxedInvoke,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<String, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            invoke: Box::new(move |input| Box::pin(f(input))),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, input: &str) -> std::result::Result<String, ToolError> {
        (self.invoke)(input.to_string()).await
    }
}

/// A registry of available tools.
///
/// Entries keep registration order so the tool listing shown to the model is
/// stable. Registering a name twice replaces the earlier entry in place.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter().position(|t| t.name() == tool.name()) {
            Some(idx) => self.tools[idx] = tool,
            None => self.tools.push(tool),
        }
    }

    /// Register a closure-backed tool.
    pub fn register_fn<F, Fut>(&mut self, name: &str, description: &str, f: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<String, ToolError>> + Send + 'static,
    {
        self.register(Arc::new(FnTool::new(name, description, f)));
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// All registered tools, in registration order.
    pub fn list(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    /// Get all tool definitions (for sending to the LLM).
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
