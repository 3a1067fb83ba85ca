//! Message and conversation-state domain types.
//!
//! These are the value objects that flow through a turn:
//! user utterance → decision step → tool requests → tool results → final answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Identity of a persisted conversation spanning multiple turns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ThreadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The language model
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
}

/// A request to run one registered tool.
///
/// `arguments` is either a JSON object (structured payload) or a JSON string
/// (raw payload). Every representation the model may send is folded into this
/// one type as soon as it is received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Unique request ID (matches the model's tool_call.id when it sent one)
    pub id: String,

    /// Name of the tool to run
    pub name: String,

    /// Argument payload
    pub arguments: serde_json::Value,
}

impl ToolRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Build a request from a raw tool call whose arguments arrive as a JSON
    /// string. Text that parses as JSON becomes that value; anything else is
    /// kept verbatim as a string payload. An empty id is replaced with a
    /// generated one.
    pub fn from_raw(id: &str, name: &str, raw_arguments: &str) -> Self {
        let trimmed = raw_arguments.trim();
        let arguments = if trimmed.is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(trimmed)
                .unwrap_or_else(|_| serde_json::Value::String(raw_arguments.to_string()))
        };
        let id = if id.trim().is_empty() {
            format!("call_{}", Uuid::new_v4().simple())
        } else {
            id.to_string()
        };
        Self {
            id,
            name: name.to_string(),
            arguments,
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// Tool requests carried by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolRequest>,

    /// For tool results: the request this answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// For tool results: the tool that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// For tool results: whether the content describes a failure
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            is_error: false,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a final-answer assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create an assistant message that requests tools.
    pub fn assistant_with_tools(content: impl Into<String>, requests: Vec<ToolRequest>) -> Self {
        let mut msg = Self::with_role(Role::Assistant, content);
        msg.tool_calls = requests;
        msg
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create the result message answering `request`.
    pub fn tool_result(request: &ToolRequest, content: impl Into<String>, is_error: bool) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_call_id = Some(request.id.clone());
        msg.tool_name = Some(request.name.clone());
        msg.is_error = is_error;
        msg
    }

    /// Whether this is an assistant message that still needs tools to run.
    /// Incidental text next to tool requests does not make it final.
    pub fn has_tool_requests(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// The accumulating record of one thread: an append-only message sequence
/// plus the tool-iteration counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationState {
    messages: Vec<Message>,

    #[serde(default)]
    iteration: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

impl ConversationState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages in chronological order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Tool-calling iterations counted so far.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn increment_iteration(&mut self) {
        self.iteration += 1;
    }

    pub fn reset_iteration(&mut self) {
        self.iteration = 0;
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Append a user, assistant, or system message.
    ///
    /// Tool results must go through [`push_tool_result`](Self::push_tool_result).
    pub fn push(&mut self, message: Message) -> Result<()> {
        if message.role == Role::Tool {
            return Err(Error::Internal(
                "tool results must be appended with push_tool_result".into(),
            ));
        }
        self.updated_at = Some(Utc::now());
        self.messages.push(message);
        Ok(())
    }

    /// Append the result for `request`. Fails if no earlier assistant message
    /// carried a request with the same id, or if it was already answered.
    pub fn push_tool_result(
        &mut self,
        request: &ToolRequest,
        content: impl Into<String>,
        is_error: bool,
    ) -> Result<()> {
        if !self.has_request(&request.id) {
            return Err(Error::Internal(format!(
                "no tool request with id '{}' precedes this result",
                request.id
            )));
        }
        if self.has_result(&request.id) {
            return Err(Error::Internal(format!(
                "tool request '{}' already has a result",
                request.id
            )));
        }
        self.updated_at = Some(Utc::now());
        self.messages
            .push(Message::tool_result(request, content, is_error));
        Ok(())
    }

    fn has_request(&self, id: &str) -> bool {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .flat_map(|m| m.tool_calls.iter())
            .any(|r| r.id == id)
    }

    fn has_result(&self, id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(id))
    }

    /// Requests of the last message if it is an assistant message whose tools
    /// have not run yet.
    pub fn pending_tool_requests(&self) -> &[ToolRequest] {
        match self.messages.last() {
            Some(last) if last.has_tool_requests() => &last.tool_calls,
            _ => &[],
        }
    }

    /// The most recent message, if any.
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Content of the most recent user message.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}
