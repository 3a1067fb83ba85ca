//! Turn-level progress events.
//!
//! `TurnEvent` is what a front-end sees while a turn runs: which tools were
//! requested, how they finished, and finally the answer or the failure.

use serde::{Deserialize, Serialize};

/// Outcome of one tool request, without its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTool {
    pub id: String,
    pub name: String,
    pub success: bool,
}

/// Events emitted by a streaming turn.
///
/// - `tools_requested`: the model asked for one or more tools
/// - `tools_completed`: the whole batch finished
/// - `answer`: the final answer, always the last event of a good turn
/// - `failed`: the turn was aborted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    ToolsRequested { names: Vec<String> },

    ToolsCompleted { results: Vec<CompletedTool> },

    Answer { content: String },

    Failed { message: String },
}

impl TurnEvent {
    /// Event name, matching the serialized `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ToolsRequested { .. } => "tools_requested",
            Self::ToolsCompleted { .. } => "tools_completed",
            Self::Answer { .. } => "answer",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Answer { .. } | Self::Failed { .. })
    }
}
