//! # routeqa core
//!
//! Domain types, traits, and error definitions for the routeqa
//! question-answering agent. Everything the loop talks to (the language
//! model, tools, corpora, persistence) is a trait defined here; the other
//! crates implement against it.

pub mod document;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod state;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use document::{DocumentStore, Embedder, Passage, SearchMode};
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use message::{ConversationState, Message, Role, ThreadId, ToolRequest};
pub use provider::{Provider, ProviderRequest, ProviderResponse, ToolDefinition};
pub use state::StateStore;
pub use tool::{FnTool, Tool, ToolRegistry};
