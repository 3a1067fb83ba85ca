//! # routeqa agent
//!
//! The routing loop that turns one user utterance into one answer:
//!
//! - [`DecisionStep`] asks the model to answer or to request tools
//! - [`ToolExecutor`] runs a batch of tool requests and bounds their output
//! - [`AgentLoop`] alternates the two until an answer or the iteration ceiling
//! - [`TurnService`] loads and saves thread state around each turn

pub mod decision;
pub mod executor;
pub mod loop_runner;
pub mod service;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use decision::{APOLOGY, Decision, DecisionStep};
pub use executor::{ToolExecutor, ToolOutcome, normalize_arguments, truncate_output};
pub use loop_runner::{AgentLoop, TurnOutcome};
pub use service::TurnService;
pub use stream_event::{CompletedTool, TurnEvent};
