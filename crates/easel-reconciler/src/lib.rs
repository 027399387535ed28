//! Agent-to-canvas reconciliation.
//!
//! The [`Reconciler`] consumes decoded agent stream events, tracks every tool
//! invocation in a [`Registry`], and applies each completed invocation to the
//! canvas exactly once through the [`Executor`]. Progress is reported as a
//! stream of [`ReconcilerEvent`]s for the chat surface.

use serde::{Deserialize, Serialize};

pub mod driver;
pub mod executor;
pub mod registry;
pub mod tools;

pub use driver::{DriverState, Reconciler};
pub use executor::{ExecuteError, Executor};
pub use registry::{InvocationUpdate, Registry, RegistryError, UpdateKind, UpsertOutcome};
pub use tools::{CanvasAction, ValidationError, tool_definitions};

/// Events emitted by the reconciler while a turn is processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReconcilerEvent {
    #[serde(rename = "turn_started")]
    TurnStarted { turn_id: String },

    /// Chat text, passed through untouched.
    #[serde(rename = "text_delta")]
    TextDelta { turn_id: String, delta: String },

    /// An invocation is about to be applied.
    #[serde(rename = "tool_call")]
    ToolCall {
        invocation_id: String,
        tool: String,
        args: serde_json::Value,
    },

    /// Local outcome of an invocation (executed, failed or cancelled).
    #[serde(rename = "tool_result")]
    ToolResult {
        invocation_id: String,
        tool: String,
        content: String,
        is_error: bool,
    },

    /// The agent's own result for an invocation.
    #[serde(rename = "agent_result")]
    AgentResult {
        invocation_id: String,
        tool: String,
        result: serde_json::Value,
    },

    #[serde(rename = "agent_error")]
    AgentError { turn_id: String, message: String },

    #[serde(rename = "turn_finished")]
    TurnFinished { summary: TurnSummary },
}

/// Counts for one finished (or aborted) turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub turn_id: String,
    pub executed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub skipped_duplicates: usize,
    pub aborted: bool,
}
