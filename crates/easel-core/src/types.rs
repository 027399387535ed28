use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of one tool call, assigned by the agent stream.
pub type InvocationId = String;

/// Identity of one agent response cycle.
pub type TurnId = String;

/// Identity of a node in the canvas document.
pub type NodeId = String;

/// A point in canvas page coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub w: f64,
    pub h: f64,
}

impl Size {
    pub const fn new(w: f64, h: f64) -> Self {
        Self { w, h }
    }
}

/// Lifecycle state of a [`ToolInvocation`].
///
/// States are totally ordered by [`InvocationState::rank`]; the three terminal
/// states share the highest rank so none of them can replace another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Streaming,
    ArgsComplete,
    Executing,
    Executed,
    Failed,
    Cancelled,
}

impl InvocationState {
    pub fn rank(self) -> u8 {
        match self {
            Self::Streaming => 0,
            Self::ArgsComplete => 1,
            Self::Executing => 2,
            Self::Executed | Self::Failed | Self::Cancelled => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_advance_to(self, next: InvocationState) -> bool {
        next.rank() > self.rank()
    }

    /// Whether a turn cancellation may still stop this invocation.
    pub fn is_cancellable(self) -> bool {
        matches!(self, Self::Streaming | Self::ArgsComplete)
    }
}

/// One discrete request by the agent to perform a side-effecting action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: InvocationId,
    pub turn_id: TurnId,
    pub name: String,
    pub args_fragments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    pub state: InvocationState,
    /// Local execution result, or the error message for a failed invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<InvocationResult>,
    /// Result the agent stream reported on its own. Never drives execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_result: Option<serde_json::Value>,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, turn_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            turn_id: turn_id.into(),
            name: name.into(),
            args_fragments: Vec::new(),
            args: None,
            state: InvocationState::Streaming,
            result: None,
            agent_result: None,
        }
    }

    /// The concatenated argument text received so far.
    pub fn args_text(&self) -> String {
        self.args_fragments.concat()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub content: String,
    pub is_error: bool,
}

/// Outcome stored in an [`ExecutionRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded { message: String },
    Failed { error: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// The text surfaced in the invocation's result slot.
    pub fn message(&self) -> &str {
        match self {
            Self::Succeeded { message } => message,
            Self::Failed { error } => error,
        }
    }
}

/// Append-only evidence that an invocation was applied (or definitively failed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub invocation_id: InvocationId,
    pub executed_at: DateTime<Utc>,
    pub outcome: ExecutionOutcome,
    pub produced_node_ids: Vec<NodeId>,
}

impl ExecutionRecord {
    pub fn succeeded(
        invocation_id: impl Into<String>,
        message: impl Into<String>,
        produced_node_ids: Vec<NodeId>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            executed_at: Utc::now(),
            outcome: ExecutionOutcome::Succeeded {
                message: message.into(),
            },
            produced_node_ids,
        }
    }

    pub fn failed(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            executed_at: Utc::now(),
            outcome: ExecutionOutcome::Failed {
                error: error.into(),
            },
            produced_node_ids: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        use InvocationState::*;
        assert!(Streaming.can_advance_to(ArgsComplete));
        assert!(ArgsComplete.can_advance_to(Executing));
        assert!(Streaming.can_advance_to(Cancelled));
        assert!(Executing.can_advance_to(Executed));
        assert!(!Executed.can_advance_to(Failed));
        assert!(!Cancelled.can_advance_to(ArgsComplete));
        assert!(!Executing.can_advance_to(ArgsComplete));
        assert!(!Streaming.can_advance_to(Streaming));
    }

    #[test]
    fn test_cancellable_states() {
        assert!(InvocationState::Streaming.is_cancellable());
        assert!(InvocationState::ArgsComplete.is_cancellable());
        assert!(!InvocationState::Executing.is_cancellable());
        assert!(!InvocationState::Executed.is_cancellable());
    }

    #[test]
    fn test_args_text_concatenates_in_order() {
        let mut inv = ToolInvocation::new("t1", "turn-1", "create_variation_nodes");
        inv.args_fragments.push(r#"{"count":"#.into());
        inv.args_fragments.push("2}".into());
        assert_eq!(inv.args_text(), r#"{"count":2}"#);
    }

    #[test]
    fn test_outcome_serialization() {
        let record = ExecutionRecord::failed("t1", "boom");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["error"], "boom");
        assert!(!record.outcome.is_success());
    }
}
