//! Invocation registry.
//!
//! Tracks every invocation by id across its lifecycle and holds the
//! append-only execution records that make execution exactly-once.

use std::collections::HashMap;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, trace};

use easel_core::error::EaselError;
use easel_core::types::{
    ExecutionRecord, InvocationId, InvocationResult, InvocationState, ToolInvocation,
};
use easel_stream::{InvocationEvent, InvocationEventKind};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("invocation {0} already has an execution record")]
    AlreadyRecorded(InvocationId),
}

impl From<RegistryError> for EaselError {
    fn from(err: RegistryError) -> Self {
        EaselError::Registry(err.to_string())
    }
}

/// What an update carries.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateKind {
    Fragment(String),
    ArgsComplete(Value),
    /// Move to a later state. Ignored unless it is a forward move.
    Advance(InvocationState),
    /// Fail with an error message in the result slot.
    Fail(String),
    /// The agent's own result; informational.
    AgentResult(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationUpdate {
    pub id: InvocationId,
    pub turn_id: String,
    pub name: String,
    pub kind: UpdateKind,
}

impl From<InvocationEvent> for InvocationUpdate {
    fn from(event: InvocationEvent) -> Self {
        let kind = match event.kind {
            InvocationEventKind::Fragment(text) => UpdateKind::Fragment(text),
            InvocationEventKind::Complete(args) => UpdateKind::ArgsComplete(args),
            InvocationEventKind::Result(result) => UpdateKind::AgentResult(result),
            InvocationEventKind::Error(message) => UpdateKind::AgentResult(json!({ "error": message })),
            InvocationEventKind::Malformed(err) => UpdateKind::Fail(err.to_string()),
        };
        Self {
            id: event.invocation_id,
            turn_id: event.turn_id,
            name: event.name,
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// The id was seen for the first time.
    pub created: bool,
    /// The invocation entered ArgsComplete with this update.
    pub newly_complete: bool,
    /// The invocation entered Failed with this update.
    pub newly_failed: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    invocations: HashMap<InvocationId, ToolInvocation>,
    /// Ids in first-seen order.
    order: Vec<InvocationId>,
    records: Vec<ExecutionRecord>,
    record_index: HashMap<InvocationId, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an update by id. Stale or repeated updates are no-ops.
    pub fn upsert(&mut self, update: InvocationUpdate) -> UpsertOutcome {
        let mut outcome = UpsertOutcome::default();
        let InvocationUpdate {
            id,
            turn_id,
            name,
            kind,
        } = update;

        if !self.invocations.contains_key(&id) {
            outcome.created = true;
            self.order.push(id.clone());
        }
        let inv = self
            .invocations
            .entry(id.clone())
            .or_insert_with(|| ToolInvocation::new(id.clone(), turn_id, name.clone()));
        if inv.name.is_empty() && !name.is_empty() {
            inv.name = name;
        }

        match kind {
            UpdateKind::Fragment(text) => {
                if inv.state == InvocationState::Streaming {
                    inv.args_fragments.push(text);
                } else {
                    trace!(invocation_id = %id, state = ?inv.state, "Ignoring late fragment");
                }
            }
            UpdateKind::ArgsComplete(args) => {
                if inv.state.can_advance_to(InvocationState::ArgsComplete) {
                    inv.args = Some(args);
                    inv.state = InvocationState::ArgsComplete;
                    outcome.newly_complete = true;
                } else {
                    debug!(invocation_id = %id, state = ?inv.state, "Duplicate completion ignored");
                }
            }
            UpdateKind::Advance(state) => {
                if inv.state.can_advance_to(state) {
                    inv.state = state;
                }
            }
            UpdateKind::Fail(error) => {
                if inv.state.can_advance_to(InvocationState::Failed) {
                    inv.state = InvocationState::Failed;
                    inv.result = Some(InvocationResult {
                        content: error,
                        is_error: true,
                    });
                    outcome.newly_failed = true;
                }
            }
            UpdateKind::AgentResult(result) => inv.agent_result = Some(result),
        }
        outcome
    }

    /// The idempotency gate.
    pub fn has_executed(&self, id: &str) -> bool {
        self.record_index.contains_key(id)
    }

    /// Append the one record an invocation may ever have, and move the
    /// invocation (if still tracked) to its terminal state.
    pub fn record_execution(&mut self, record: ExecutionRecord) -> Result<(), RegistryError> {
        let id = record.invocation_id.clone();
        if self.record_index.contains_key(&id) {
            return Err(RegistryError::AlreadyRecorded(id));
        }

        if let Some(inv) = self.invocations.get_mut(&id) {
            inv.state = if record.outcome.is_success() {
                InvocationState::Executed
            } else {
                InvocationState::Failed
            };
            inv.result = Some(InvocationResult {
                content: record.outcome.message().to_string(),
                is_error: !record.outcome.is_success(),
            });
        }

        self.record_index.insert(id, self.records.len());
        self.records.push(record);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ToolInvocation> {
        self.invocations.get(id)
    }

    /// Invocations of one turn, in first-seen order.
    pub fn turn_invocations(&self, turn_id: &str) -> Vec<&ToolInvocation> {
        self.order
            .iter()
            .filter_map(|id| self.invocations.get(id))
            .filter(|inv| inv.turn_id == turn_id)
            .collect()
    }

    pub fn record(&self, id: &str) -> Option<&ExecutionRecord> {
        self.record_index.get(id).map(|&i| &self.records[i])
    }

    /// All records in append order.
    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    /// Cancel every Streaming or ArgsComplete invocation of a turn. Returns
    /// the ids that were cancelled.
    pub fn cancel_turn(&mut self, turn_id: &str) -> Vec<InvocationId> {
        let mut cancelled = Vec::new();
        for id in &self.order {
            let Some(inv) = self.invocations.get_mut(id) else {
                continue;
            };
            if inv.turn_id == turn_id && inv.state.is_cancellable() {
                inv.state = InvocationState::Cancelled;
                inv.result = Some(InvocationResult {
                    content: "cancelled".into(),
                    is_error: true,
                });
                cancelled.push(id.clone());
            }
        }
        cancelled
    }

    /// Drop every invocation of a turn. Execution records are kept.
    pub fn discard_turn(&mut self, turn_id: &str) {
        self.invocations.retain(|_, inv| inv.turn_id != turn_id);
        let invocations = &self.invocations;
        self.order.retain(|id| invocations.contains_key(id));
        debug!(turn_id, "Discarded turn invocations");
    }

    /// Forget everything, records included.
    pub fn reset(&mut self) {
        self.invocations.clear();
        self.order.clear();
        self.records.clear();
        self.record_index.clear();
    }

    pub fn len(&self) -> usize {
        self.invocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invocations.is_empty()
    }
}
