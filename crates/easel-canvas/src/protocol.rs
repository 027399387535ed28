//! Change events broadcast by a canvas document.

use serde::{Deserialize, Serialize};

use crate::document::CanvasNode;

/// Events sent to document subscribers after each mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanvasEvent {
    /// A node was added.
    NodeCreated { node: CanvasNode },
    /// A node's props were replaced.
    NodeUpdated { node: CanvasNode },
    /// A node was removed.
    NodeRemoved { id: String },
    /// Full snapshot of all nodes, sent to new subscribers.
    Snapshot { nodes: Vec<CanvasNode> },
}
