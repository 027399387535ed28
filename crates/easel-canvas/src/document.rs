//! The canvas document interface the reconciler writes through.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use easel_core::error::EaselError;
use easel_core::types::{NodeId, Point, Size};

/// Node type used for every generation node the agent creates.
pub const AI_NODE_TYPE: &str = "ai-node";

/// A node living in the canvas document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasNode {
    pub id: NodeId,
    pub position: Point,
    pub size: Size,
    pub node_type: String,
    pub props: serde_json::Map<String, serde_json::Value>,
    /// Invocation that created this node, if the agent created it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_invocation: Option<String>,
}

impl CanvasNode {
    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(|v| v.as_str())
    }
}

/// Everything needed to create a node; the document assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub position: Point,
    pub size: Size,
    pub node_type: String,
    pub props: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_invocation: Option<String>,
}

impl NodeSpec {
    pub fn ai_node(position: Point, size: Size) -> Self {
        Self {
            position,
            size,
            node_type: AI_NODE_TYPE.to_string(),
            props: serde_json::Map::new(),
            source_invocation: None,
        }
    }

    pub fn with_prop(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.props.insert(key.to_string(), value.into());
        self
    }

    pub fn spawned_by(mut self, invocation_id: impl Into<String>) -> Self {
        self.source_invocation = Some(invocation_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CanvasError {
    #[error("node not found: {0}")]
    NotFound(NodeId),

    #[error("document rejected node creation: {0}")]
    Rejected(String),
}

impl From<CanvasError> for EaselError {
    fn from(err: CanvasError) -> Self {
        EaselError::Canvas(err.to_string())
    }
}

/// The spatial node graph the reconciler mutates.
///
/// Every mutation is synchronous: when a call returns, readers of the
/// document observe its effect.
pub trait CanvasDocument {
    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, CanvasError>;

    fn remove_node(&mut self, id: &str) -> Result<(), CanvasError>;

    /// Replace a node's props wholesale.
    fn update_node_props(
        &mut self,
        id: &str,
        props: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), CanvasError>;

    fn node(&self, id: &str) -> Option<&CanvasNode>;

    /// All nodes in creation order.
    fn nodes(&self) -> Vec<&CanvasNode>;

    fn viewport_center(&self) -> Point;

    fn selected_ids(&self) -> Vec<NodeId> {
        Vec::new()
    }
}
