//! In-memory canvas document.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use easel_core::types::{NodeId, Point};

use crate::document::{CanvasDocument, CanvasError, CanvasNode, NodeSpec};
use crate::protocol::CanvasEvent;

/// A local canvas document that tracks nodes and change subscribers.
#[derive(Debug)]
pub struct InMemoryCanvas {
    nodes: Vec<CanvasNode>,
    viewport_center: Point,
    selected: Vec<NodeId>,
    /// Creation is rejected once the document holds this many nodes.
    max_nodes: Option<usize>,
    subscribers: Vec<mpsc::UnboundedSender<CanvasEvent>>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Default for InMemoryCanvas {
    fn default() -> Self {
        Self::new(Point::default())
    }
}

impl InMemoryCanvas {
    pub fn new(viewport_center: Point) -> Self {
        let now = Utc::now();
        Self {
            nodes: Vec::new(),
            viewport_center,
            selected: Vec::new(),
            max_nodes: None,
            subscribers: Vec::new(),
            created_at: now,
            last_updated: now,
        }
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = Some(max_nodes);
        self
    }

    pub fn set_viewport_center(&mut self, center: Point) {
        self.viewport_center = center;
    }

    pub fn set_selection(&mut self, ids: Vec<NodeId>) {
        self.selected = ids;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes spawned by the given invocation.
    pub fn nodes_from(&self, invocation_id: &str) -> Vec<&CanvasNode> {
        self.nodes
            .iter()
            .filter(|n| n.source_invocation.as_deref() == Some(invocation_id))
            .collect()
    }

    /// Register a subscriber. It immediately receives a snapshot.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CanvasEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(CanvasEvent::Snapshot {
            nodes: self.nodes.clone(),
        });
        self.subscribers.push(tx);
        rx
    }

    fn broadcast(&mut self, event: CanvasEvent) {
        self.last_updated = Utc::now();
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn position_of(&self, id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }
}

impl CanvasDocument for InMemoryCanvas {
    fn create_node(&mut self, spec: NodeSpec) -> Result<NodeId, CanvasError> {
        if let Some(max) = self.max_nodes {
            if self.nodes.len() >= max {
                return Err(CanvasError::Rejected(format!(
                    "document is full ({max} nodes)"
                )));
            }
        }

        let node = CanvasNode {
            id: format!("shape:{}", Uuid::new_v4().simple()),
            position: spec.position,
            size: spec.size,
            node_type: spec.node_type,
            props: spec.props,
            source_invocation: spec.source_invocation,
        };
        let id = node.id.clone();
        debug!(node_id = %id, x = node.position.x, y = node.position.y, "Node created");
        self.nodes.push(node.clone());
        self.broadcast(CanvasEvent::NodeCreated { node });
        Ok(id)
    }

    fn remove_node(&mut self, id: &str) -> Result<(), CanvasError> {
        let index = self
            .position_of(id)
            .ok_or_else(|| CanvasError::NotFound(id.to_string()))?;
        self.nodes.remove(index);
        self.selected.retain(|s| s != id);
        debug!(node_id = %id, "Node removed");
        self.broadcast(CanvasEvent::NodeRemoved { id: id.to_string() });
        Ok(())
    }

    fn update_node_props(
        &mut self,
        id: &str,
        props: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), CanvasError> {
        let index = self
            .position_of(id)
            .ok_or_else(|| CanvasError::NotFound(id.to_string()))?;
        self.nodes[index].props = props;
        let node = self.nodes[index].clone();
        self.broadcast(CanvasEvent::NodeUpdated { node });
        Ok(())
    }

    fn node(&self, id: &str) -> Option<&CanvasNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn nodes(&self) -> Vec<&CanvasNode> {
        self.nodes.iter().collect()
    }

    fn viewport_center(&self) -> Point {
        self.viewport_center
    }

    fn selected_ids(&self) -> Vec<NodeId> {
        self.selected.clone()
    }
}
