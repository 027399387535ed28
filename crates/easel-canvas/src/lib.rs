//! Canvas document host for agent-driven node graphs.
//!
//! The reconciler mutates a [`CanvasDocument`]; [`InMemoryCanvas`] is the
//! local implementation, and [`LayoutPlanner`] decides where batches of new
//! nodes land.

pub mod document;
pub mod layout;
pub mod memory;
pub mod protocol;

pub use document::{CanvasDocument, CanvasError, CanvasNode, NodeSpec, AI_NODE_TYPE};
pub use layout::{LayoutError, LayoutPlanner};
pub use memory::InMemoryCanvas;
pub use protocol::CanvasEvent;
