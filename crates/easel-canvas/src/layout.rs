//! Batch placement for newly created nodes.
//!
//! A batch of `n` nodes fans out horizontally around an anchor (normally the
//! viewport centre). Each node reserves one slot of `node_width + gutter`, the
//! batch spans `n * slot` centred on `anchor.x`, and every node shares
//! `anchor.y`. Returned positions are slot centres.

use thiserror::Error;

use easel_core::config::LayoutConfig;
use easel_core::error::EaselError;
use easel_core::types::{Point, Size};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LayoutError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<LayoutError> for EaselError {
    fn from(err: LayoutError) -> Self {
        EaselError::Layout(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayoutPlanner {
    node_size: Size,
    gutter: f64,
}

impl Default for LayoutPlanner {
    fn default() -> Self {
        Self::from_config(&LayoutConfig::default())
    }
}

impl LayoutPlanner {
    pub fn new(node_size: Size, gutter: f64) -> Self {
        Self { node_size, gutter }
    }

    pub fn from_config(config: &LayoutConfig) -> Self {
        Self::new(
            Size::new(config.node_width, config.node_height),
            config.gutter,
        )
    }

    pub fn node_size(&self) -> Size {
        self.node_size
    }

    pub fn slot_width(&self) -> f64 {
        self.node_size.w + self.gutter
    }

    /// Positions for `n` new nodes around `anchor`. Deterministic.
    pub fn plan(&self, n: i64, anchor: Point) -> Result<Vec<Point>, LayoutError> {
        if n < 0 {
            return Err(LayoutError::InvalidArgument(format!(
                "node count must be non-negative, got {n}"
            )));
        }

        let slot = self.slot_width();
        let mid = (n as f64 - 1.0) / 2.0;
        Ok((0..n)
            .map(|i| Point::new(anchor.x + (i as f64 - mid) * slot, anchor.y))
            .collect())
    }

    /// Position for a single node: explicit coordinates win, the anchor fills
    /// in whatever is missing.
    pub fn place_single(&self, anchor: Point, x: Option<f64>, y: Option<f64>) -> Point {
        Point::new(x.unwrap_or(anchor.x), y.unwrap_or(anchor.y))
    }
}
