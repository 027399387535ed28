//! Mutation executor.
//!
//! Applies one args-complete invocation to the canvas and records the outcome.
//! A batch either lands completely or not at all: when any creation fails,
//! the nodes already created for that invocation are removed again.

use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use easel_canvas::{
    AI_NODE_TYPE, CanvasDocument, CanvasError, CanvasNode, LayoutError, LayoutPlanner, NodeSpec,
};
use easel_core::error::EaselError;
use easel_core::types::{ExecutionOutcome, ExecutionRecord, NodeId, Size, ToolInvocation};

use crate::registry::Registry;
use crate::tools::{
    AnalyzeCanvas, CanvasAction, CreateAiNode, CreateVariationNodes, MediaKind, NodeRef,
    UpdateNodeSettings, ValidationError,
};

const SINGLE_NODE_WIDTH: f64 = 400.0;
const IMAGE_NODE_HEIGHT: f64 = 450.0;
const VIDEO_NODE_HEIGHT: f64 = 500.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecuteError {
    #[error("invocation {0} was already executed")]
    AlreadyExecuted(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("canvas mutation failed: {0}")]
    Mutation(#[from] CanvasError),

    #[error("layout failed: {0}")]
    Layout(#[from] LayoutError),
}

impl From<ExecuteError> for EaselError {
    fn from(err: ExecuteError) -> Self {
        match &err {
            ExecuteError::Validation(e) => e.clone().into(),
            ExecuteError::Mutation(e) => e.clone().into(),
            ExecuteError::Layout(e) => e.clone().into(),
            ExecuteError::AlreadyExecuted(_) => EaselError::Registry(err.to_string()),
        }
    }
}

struct Applied {
    message: String,
    node_ids: Vec<NodeId>,
}

impl Applied {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            node_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Executor {
    planner: LayoutPlanner,
}

impl Executor {
    pub fn new(planner: LayoutPlanner) -> Self {
        Self { planner }
    }

    pub fn planner(&self) -> &LayoutPlanner {
        &self.planner
    }

    /// Apply `invocation` and record the outcome.
    ///
    /// Validation, layout and canvas failures are not errors here: they are
    /// recorded as a `Failed` outcome and returned. The only error is a
    /// refusal to run an invocation that already has a record.
    pub fn execute<C>(
        &self,
        registry: &mut Registry,
        canvas: &mut C,
        invocation: &ToolInvocation,
    ) -> Result<ExecutionOutcome, ExecuteError>
    where
        C: CanvasDocument + ?Sized,
    {
        if registry.has_executed(&invocation.id) {
            return Err(ExecuteError::AlreadyExecuted(invocation.id.clone()));
        }

        let record = match self.apply(canvas, invocation) {
            Ok(applied) => {
                info!(
                    invocation_id = %invocation.id,
                    tool = %invocation.name,
                    nodes = applied.node_ids.len(),
                    "Invocation executed"
                );
                ExecutionRecord::succeeded(&invocation.id, applied.message, applied.node_ids)
            }
            Err(e) => {
                warn!(invocation_id = %invocation.id, tool = %invocation.name, %e, "Invocation failed");
                let mut record = ExecutionRecord::failed(&invocation.id, e.to_string());
                // Nodes a failed rollback could not remove stay traceable.
                record.produced_node_ids = spawned_by(&*canvas, &invocation.id);
                if !record.produced_node_ids.is_empty() {
                    warn!(
                        invocation_id = %invocation.id,
                        nodes = record.produced_node_ids.len(),
                        "Failed invocation left nodes on the canvas"
                    );
                }
                record
            }
        };

        let outcome = record.outcome.clone();
        registry
            .record_execution(record)
            .map_err(|_| ExecuteError::AlreadyExecuted(invocation.id.clone()))?;
        Ok(outcome)
    }

    fn apply<C>(&self, canvas: &mut C, invocation: &ToolInvocation) -> Result<Applied, ExecuteError>
    where
        C: CanvasDocument + ?Sized,
    {
        let args = invocation
            .args
            .as_ref()
            .ok_or_else(|| ValidationError::MissingArguments(invocation.name.clone()))?;
        let action = CanvasAction::parse(&invocation.name, args)?;
        debug!(invocation_id = %invocation.id, ?action, "Applying action");

        match action {
            CanvasAction::CreateVariationNodes(a) => self.create_variations(canvas, &invocation.id, a),
            CanvasAction::CreateAiNode(a) => self.create_ai_node(canvas, &invocation.id, a),
            CanvasAction::GenerateFabric(a) => self.create_styled_image(
                canvas,
                &invocation.id,
                format!(
                    "Seamless fabric texture, {}, high quality, textile pattern, 8k resolution",
                    a.prompt
                ),
                "1:1",
                format!(
                    "Created a fabric generation node for \"{}\". Click 'Generate' on the node to create the texture.",
                    a.prompt
                ),
            ),
            CanvasAction::GeneratePalette(a) => self.create_styled_image(
                canvas,
                &invocation.id,
                format!(
                    "A beautiful color palette for {}, minimalist design, color swatches, hex codes, aesthetic layout",
                    a.prompt
                ),
                "16:9",
                format!(
                    "Created a color palette generation node for \"{}\". Click 'Generate' on the node to see the palette.",
                    a.prompt
                ),
            ),
            CanvasAction::UpdateNodeSettings(a) => update_settings(canvas, a),
            CanvasAction::GenerateContent(a) => generate_content(canvas, a),
            CanvasAction::DeleteNode(a) => delete_node(canvas, a),
            CanvasAction::AnalyzeCanvas(a) => Ok(Applied::message(analyze(&*canvas, a))),
        }
    }

    fn create_variations<C>(
        &self,
        canvas: &mut C,
        invocation_id: &str,
        args: CreateVariationNodes,
    ) -> Result<Applied, ExecuteError>
    where
        C: CanvasDocument + ?Sized,
    {
        let positions = self.planner.plan(args.count, canvas.viewport_center())?;
        let size = self.planner.node_size();

        let mut created: Vec<NodeId> = Vec::with_capacity(positions.len());
        for (position, prompt) in positions.into_iter().zip(args.variations) {
            let spec = NodeSpec::ai_node(position, size)
                .with_prop("prompt", prompt)
                .spawned_by(invocation_id);
            match canvas.create_node(spec) {
                Ok(id) => created.push(id),
                Err(e) => {
                    rollback(canvas, invocation_id, &created);
                    return Err(e.into());
                }
            }
        }

        let n = created.len();
        Ok(Applied {
            message: format!("Created {n} variation node(s)."),
            node_ids: created,
        })
    }

    fn create_ai_node<C>(
        &self,
        canvas: &mut C,
        invocation_id: &str,
        args: CreateAiNode,
    ) -> Result<Applied, ExecuteError>
    where
        C: CanvasDocument + ?Sized,
    {
        let position = self
            .planner
            .place_single(canvas.viewport_center(), args.x, args.y);
        let height = match args.kind {
            MediaKind::Image => IMAGE_NODE_HEIGHT,
            MediaKind::Video => VIDEO_NODE_HEIGHT,
        };
        let parameters = args.parameters.unwrap_or_default();
        let aspect_ratio = parameters
            .get("aspect_ratio")
            .cloned()
            .unwrap_or_else(|| match args.kind {
                MediaKind::Image => json!("3:4"),
                MediaKind::Video => json!("16:9"),
            });

        let mut spec = NodeSpec::ai_node(position, Size::new(SINGLE_NODE_WIDTH, height))
            .with_prop("nodeType", args.kind.as_str())
            .with_prop("prompt", args.prompt.clone())
            .with_prop("modelId", args.model_id.unwrap_or_default())
            .with_prop(
                "model",
                match args.kind {
                    MediaKind::Image => "flux-pro",
                    MediaKind::Video => "kling-pro",
                },
            )
            .with_prop("aspectRatio", aspect_ratio)
            .with_prop("status", "idle")
            .with_prop("references", Value::Array(Vec::new()))
            .spawned_by(invocation_id);
        if args.kind == MediaKind::Video {
            let duration = parameters.get("duration").cloned().unwrap_or(json!("5s"));
            spec = spec
                .with_prop("duration", duration)
                .with_prop("mode", "first_last_frame");
        }
        let spec = spec.with_prop("parameters", Value::Object(parameters));

        let id = canvas.create_node(spec)?;
        Ok(Applied {
            message: format!(
                "Successfully created {} generation node with prompt: \"{}\"",
                args.kind.as_str(),
                args.prompt
            ),
            node_ids: vec![id],
        })
    }

    fn create_styled_image<C>(
        &self,
        canvas: &mut C,
        invocation_id: &str,
        prompt: String,
        aspect_ratio: &str,
        message: String,
    ) -> Result<Applied, ExecuteError>
    where
        C: CanvasDocument + ?Sized,
    {
        let position = canvas.viewport_center();
        let spec = NodeSpec::ai_node(position, Size::new(SINGLE_NODE_WIDTH, IMAGE_NODE_HEIGHT))
            .with_prop("nodeType", "image")
            .with_prop("prompt", prompt)
            .with_prop("model", "flux-pro")
            .with_prop("parameters", json!({ "aspect_ratio": aspect_ratio }))
            .with_prop("aspectRatio", aspect_ratio)
            .with_prop("status", "idle")
            .with_prop("references", Value::Array(Vec::new()))
            .spawned_by(invocation_id);
        let id = canvas.create_node(spec)?;
        Ok(Applied {
            message,
            node_ids: vec![id],
        })
    }
}

/// Remove the nodes of a partially applied batch, newest first.
fn rollback<C>(canvas: &mut C, invocation_id: &str, created: &[NodeId])
where
    C: CanvasDocument + ?Sized,
{
    warn!(invocation_id, nodes = created.len(), "Rolling back partial batch");
    for id in created.iter().rev() {
        if let Err(e) = canvas.remove_node(id) {
            warn!(invocation_id, node_id = %id, %e, "Rollback could not remove node");
        }
    }
}

fn spawned_by<C>(canvas: &C, invocation_id: &str) -> Vec<NodeId>
where
    C: CanvasDocument + ?Sized,
{
    canvas
        .nodes()
        .into_iter()
        .filter(|n| n.source_invocation.as_deref() == Some(invocation_id))
        .map(|n| n.id.clone())
        .collect()
}

fn ai_node<'a, C>(canvas: &'a C, node_id: &str) -> Result<&'a CanvasNode, ValidationError>
where
    C: CanvasDocument + ?Sized,
{
    canvas
        .node(node_id)
        .filter(|n| n.node_type == AI_NODE_TYPE)
        .ok_or_else(|| ValidationError::NotAnAiNode(node_id.to_string()))
}

fn update_settings<C>(canvas: &mut C, args: UpdateNodeSettings) -> Result<Applied, ExecuteError>
where
    C: CanvasDocument + ?Sized,
{
    let mut props = ai_node(&*canvas, &args.node_id)?.props.clone();

    if let Some(prompt) = args.prompt {
        props.insert("prompt".into(), Value::String(prompt));
    }
    if let Some(model_id) = args.model_id {
        props.insert("modelId".into(), Value::String(model_id));
    }
    if let Some(updates) = args.parameters {
        let mut merged = match props.remove("parameters") {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        merged.extend(updates);
        props.insert("parameters".into(), Value::Object(merged));
    }

    canvas.update_node_props(&args.node_id, props)?;
    Ok(Applied::message(format!(
        "Successfully updated node {}",
        args.node_id
    )))
}

fn generate_content<C>(canvas: &mut C, args: NodeRef) -> Result<Applied, ExecuteError>
where
    C: CanvasDocument + ?Sized,
{
    let node = ai_node(&*canvas, &args.node_id)?;
    let prompt = node.prop_str("prompt").unwrap_or_default().to_string();
    if prompt.is_empty() {
        return Err(ValidationError::MissingPrompt(args.node_id).into());
    }
    let model = [node.prop_str("modelId"), node.prop_str("model")]
        .into_iter()
        .flatten()
        .find(|m| !m.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ValidationError::MissingModel(args.node_id.clone()))?;

    let mut props = node.props.clone();
    props.insert("status".into(), Value::String("generating".into()));
    canvas.update_node_props(&args.node_id, props)?;

    Ok(Applied::message(format!(
        "Generation started for node {}. The node will generate content using model {model} with prompt: \"{prompt}\"",
        args.node_id
    )))
}

fn delete_node<C>(canvas: &mut C, args: NodeRef) -> Result<Applied, ExecuteError>
where
    C: CanvasDocument + ?Sized,
{
    ai_node(&*canvas, &args.node_id)?;
    canvas.remove_node(&args.node_id)?;
    Ok(Applied::message(format!(
        "Successfully deleted node {}",
        args.node_id
    )))
}

fn analyze<C>(canvas: &C, args: AnalyzeCanvas) -> String
where
    C: CanvasDocument + ?Sized,
{
    let selected = canvas.selected_ids();
    let nodes: Vec<&CanvasNode> = canvas
        .nodes()
        .into_iter()
        .filter(|n| n.node_type == AI_NODE_TYPE)
        .filter(|n| !args.include_selected || selected.contains(&n.id))
        .collect();

    if nodes.is_empty() {
        return "No AI nodes found on the canvas.".to_string();
    }

    let summary: Vec<Value> = nodes.iter().map(|n| describe(n)).collect();
    let body = serde_json::to_string_pretty(&summary).unwrap_or_default();
    format!("Found {} AI node(s) on canvas:\n{body}", nodes.len())
}

fn describe(node: &CanvasNode) -> Value {
    let model_id = [node.prop_str("modelId"), node.prop_str("model")]
        .into_iter()
        .flatten()
        .find(|m| !m.is_empty())
        .unwrap_or("default");
    let has_result = ["imageUrl", "videoUrl"]
        .iter()
        .any(|k| node.prop_str(k).is_some_and(|v| !v.is_empty()));
    json!({
        "id": node.id,
        "nodeType": node.props.get("nodeType").cloned().unwrap_or(Value::Null),
        "prompt": node.props.get("prompt").cloned().unwrap_or(Value::Null),
        "model_id": model_id,
        "status": node.props.get("status").cloned().unwrap_or(Value::Null),
        "has_result": has_result,
        "parameters": node.props.get("parameters").cloned().unwrap_or_else(|| json!({})),
        "position": { "x": node.position.x, "y": node.position.y },
        "source_invocation": node.source_invocation,
    })
}
