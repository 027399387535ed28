//! Canvas tool payloads and their LLM-facing definitions.
//!
//! Every tool the agent may call is one [`CanvasAction`] variant. Arguments
//! are parsed and validated here, before anything touches the document.

use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

use easel_core::error::EaselError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("missing arguments for {0}")]
    MissingArguments(String),

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("count must be a non-negative integer, got {0}")]
    NegativeCount(i64),

    #[error("count ({count}) does not match the number of variations ({variations})")]
    CountMismatch { count: i64, variations: usize },

    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("Node with ID {0} not found or is not an AI node")]
    NotAnAiNode(String),

    #[error(
        "Node {0} does not have a prompt. Please set a prompt first using update_node_settings."
    )]
    MissingPrompt(String),

    #[error(
        "Node {0} does not have a model selected. Please select a model first using update_node_settings."
    )]
    MissingModel(String),
}

impl From<ValidationError> for EaselError {
    fn from(err: ValidationError) -> Self {
        EaselError::Validation(err.to_string())
    }
}

/// Kind of generation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateVariationNodes {
    pub count: i64,
    pub variations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateAiNode {
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub prompt: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PromptArgs {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateNodeSettings {
    pub node_id: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub parameters: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeRef {
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct AnalyzeCanvas {
    #[serde(default)]
    pub include_selected: bool,
}

/// A validated tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum CanvasAction {
    CreateVariationNodes(CreateVariationNodes),
    CreateAiNode(CreateAiNode),
    GenerateFabric(PromptArgs),
    GeneratePalette(PromptArgs),
    UpdateNodeSettings(UpdateNodeSettings),
    GenerateContent(NodeRef),
    DeleteNode(NodeRef),
    AnalyzeCanvas(AnalyzeCanvas),
}

impl CanvasAction {
    /// Parse and validate the arguments of tool `name`.
    pub fn parse(name: &str, args: &Value) -> Result<Self, ValidationError> {
        let action = match name {
            "create_variation_nodes" => Self::CreateVariationNodes(payload(name, args)?),
            "create_ai_node" => Self::CreateAiNode(payload(name, args)?),
            "generate_fabric" => Self::GenerateFabric(payload(name, args)?),
            "generate_palette" => Self::GeneratePalette(payload(name, args)?),
            "update_node_settings" => Self::UpdateNodeSettings(payload(name, args)?),
            "generate_content" => Self::GenerateContent(payload(name, args)?),
            "delete_node" => Self::DeleteNode(payload(name, args)?),
            "analyze_canvas" => Self::AnalyzeCanvas(payload(name, args)?),
            other => return Err(ValidationError::UnknownTool(other.to_string())),
        };
        action.validate()?;
        Ok(action)
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::CreateVariationNodes(_) => "create_variation_nodes",
            Self::CreateAiNode(_) => "create_ai_node",
            Self::GenerateFabric(_) => "generate_fabric",
            Self::GeneratePalette(_) => "generate_palette",
            Self::UpdateNodeSettings(_) => "update_node_settings",
            Self::GenerateContent(_) => "generate_content",
            Self::DeleteNode(_) => "delete_node",
            Self::AnalyzeCanvas(_) => "analyze_canvas",
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::CreateVariationNodes(a) => {
                if a.count < 0 {
                    return Err(ValidationError::NegativeCount(a.count));
                }
                if a.count as usize != a.variations.len() {
                    return Err(ValidationError::CountMismatch {
                        count: a.count,
                        variations: a.variations.len(),
                    });
                }
                Ok(())
            }
            Self::GenerateFabric(a) | Self::GeneratePalette(a) if a.prompt.trim().is_empty() => {
                Err(ValidationError::EmptyPrompt)
            }
            _ => Ok(()),
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(tool: &str, args: &Value) -> Result<T, ValidationError> {
    serde_json::from_value(args.clone()).map_err(|e| ValidationError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

/// A tool as advertised to the model.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters_schema: Value,
}

pub fn definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "create_variation_nodes",
            description: "Create several AI image nodes side by side, one per prompt variation. \
                          Use this when the user asks for variations or alternatives.",
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "count": {
                        "type": "integer",
                        "minimum": 0,
                        "description": "Number of nodes to create; must equal the number of variations"
                    },
                    "variations": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "One generation prompt per node"
                    }
                },
                "required": ["count", "variations"]
            }),
        },
        ToolDefinition {
            name: "create_ai_node",
            description: "Create a new AI generation node (image or video) on the canvas. \
                          Use this when the user wants to generate new content.",
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "type": {
                        "type": "string",
                        "enum": ["image", "video"],
                        "description": "The type of generation node to create"
                    },
                    "prompt": { "type": "string", "description": "The generation prompt for the AI model" },
                    "model_id": { "type": "string", "description": "Optional: Specific model ID to use" },
                    "parameters": { "type": "object", "description": "Optional: Model-specific parameters" },
                    "x": { "type": "number", "description": "Optional: X position on canvas" },
                    "y": { "type": "number", "description": "Optional: Y position on canvas" }
                },
                "required": ["type", "prompt"]
            }),
        },
        ToolDefinition {
            name: "update_node_settings",
            description: "Update the settings (model, parameters, prompt) of an existing AI generation \
                          node on the canvas. Use this when the user wants to modify an existing node.",
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "node_id": { "type": "string", "description": "The ID of the node to update" },
                    "prompt": { "type": "string", "description": "Optional: New prompt for the node" },
                    "model_id": { "type": "string", "description": "Optional: New model ID to use" },
                    "parameters": { "type": "object", "description": "Optional: Updated parameters" }
                },
                "required": ["node_id"]
            }),
        },
        ToolDefinition {
            name: "analyze_canvas",
            description: "Analyze the current canvas state. Returns information about all AI nodes on \
                          the canvas, including their prompts, models, and status.",
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "include_selected": {
                        "type": "boolean",
                        "description": "If true, only analyze selected nodes"
                    }
                }
            }),
        },
        ToolDefinition {
            name: "generate_content",
            description: "Trigger generation for an existing AI node.",
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "node_id": { "type": "string", "description": "The ID of the node to generate content for" }
                },
                "required": ["node_id"]
            }),
        },
        ToolDefinition {
            name: "delete_node",
            description: "Delete an AI node from the canvas.",
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "node_id": { "type": "string", "description": "The ID of the node to delete" }
                },
                "required": ["node_id"]
            }),
        },
        ToolDefinition {
            name: "generate_fabric",
            description: "Generate fabric textures based on a description.",
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "Description of the fabric texture" }
                },
                "required": ["prompt"]
            }),
        },
        ToolDefinition {
            name: "generate_palette",
            description: "Generate a color palette based on a description.",
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": { "type": "string", "description": "Description of the mood or theme" }
                },
                "required": ["prompt"]
            }),
        },
    ]
}

/// Tool definitions in the OpenAI `function` shape, ready for a chat request.
pub fn tool_definitions() -> Vec<Value> {
    definitions()
        .into_iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema,
                }
            })
        })
        .collect()
}
