//! Agent stream decoding.
//!
//! An agent response arrives as a chunked byte stream. [`framing`] and [`sse`]
//! turn the bytes into [`WireRecord`]s, and [`decoder`] turns records into
//! per-invocation [`StreamEvent`]s the reconciler consumes.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use easel_core::config::Framing;
use easel_core::error::EaselError;

pub mod client_action;
pub mod decoder;
pub mod framing;
pub mod http;
pub mod sse;

pub use decoder::{DecodeError, DecoderOptions, InvocationDecoder, decode, decode_records};
pub use http::HttpTransport;

/// Raw transport chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// Decoded events, ready for the reconciler.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamError>> + Send>>;

/// Failures that end the stream. Per-invocation problems are reported as
/// [`InvocationEventKind::Malformed`] instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<StreamError> for EaselError {
    fn from(err: StreamError) -> Self {
        EaselError::Transport(err.to_string())
    }
}

/// One framed record from the agent transport, independent of wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum WireRecord {
    /// A response (or response step) started; carries the message id.
    TurnStart { turn_id: String },
    Text(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, delta: String },
    /// Arguments are final. `args` may be an object, a JSON string, or null
    /// when only the streamed deltas carry them.
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolResult { id: String, result: serde_json::Value },
    ToolError { id: String, error: String },
    Error(String),
    Finish { reason: Option<String> },
}

/// What happened to one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationEventKind {
    /// Partial argument text, in wire order.
    Fragment(String),
    /// Arguments are complete and parsed into a JSON object.
    Complete(serde_json::Value),
    /// The agent's own result for this call.
    Result(serde_json::Value),
    /// The agent reported an error for this call.
    Error(String),
    /// The arguments could not be decoded.
    Malformed(DecodeError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationEvent {
    pub invocation_id: String,
    pub turn_id: String,
    /// Tool name. Empty only for a `Malformed` event on a call whose name
    /// never arrived.
    pub name: String,
    pub kind: InvocationEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TurnStarted { turn_id: String },
    Text { turn_id: String, delta: String },
    Invocation(InvocationEvent),
    /// The agent reported an error for the whole response.
    AgentError { turn_id: String, message: String },
    TurnFinished {
        turn_id: String,
        finish_reason: Option<String>,
    },
}

impl StreamEvent {
    pub fn turn_id(&self) -> &str {
        match self {
            Self::TurnStarted { turn_id }
            | Self::Text { turn_id, .. }
            | Self::AgentError { turn_id, .. }
            | Self::TurnFinished { turn_id, .. } => turn_id,
            Self::Invocation(ev) => &ev.turn_id,
        }
    }
}

/// A chat message sent to the agent endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Request body for opening one agent turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
}

impl ChatRequest {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage {
                role: "user".into(),
                content: text.into(),
            }],
            model: None,
            tools: None,
        }
    }
}

/// Source of agent byte streams.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Transport identifier (e.g., "http").
    fn id(&self) -> &str;

    /// Start one agent turn and return its raw response body.
    async fn open(&self, request: &ChatRequest) -> anyhow::Result<ByteStream>;
}

/// Build a byte stream from in-memory chunks (recorded streams, tests).
pub fn byte_stream_from<I, C>(chunks: I) -> ByteStream
where
    I: IntoIterator<Item = C>,
    C: Into<Bytes>,
{
    let chunks: Vec<Result<Bytes, StreamError>> =
        chunks.into_iter().map(|c| Ok(c.into())).collect();
    Box::pin(futures::stream::iter(chunks))
}

/// Open one turn on `transport` and decode its response.
pub async fn decode_transport(
    transport: &dyn AgentTransport,
    request: &ChatRequest,
    framing: Framing,
    options: DecoderOptions,
) -> anyhow::Result<EventStream> {
    let bytes = transport.open(request).await?;
    Ok(decode(bytes, framing, options))
}
