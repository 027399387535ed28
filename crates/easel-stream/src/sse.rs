//! Server-Sent Events framing.
//!
//! [`parse_sse_stream`] is a generic SSE line parser; [`sse_records`] maps the
//! JSON chunks of a UI message stream onto [`WireRecord`]s.

use futures::Stream;
use serde::Deserialize;
use tokio_stream::StreamExt;
use tracing::warn;

use crate::framing::LineBuffer;
use crate::{ByteStream, StreamError, WireRecord};

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

struct SseState {
    bytes: ByteStream,
    lines: LineBuffer,
    current_event: Option<String>,
    current_data: Vec<String>,
    current_id: Option<String>,
    done: bool,
}

impl SseState {
    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            return None;
        }
        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        Some(event)
    }
}

/// Parse a byte stream as SSE events.
pub fn parse_sse_stream(bytes: ByteStream) -> impl Stream<Item = Result<SseEvent, StreamError>> + Send {
    futures::stream::unfold(
        SseState {
            bytes,
            lines: LineBuffer::default(),
            current_event: None,
            current_data: Vec::new(),
            current_id: None,
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(line) = state.lines.next_line() {
                    if line.is_empty() {
                        // Empty line = dispatch event
                        if let Some(event) = state.dispatch() {
                            return Some((Ok(event), state));
                        }
                        continue;
                    }

                    if line.starts_with(':') {
                        // Comment, skip
                        continue;
                    }

                    if let Some(value) = line.strip_prefix("event:") {
                        state.current_event = Some(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    } else if let Some(value) = line.strip_prefix("id:") {
                        state.current_id = Some(value.trim_start().to_string());
                    }
                    continue;
                }

                if state.done {
                    // Stream ended. Dispatch any remaining data.
                    if let Some(rest) = state.lines.take_rest() {
                        if let Some(value) = rest.strip_prefix("data:") {
                            state.current_data.push(value.trim_start().to_string());
                        }
                    }
                    let event = state.dispatch()?;
                    return Some((Ok(event), state));
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => state.lines.push(&chunk),
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(e), state));
                    }
                    None => state.done = true,
                }
            }
        },
    )
}

/// JSON chunk of a UI message stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
enum UiChunk {
    Start {
        #[serde(default)]
        message_id: Option<String>,
    },
    TextDelta {
        #[serde(default, alias = "textDelta")]
        delta: String,
    },
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
    },
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    ToolInputError {
        tool_call_id: String,
        error_text: String,
    },
    ToolOutputAvailable {
        tool_call_id: String,
        #[serde(default)]
        output: serde_json::Value,
    },
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
    },
    Error {
        error_text: String,
    },
    Finish {
        #[serde(default)]
        finish_reason: Option<String>,
    },
    #[serde(other)]
    Other,
}

/// Map one SSE data payload onto a record. `Ok(None)` for chunks the decoder
/// does not need.
pub fn parse_ui_chunk(data: &str) -> Result<Option<WireRecord>, serde_json::Error> {
    let chunk: UiChunk = serde_json::from_str(data)?;
    let record = match chunk {
        UiChunk::Start { message_id } => match message_id {
            Some(turn_id) => WireRecord::TurnStart { turn_id },
            None => return Ok(None),
        },
        UiChunk::TextDelta { delta } => WireRecord::Text(delta),
        UiChunk::ToolInputStart {
            tool_call_id,
            tool_name,
        } => WireRecord::ToolCallStart {
            id: tool_call_id,
            name: tool_name,
        },
        UiChunk::ToolInputDelta {
            tool_call_id,
            input_text_delta,
        } => WireRecord::ToolCallDelta {
            id: tool_call_id,
            delta: input_text_delta,
        },
        UiChunk::ToolInputAvailable {
            tool_call_id,
            tool_name,
            input,
        } => WireRecord::ToolCall {
            id: tool_call_id,
            name: tool_name,
            args: input,
        },
        UiChunk::ToolInputError {
            tool_call_id,
            error_text,
        }
        | UiChunk::ToolOutputError {
            tool_call_id,
            error_text,
        } => WireRecord::ToolError {
            id: tool_call_id,
            error: error_text,
        },
        UiChunk::ToolOutputAvailable {
            tool_call_id,
            output,
        } => WireRecord::ToolResult {
            id: tool_call_id,
            result: output,
        },
        UiChunk::Error { error_text } => WireRecord::Error(error_text),
        UiChunk::Finish { finish_reason } => WireRecord::Finish {
            reason: finish_reason,
        },
        UiChunk::Other => return Ok(None),
    };
    Ok(Some(record))
}

/// Frame an SSE byte stream into records. The `[DONE]` sentinel and
/// unparseable chunks are skipped.
pub fn sse_records(bytes: ByteStream) -> impl Stream<Item = Result<WireRecord, StreamError>> + Send {
    parse_sse_stream(bytes).filter_map(|event| match event {
        Err(e) => Some(Err(e)),
        Ok(event) => {
            let data = event.data.trim();
            if data == "[DONE]" {
                return None;
            }
            match parse_ui_chunk(data) {
                Ok(record) => record.map(Ok),
                Err(e) => {
                    warn!(%e, data, "Skipping malformed SSE chunk");
                    None
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_stream_from;
    use serde_json::json;

    #[tokio::test]
    async fn test_parse_sse_events_across_chunks() {
        let bytes = byte_stream_from(vec![
            ": keep-alive\n",
            "event: message\nda",
            "ta: {\"a\":1}\nid: 7\n\n",
            "data: line1\ndata: line2\n\n",
        ]);
        let events: Vec<SseEvent> = parse_sse_stream(bytes).map(|e| e.unwrap()).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, r#"{"a":1}"#);
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[1].data, "line1\nline2");
    }

    #[tokio::test]
    async fn test_trailing_event_without_blank_line() {
        let bytes = byte_stream_from(vec!["data: tail"]);
        let events: Vec<SseEvent> = parse_sse_stream(bytes).map(|e| e.unwrap()).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn test_parse_ui_chunks() {
        assert_eq!(
            parse_ui_chunk(r#"{"type":"start","messageId":"m1"}"#).unwrap(),
            Some(WireRecord::TurnStart {
                turn_id: "m1".into()
            })
        );
        assert_eq!(
            parse_ui_chunk(r#"{"type":"text-delta","id":"x","delta":"hi"}"#).unwrap(),
            Some(WireRecord::Text("hi".into()))
        );
        assert_eq!(
            parse_ui_chunk(
                r#"{"type":"tool-input-available","toolCallId":"t1","toolName":"delete_node","input":{"node_id":"n"}}"#
            )
            .unwrap(),
            Some(WireRecord::ToolCall {
                id: "t1".into(),
                name: "delete_node".into(),
                args: json!({"node_id": "n"}),
            })
        );
        assert_eq!(
            parse_ui_chunk(r#"{"type":"tool-output-error","toolCallId":"t1","errorText":"nope"}"#)
                .unwrap(),
            Some(WireRecord::ToolError {
                id: "t1".into(),
                error: "nope".into()
            })
        );
        assert_eq!(parse_ui_chunk(r#"{"type":"start-step"}"#).unwrap(), None);
    }

    #[tokio::test]
    async fn test_sse_records_skip_done_and_garbage() {
        let bytes = byte_stream_from(vec![
            "data: {\"type\":\"tool-input-start\",\"toolCallId\":\"t1\",\"toolName\":\"x\"}\n\n",
            "data: {not json}\n\n",
            "data: {\"type\":\"tool-input-delta\",\"toolCallId\":\"t1\",\"inputTextDelta\":\"{}\"}\n\n",
            "data: [DONE]\n\n",
        ]);
        let records: Vec<WireRecord> = sse_records(bytes).map(|r| r.unwrap()).collect().await;
        assert_eq!(
            records,
            vec![
                WireRecord::ToolCallStart {
                    id: "t1".into(),
                    name: "x".into()
                },
                WireRecord::ToolCallDelta {
                    id: "t1".into(),
                    delta: "{}".into()
                },
            ]
        );
    }
}
