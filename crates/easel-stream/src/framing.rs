//! Data-stream line framing.
//!
//! Each line is `<code>:<json>`:
//!
//! | code | meaning                          |
//! |------|----------------------------------|
//! | `0`  | text delta (JSON string)         |
//! | `3`  | error (JSON string)              |
//! | `9`  | tool call with final arguments   |
//! | `a`  | tool result                      |
//! | `b`  | tool call streaming start        |
//! | `c`  | tool call argument delta         |
//! | `f`  | step start (carries message id)  |
//! | `d`  | message finish                   |
//!
//! Codes `2`, `8`, `e`, `g` and anything unknown are skipped.

use futures::Stream;
use serde::Deserialize;
use thiserror::Error;
use tokio_stream::StreamExt;
use tracing::{trace, warn};

use crate::{ByteStream, StreamError, WireRecord};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FramingError {
    #[error("line has no '<code>:' prefix")]
    MissingSeparator,

    #[error("malformed payload for code '{code}': {message}")]
    Malformed { code: String, message: String },
}

/// Splits raw chunks into lines. Bytes are buffered until a newline arrives so
/// multi-byte characters split across chunks stay intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line, without its `\n` / `\r\n` terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.buf.drain(..=pos).collect();
        let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
        if line.ends_with('\r') {
            line.pop();
        }
        Some(line)
    }

    /// Whatever is left after the stream ended without a final newline.
    pub fn take_rest(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
        Some(line)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallPart {
    tool_call_id: String,
    tool_name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallStartPart {
    tool_call_id: String,
    tool_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallDeltaPart {
    tool_call_id: String,
    args_text_delta: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolResultPart {
    tool_call_id: String,
    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartStepPart {
    message_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishPart {
    #[serde(default)]
    finish_reason: Option<String>,
}

fn payload<T: serde::de::DeserializeOwned>(code: &str, json: &str) -> Result<T, FramingError> {
    serde_json::from_str(json).map_err(|e| FramingError::Malformed {
        code: code.to_string(),
        message: e.to_string(),
    })
}

/// Parse one data-stream line. `Ok(None)` means the line carries nothing the
/// decoder needs.
pub fn parse_line(line: &str) -> Result<Option<WireRecord>, FramingError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (code, json) = line.split_once(':').ok_or(FramingError::MissingSeparator)?;

    let record = match code {
        "0" => WireRecord::Text(payload(code, json)?),
        "3" => WireRecord::Error(payload(code, json)?),
        "9" => {
            let part: ToolCallPart = payload(code, json)?;
            WireRecord::ToolCall {
                id: part.tool_call_id,
                name: part.tool_name,
                args: part.args,
            }
        }
        "a" => {
            let part: ToolResultPart = payload(code, json)?;
            WireRecord::ToolResult {
                id: part.tool_call_id,
                result: part.result,
            }
        }
        "b" => {
            let part: ToolCallStartPart = payload(code, json)?;
            WireRecord::ToolCallStart {
                id: part.tool_call_id,
                name: part.tool_name,
            }
        }
        "c" => {
            let part: ToolCallDeltaPart = payload(code, json)?;
            WireRecord::ToolCallDelta {
                id: part.tool_call_id,
                delta: part.args_text_delta,
            }
        }
        "f" => {
            let part: StartStepPart = payload(code, json)?;
            WireRecord::TurnStart {
                turn_id: part.message_id,
            }
        }
        "d" => {
            let part: FinishPart = payload(code, json)?;
            WireRecord::Finish {
                reason: part.finish_reason,
            }
        }
        other => {
            trace!(code = other, "Skipping data-stream part");
            return Ok(None);
        }
    };
    Ok(Some(record))
}

struct FramingState {
    bytes: ByteStream,
    lines: LineBuffer,
    done: bool,
}

/// Frame a data-stream byte stream into records. Malformed lines are logged
/// and skipped; transport errors are passed through.
pub fn data_stream_records(
    bytes: ByteStream,
) -> impl Stream<Item = Result<WireRecord, StreamError>> + Send {
    futures::stream::unfold(
        FramingState {
            bytes,
            lines: LineBuffer::default(),
            done: false,
        },
        |mut state| async move {
            loop {
                let line = match state.lines.next_line() {
                    Some(line) => line,
                    None if state.done => state.lines.take_rest()?,
                    None => {
                        match state.bytes.next().await {
                            Some(Ok(chunk)) => state.lines.push(&chunk),
                            Some(Err(e)) => {
                                state.done = true;
                                return Some((Err(e), state));
                            }
                            None => state.done = true,
                        }
                        continue;
                    }
                };

                match parse_line(&line) {
                    Ok(Some(record)) => return Some((Ok(record), state)),
                    Ok(None) => {}
                    Err(e) => warn!(%e, line = %line, "Skipping malformed data-stream line"),
                }
            }
        },
    )
}
