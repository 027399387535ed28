//! Record-to-invocation decoding.
//!
//! [`InvocationDecoder`] is a synchronous state machine: feed it one
//! [`WireRecord`] at a time and it returns the [`StreamEvent`]s that record
//! produces. [`decode_records`] and [`decode`] wrap it into a lazy stream.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;

use futures::Stream;
use serde_json::Value;
use thiserror::Error;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use easel_core::config::Framing;
use easel_core::error::EaselError;

use crate::client_action::{ClientActionScanner, Segment};
use crate::framing::data_stream_records;
use crate::sse::sse_records;
use crate::{
    ByteStream, EventStream, InvocationEvent, InvocationEventKind, StreamError, StreamEvent,
    WireRecord,
};

/// Why one invocation's arguments could not be decoded.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("arguments are not valid JSON: {message}")]
    InvalidJson { message: String },

    #[error("arguments must be a JSON object, got {found}")]
    NotAnObject { found: String },

    #[error("tool name never arrived before the end of the turn")]
    NameNeverResolved,
}

impl From<DecodeError> for EaselError {
    fn from(err: DecodeError) -> Self {
        EaselError::Decode(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct DecoderOptions {
    /// Turn id used when the stream never announces one.
    pub default_turn_id: String,
    /// Scan text for inline `<CLIENT_ACTION>` tags.
    pub client_actions: bool,
    /// A start record with a different id closes the open turn. Off for
    /// the data stream, where every step repeats a start record.
    pub new_message_closes_turn: bool,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            default_turn_id: "turn".to_string(),
            client_actions: true,
            new_message_closes_turn: false,
        }
    }
}

#[derive(Debug, Default)]
struct CallState {
    name: Option<String>,
    fragments: Vec<String>,
    /// Fragments already handed out; the rest wait for the name.
    released: usize,
}

#[derive(Debug)]
pub struct InvocationDecoder {
    options: DecoderOptions,
    turn_id: Option<String>,
    turns_started: usize,
    calls: HashMap<String, CallState>,
    /// Call ids in first-seen order.
    order: Vec<String>,
    scanner: Option<ClientActionScanner>,
    client_action_seq: usize,
}

impl InvocationDecoder {
    pub fn new(options: DecoderOptions) -> Self {
        let scanner = if options.client_actions {
            ClientActionScanner::new()
                .map_err(|e| warn!(%e, "Client-action scanning disabled"))
                .ok()
        } else {
            None
        };
        Self {
            options,
            turn_id: None,
            turns_started: 0,
            calls: HashMap::new(),
            order: Vec::new(),
            scanner,
            client_action_seq: 0,
        }
    }

    /// The turn currently being decoded, if any.
    pub fn current_turn(&self) -> Option<&str> {
        self.turn_id.as_deref()
    }

    /// Feed one record.
    pub fn push(&mut self, record: WireRecord) -> Vec<StreamEvent> {
        let mut out = Vec::new();

        if let WireRecord::TurnStart { turn_id } = &record {
            match self.turn_id.clone() {
                None => self.start_turn(turn_id.clone(), &mut out),
                Some(open) if open != *turn_id && self.options.new_message_closes_turn => {
                    debug!(previous = %open, turn_id = %turn_id, "New message closes open turn");
                    self.close_turn(&open, &mut out);
                    out.push(StreamEvent::TurnFinished {
                        turn_id: open,
                        finish_reason: None,
                    });
                    self.start_turn(turn_id.clone(), &mut out);
                }
                // A new step of an open turn keeps the turn.
                Some(_) => {}
            }
            return out;
        }

        let turn = self.ensure_turn(&mut out);

        match record {
            WireRecord::TurnStart { .. } => {}
            WireRecord::Text(delta) => self.on_text(&turn, delta, &mut out),
            WireRecord::ToolCallStart { id, name } => {
                self.resolve_name(&turn, &id, name, &mut out);
            }
            WireRecord::ToolCallDelta { id, delta } => {
                let call = self.call_mut(&id);
                call.fragments.push(delta);
                if call.name.is_some() {
                    self.release_fragments(&turn, &id, &mut out);
                } else {
                    trace!(invocation_id = %id, "Buffering fragment until tool name arrives");
                }
            }
            WireRecord::ToolCall { id, name, args } => {
                self.resolve_name(&turn, &id, name, &mut out);
                self.complete(&turn, &id, args, &mut out);
            }
            WireRecord::ToolResult { id, result } => {
                let name = self.known_name(&id);
                out.push(invocation(&id, &turn, name, InvocationEventKind::Result(result)));
            }
            WireRecord::ToolError { id, error } => {
                let name = self.known_name(&id);
                out.push(invocation(&id, &turn, name, InvocationEventKind::Error(error)));
            }
            WireRecord::Error(message) => {
                warn!(turn_id = %turn, %message, "Agent reported an error");
                out.push(StreamEvent::AgentError {
                    turn_id: turn,
                    message,
                });
            }
            WireRecord::Finish { reason } => {
                self.close_turn(&turn, &mut out);
                out.push(StreamEvent::TurnFinished {
                    turn_id: turn,
                    finish_reason: reason,
                });
                self.turn_id = None;
            }
        }
        out
    }

    /// End of stream: release held-back text and report calls that never got
    /// a name. Does not emit `TurnFinished`; an unfinished turn stays
    /// unfinished.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if let Some(turn) = self.turn_id.clone() {
            self.close_turn(&turn, &mut out);
        }
        out
    }

    fn start_turn(&mut self, turn_id: String, out: &mut Vec<StreamEvent>) {
        debug!(turn_id = %turn_id, "Turn started");
        self.turns_started += 1;
        self.calls.clear();
        self.order.clear();
        self.client_action_seq = 0;
        self.turn_id = Some(turn_id.clone());
        out.push(StreamEvent::TurnStarted { turn_id });
    }

    fn ensure_turn(&mut self, out: &mut Vec<StreamEvent>) -> String {
        if let Some(turn) = &self.turn_id {
            return turn.clone();
        }
        let turn = if self.turns_started == 0 {
            self.options.default_turn_id.clone()
        } else {
            format!("{}-{}", self.options.default_turn_id, self.turns_started)
        };
        self.start_turn(turn.clone(), out);
        turn
    }

    fn close_turn(&mut self, turn: &str, out: &mut Vec<StreamEvent>) {
        if let Some(Segment::Text(rest)) = self.scanner.as_mut().and_then(|s| s.finish()) {
            out.push(StreamEvent::Text {
                turn_id: turn.to_string(),
                delta: rest,
            });
        }
        for id in std::mem::take(&mut self.order) {
            let nameless = self.calls.get(&id).is_some_and(|c| c.name.is_none());
            if nameless {
                warn!(invocation_id = %id, turn_id = %turn, "Tool name never resolved");
                out.push(invocation(
                    &id,
                    turn,
                    String::new(),
                    InvocationEventKind::Malformed(DecodeError::NameNeverResolved),
                ));
            }
        }
        self.calls.clear();
    }

    fn call_mut(&mut self, id: &str) -> &mut CallState {
        if !self.calls.contains_key(id) {
            self.order.push(id.to_string());
        }
        self.calls.entry(id.to_string()).or_default()
    }

    fn known_name(&self, id: &str) -> String {
        self.calls
            .get(id)
            .and_then(|c| c.name.clone())
            .unwrap_or_default()
    }

    fn resolve_name(&mut self, turn: &str, id: &str, name: String, out: &mut Vec<StreamEvent>) {
        let call = self.call_mut(id);
        if call.name.is_none() {
            call.name = Some(name);
            self.release_fragments(turn, id, out);
        }
    }

    fn release_fragments(&mut self, turn: &str, id: &str, out: &mut Vec<StreamEvent>) {
        let Some(call) = self.calls.get_mut(id) else {
            return;
        };
        let Some(name) = call.name.clone() else {
            return;
        };
        for fragment in &call.fragments[call.released..] {
            out.push(invocation(
                id,
                turn,
                name.clone(),
                InvocationEventKind::Fragment(fragment.clone()),
            ));
        }
        call.released = call.fragments.len();
    }

    fn complete(&mut self, turn: &str, id: &str, args: Value, out: &mut Vec<StreamEvent>) {
        let call = self.call_mut(id);
        let name = call.name.clone().unwrap_or_default();

        // Raw text to parse, plus a fragment to emit when nothing was streamed.
        let (raw, synthetic) = match args {
            Value::Null if call.fragments.is_empty() => ("{}".to_string(), true),
            Value::Null => (call.fragments.concat(), false),
            Value::String(s) => {
                let streamed = !call.fragments.is_empty();
                (s, !streamed)
            }
            Value::Object(map) => {
                let value = Value::Object(map);
                if call.fragments.is_empty() {
                    let text = value.to_string();
                    call.fragments.push(text.clone());
                    call.released = call.fragments.len();
                    out.push(invocation(
                        id,
                        turn,
                        name.clone(),
                        InvocationEventKind::Fragment(text),
                    ));
                }
                debug!(invocation_id = %id, tool = %name, "Arguments complete");
                out.push(invocation(id, turn, name, InvocationEventKind::Complete(value)));
                return;
            }
            other => {
                let err = DecodeError::NotAnObject {
                    found: json_kind(&other).to_string(),
                };
                warn!(invocation_id = %id, %err, "Malformed tool arguments");
                out.push(invocation(id, turn, name, InvocationEventKind::Malformed(err)));
                return;
            }
        };

        if synthetic {
            call.fragments.push(raw.clone());
            call.released = call.fragments.len();
            out.push(invocation(
                id,
                turn,
                name.clone(),
                InvocationEventKind::Fragment(raw.clone()),
            ));
        }

        let kind = match parse_args(&raw) {
            Ok(value) => {
                debug!(invocation_id = %id, tool = %name, "Arguments complete");
                InvocationEventKind::Complete(value)
            }
            Err(err) => {
                warn!(invocation_id = %id, %err, "Malformed tool arguments");
                InvocationEventKind::Malformed(err)
            }
        };
        out.push(invocation(id, turn, name, kind));
    }

    fn on_text(&mut self, turn: &str, delta: String, out: &mut Vec<StreamEvent>) {
        let Some(scanner) = self.scanner.as_mut() else {
            out.push(StreamEvent::Text {
                turn_id: turn.to_string(),
                delta,
            });
            return;
        };

        for segment in scanner.push(&delta) {
            match segment {
                Segment::Text(text) => out.push(StreamEvent::Text {
                    turn_id: turn.to_string(),
                    delta: text,
                }),
                Segment::Action { name, args } => {
                    let id = format!("{turn}:client-action:{}", self.client_action_seq);
                    self.client_action_seq += 1;
                    debug!(invocation_id = %id, tool = %name, "Inline client action");
                    let call = self.call_mut(&id);
                    call.name = Some(name.clone());
                    call.fragments.push(args.clone());
                    call.released = 1;
                    out.push(invocation(
                        &id,
                        turn,
                        name.clone(),
                        InvocationEventKind::Fragment(args.clone()),
                    ));
                    let kind = match parse_args(&args) {
                        Ok(value) => InvocationEventKind::Complete(value),
                        Err(err) => {
                            warn!(invocation_id = %id, %err, "Malformed client action");
                            InvocationEventKind::Malformed(err)
                        }
                    };
                    out.push(invocation(&id, turn, name, kind));
                }
            }
        }
    }
}

fn invocation(id: &str, turn: &str, name: String, kind: InvocationEventKind) -> StreamEvent {
    StreamEvent::Invocation(InvocationEvent {
        invocation_id: id.to_string(),
        turn_id: turn.to_string(),
        name,
        kind,
    })
}

/// Parse argument text into a JSON object.
pub fn parse_args(raw: &str) -> Result<Value, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson {
        message: e.to_string(),
    })?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(DecodeError::NotAnObject {
            found: json_kind(&value).to_string(),
        })
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

type RecordStream = Pin<Box<dyn Stream<Item = Result<WireRecord, StreamError>> + Send>>;

struct DecodeState {
    records: RecordStream,
    decoder: InvocationDecoder,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

/// Decode a record stream. A transport error is yielded and ends the stream.
pub fn decode_records<S>(records: S, decoder: InvocationDecoder) -> EventStream
where
    S: Stream<Item = Result<WireRecord, StreamError>> + Send + 'static,
{
    let state = DecodeState {
        records: Box::pin(records),
        decoder,
        pending: VecDeque::new(),
        done: false,
    };
    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.records.next().await {
                Some(Ok(record)) => state.pending.extend(state.decoder.push(record)),
                Some(Err(e)) => {
                    warn!(%e, "Agent stream failed");
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    state.pending.extend(state.decoder.finish());
                }
            }
        }
    }))
}

/// Frame and decode a raw byte stream.
pub fn decode(bytes: ByteStream, framing: Framing, mut options: DecoderOptions) -> EventStream {
    options.new_message_closes_turn = framing == Framing::Sse;
    let decoder = InvocationDecoder::new(options);
    match framing {
        Framing::DataStream => decode_records(data_stream_records(bytes), decoder),
        Framing::Sse => decode_records(sse_records(bytes), decoder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoder() -> InvocationDecoder {
        InvocationDecoder::new(DecoderOptions::default())
    }

    fn kinds(events: &[StreamEvent]) -> Vec<InvocationEventKind> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Invocation(ev) => Some(ev.kind.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_turn_start_then_same_turn_steps() {
        let mut d = decoder();
        let out = d.push(WireRecord::TurnStart {
            turn_id: "m1".into(),
        });
        assert_eq!(out, vec![StreamEvent::TurnStarted { turn_id: "m1".into() }]);
        assert!(d.push(WireRecord::TurnStart {
            turn_id: "m2".into()
        })
        .is_empty());
        assert_eq!(d.current_turn(), Some("m1"));
    }

    #[test]
    fn test_default_turn_id_is_lazy() {
        let mut d = decoder();
        let out = d.push(WireRecord::Text("hi".into()));
        assert_eq!(
            out,
            vec![
                StreamEvent::TurnStarted {
                    turn_id: "turn".into()
                },
                StreamEvent::Text {
                    turn_id: "turn".into(),
                    delta: "hi".into()
                },
            ]
        );
        d.push(WireRecord::Finish { reason: None });
        let out = d.push(WireRecord::Text("again".into()));
        assert_eq!(out[0], StreamEvent::TurnStarted {
            turn_id: "turn-1".into()
        });
    }

    #[test]
    fn test_fragments_buffered_until_name() {
        let mut d = decoder();
        d.push(WireRecord::TurnStart {
            turn_id: "t".into(),
        });
        assert!(d.push(WireRecord::ToolCallDelta {
            id: "c1".into(),
            delta: "{\"node_id\":".into()
        })
        .is_empty());
        let out = d.push(WireRecord::ToolCallStart {
            id: "c1".into(),
            name: "delete_node".into(),
        });
        assert_eq!(
            kinds(&out),
            vec![InvocationEventKind::Fragment("{\"node_id\":".into())]
        );
        let out = d.push(WireRecord::ToolCallDelta {
            id: "c1".into(),
            delta: "\"n1\"}".into(),
        });
        assert_eq!(kinds(&out), vec![InvocationEventKind::Fragment("\"n1\"}".into())]);
        let out = d.push(WireRecord::ToolCall {
            id: "c1".into(),
            name: "delete_node".into(),
            args: Value::Null,
        });
        assert_eq!(
            kinds(&out),
            vec![InvocationEventKind::Complete(json!({"node_id": "n1"}))]
        );
    }

    #[test]
    fn test_completion_with_object_and_no_fragments() {
        let mut d = decoder();
        let out = d.push(WireRecord::ToolCall {
            id: "c1".into(),
            name: "create_variation_nodes".into(),
            args: json!({"count": 1, "variations": ["a"]}),
        });
        let kinds = kinds(&out);
        assert_eq!(kinds.len(), 2);
        let InvocationEventKind::Fragment(text) = &kinds[0] else {
            panic!("expected fragment first");
        };
        assert_eq!(
            serde_json::from_str::<Value>(text).unwrap(),
            json!({"count": 1, "variations": ["a"]})
        );
        assert!(matches!(kinds[1], InvocationEventKind::Complete(_)));
    }

    #[test]
    fn test_completion_with_string_args() {
        let mut d = decoder();
        let out = d.push(WireRecord::ToolCall {
            id: "c1".into(),
            name: "delete_node".into(),
            args: Value::String("{\"node_id\":\"n\"}".into()),
        });
        assert_eq!(
            kinds(&out),
            vec![
                InvocationEventKind::Fragment("{\"node_id\":\"n\"}".into()),
                InvocationEventKind::Complete(json!({"node_id": "n"})),
            ]
        );
    }

    #[test]
    fn test_malformed_is_isolated() {
        let mut d = decoder();
        d.push(WireRecord::ToolCallStart {
            id: "bad".into(),
            name: "x".into(),
        });
        d.push(WireRecord::ToolCallDelta {
            id: "bad".into(),
            delta: "{oops".into(),
        });
        let out = d.push(WireRecord::ToolCall {
            id: "bad".into(),
            name: "x".into(),
            args: Value::Null,
        });
        assert!(matches!(
            kinds(&out)[0],
            InvocationEventKind::Malformed(DecodeError::InvalidJson { .. })
        ));

        let out = d.push(WireRecord::ToolCall {
            id: "arr".into(),
            name: "x".into(),
            args: json!([1, 2]),
        });
        assert_eq!(
            kinds(&out),
            vec![InvocationEventKind::Malformed(DecodeError::NotAnObject {
                found: "array".into()
            })]
        );

        let out = d.push(WireRecord::ToolCall {
            id: "good".into(),
            name: "x".into(),
            args: json!({}),
        });
        assert!(matches!(kinds(&out)[1], InvocationEventKind::Complete(_)));
    }

    #[test]
    fn test_name_never_resolved() {
        let mut d = decoder();
        d.push(WireRecord::ToolCallDelta {
            id: "c1".into(),
            delta: "{}".into(),
        });
        let out = d.finish();
        let StreamEvent::Invocation(ev) = &out[0] else {
            panic!("expected invocation event");
        };
        assert_eq!(ev.invocation_id, "c1");
        assert_eq!(ev.name, "");
        assert_eq!(
            ev.kind,
            InvocationEventKind::Malformed(DecodeError::NameNeverResolved)
        );
    }

    #[test]
    fn test_result_forwarded() {
        let mut d = decoder();
        d.push(WireRecord::ToolCall {
            id: "c1".into(),
            name: "analyze_canvas".into(),
            args: json!({}),
        });
        let out = d.push(WireRecord::ToolResult {
            id: "c1".into(),
            result: json!("done"),
        });
        let StreamEvent::Invocation(ev) = &out[0] else {
            panic!("expected invocation event");
        };
        assert_eq!(ev.name, "analyze_canvas");
        assert_eq!(ev.kind, InvocationEventKind::Result(json!("done")));
    }

    #[test]
    fn test_client_action_ids_are_per_turn() {
        let mut d = decoder();
        d.push(WireRecord::TurnStart {
            turn_id: "m1".into(),
        });
        let out = d.push(WireRecord::Text(
            "Sure. <CLIENT_ACTION type=\"delete_node\" args='{\"node_id\":\"n1\"}' />".into(),
        ));
        let ids: Vec<&str> = out
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Invocation(ev) => Some(ev.invocation_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["m1:client-action:0", "m1:client-action:0"]);
        assert_eq!(
            out[0],
            StreamEvent::Text {
                turn_id: "m1".into(),
                delta: "Sure. ".into()
            }
        );
    }

    #[test]
    fn test_client_actions_disabled() {
        let mut d = InvocationDecoder::new(DecoderOptions {
            client_actions: false,
            ..Default::default()
        });
        let tag = "<CLIENT_ACTION type=\"x\" args='{}' />";
        let out = d.push(WireRecord::Text(tag.into()));
        assert_eq!(
            out[1],
            StreamEvent::Text {
                turn_id: "turn".into(),
                delta: tag.into()
            }
        );
    }

    #[test]
    fn test_step_start_keeps_open_turn() {
        let mut d = decoder();
        d.push(WireRecord::TurnStart {
            turn_id: "m1".into(),
        });
        let out = d.push(WireRecord::TurnStart {
            turn_id: "m2".into(),
        });
        assert!(out.is_empty());
        assert_eq!(d.current_turn(), Some("m1"));
    }

    #[test]
    fn test_new_message_closes_unfinished_turn() {
        let mut d = InvocationDecoder::new(DecoderOptions {
            new_message_closes_turn: true,
            ..Default::default()
        });
        d.push(WireRecord::TurnStart {
            turn_id: "m1".into(),
        });
        d.push(WireRecord::ToolCallDelta {
            id: "orphan".into(),
            delta: "{".into(),
        });
        let out = d.push(WireRecord::TurnStart {
            turn_id: "m2".into(),
        });

        assert_eq!(
            kinds(&out),
            vec![InvocationEventKind::Malformed(DecodeError::NameNeverResolved)]
        );
        assert!(out.contains(&StreamEvent::TurnFinished {
            turn_id: "m1".into(),
            finish_reason: None,
        }));
        assert_eq!(
            out.last(),
            Some(&StreamEvent::TurnStarted {
                turn_id: "m2".into()
            })
        );

        let text = d.push(WireRecord::Text("hi".into()));
        assert_eq!(
            text,
            vec![StreamEvent::Text {
                turn_id: "m2".into(),
                delta: "hi".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_decode_stream_ends_on_transport_error() {
        let records = futures::stream::iter(vec![
            Ok(WireRecord::Text("a".into())),
            Err(StreamError::Transport("reset".into())),
            Ok(WireRecord::Text("never".into())),
        ]);
        let items: Vec<_> = decode_records(records, decoder()).collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[2].is_err());
    }
}
