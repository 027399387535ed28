//! End-to-end decoding of recorded agent responses.

use async_trait::async_trait;
use serde_json::json;
use tokio_stream::StreamExt;

use easel_core::config::Framing;
use easel_stream::{
    AgentTransport, ByteStream, ChatRequest, DecoderOptions, InvocationEventKind, StreamEvent,
    byte_stream_from, decode, decode_transport,
};

const DATA_STREAM: &str = concat!(
    "f:{\"messageId\":\"t1\"}\n",
    "0:\"Creating two variations.\"\n",
    "b:{\"toolCallId\":\"call-1\",\"toolName\":\"create_variation_nodes\"}\n",
    "c:{\"toolCallId\":\"call-1\",\"argsTextDelta\":\"{\\\"count\\\":2,\"}\n",
    "c:{\"toolCallId\":\"call-1\",\"argsTextDelta\":\"\\\"variations\\\":[\\\"red\\\",\\\"blue\\\"]}\"}\n",
    "9:{\"toolCallId\":\"call-1\",\"toolName\":\"create_variation_nodes\",\"args\":{\"count\":2,\"variations\":[\"red\",\"blue\"]}}\n",
    "a:{\"toolCallId\":\"call-1\",\"result\":\"ok\"}\n",
    "d:{\"finishReason\":\"tool-calls\"}\n",
);

async fn collect(bytes: ByteStream, framing: Framing) -> Vec<StreamEvent> {
    decode(bytes, framing, DecoderOptions::default())
        .map(|e| e.unwrap())
        .collect()
        .await
}

fn split_every(text: &str, n: usize) -> Vec<Vec<u8>> {
    text.as_bytes().chunks(n).map(|c| c.to_vec()).collect()
}

#[tokio::test]
async fn test_data_stream_in_tiny_chunks() {
    let events = collect(byte_stream_from(split_every(DATA_STREAM, 7)), Framing::DataStream).await;

    assert_eq!(events[0], StreamEvent::TurnStarted { turn_id: "t1".into() });
    assert_eq!(
        events[1],
        StreamEvent::Text {
            turn_id: "t1".into(),
            delta: "Creating two variations.".into()
        }
    );

    let mut fragments = String::new();
    let mut completes = Vec::new();
    for event in &events {
        if let StreamEvent::Invocation(ev) = event {
            assert_eq!(ev.invocation_id, "call-1");
            assert_eq!(ev.name, "create_variation_nodes");
            match &ev.kind {
                InvocationEventKind::Fragment(f) => fragments.push_str(f),
                InvocationEventKind::Complete(args) => completes.push(args.clone()),
                _ => {}
            }
        }
    }
    let expected = json!({"count": 2, "variations": ["red", "blue"]});
    assert_eq!(completes, vec![expected.clone()]);
    assert_eq!(serde_json::from_str::<serde_json::Value>(&fragments).unwrap(), expected);

    assert_eq!(
        events.last(),
        Some(&StreamEvent::TurnFinished {
            turn_id: "t1".into(),
            finish_reason: Some("tool-calls".into())
        })
    );
}

#[tokio::test]
async fn test_sse_stream() {
    let body = concat!(
        "data: {\"type\":\"start\",\"messageId\":\"t2\"}\n\n",
        "data: {\"type\":\"tool-input-start\",\"toolCallId\":\"c\",\"toolName\":\"delete_node\"}\n\n",
        "data: {\"type\":\"tool-input-delta\",\"toolCallId\":\"c\",\"inputTextDelta\":\"{\\\"node_id\\\":\\\"n1\\\"}\"}\n\n",
        "data: {\"type\":\"tool-input-available\",\"toolCallId\":\"c\",\"toolName\":\"delete_node\",\"input\":{\"node_id\":\"n1\"}}\n\n",
        "data: {\"type\":\"finish\"}\n\n",
        "data: [DONE]\n\n",
    );
    let events = collect(byte_stream_from(split_every(body, 11)), Framing::Sse).await;
    let kinds: Vec<&InvocationEventKind> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Invocation(ev) => Some(&ev.kind),
            _ => None,
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            &InvocationEventKind::Fragment("{\"node_id\":\"n1\"}".into()),
            &InvocationEventKind::Complete(json!({"node_id": "n1"})),
        ]
    );
    assert!(matches!(events.last(), Some(StreamEvent::TurnFinished { .. })));
}

#[tokio::test]
async fn test_client_action_tag_split_across_chunks() {
    let body = concat!(
        "f:{\"messageId\":\"t3\"}\n",
        "0:\"Done <CLIENT_ACT\"\n",
        "0:\"ION type=\\\"generate_palette\\\" args='{\\\"prompt\\\":\\\"sunset\\\"}' /> enjoy\"\n",
        "d:{\"finishReason\":\"stop\"}\n",
    );
    let events = collect(byte_stream_from(vec![body]), Framing::DataStream).await;

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Text { delta, .. } => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Done  enjoy");

    let complete = events.iter().find_map(|e| match e {
        StreamEvent::Invocation(ev) => match &ev.kind {
            InvocationEventKind::Complete(args) => Some((ev.invocation_id.clone(), args.clone())),
            _ => None,
        },
        _ => None,
    });
    assert_eq!(
        complete,
        Some(("t3:client-action:0".to_string(), json!({"prompt": "sunset"})))
    );
}

struct RecordedTransport(&'static str);

#[async_trait]
impl AgentTransport for RecordedTransport {
    fn id(&self) -> &str {
        "recorded"
    }

    async fn open(&self, _request: &ChatRequest) -> anyhow::Result<ByteStream> {
        Ok(byte_stream_from(vec![self.0]))
    }
}

#[tokio::test]
async fn test_decode_transport() {
    let transport = RecordedTransport(DATA_STREAM);
    let stream = decode_transport(
        &transport,
        &ChatRequest::user("make two"),
        Framing::DataStream,
        DecoderOptions::default(),
    )
    .await
    .unwrap();
    let events: Vec<_> = stream.collect().await;
    assert!(events.iter().all(|e| e.is_ok()));
    assert!(events.len() > 4);
}
