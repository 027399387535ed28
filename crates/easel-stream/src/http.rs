//! HTTP agent transport.
//!
//! POSTs a [`ChatRequest`] as JSON and hands back the response body as a
//! [`ByteStream`]. Framing is left to the caller.

use async_trait::async_trait;
use tokio_stream::StreamExt;
use tracing::debug;

use easel_core::config::StreamConfig;

use crate::{AgentTransport, ByteStream, ChatRequest, StreamError};

pub struct HttpTransport {
    endpoint: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    /// Build from the `stream` config section. Fails without an endpoint.
    pub fn from_config(config: &StreamConfig) -> anyhow::Result<Self> {
        let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) else {
            anyhow::bail!("stream.endpoint is not configured");
        };
        Ok(Self::new(endpoint, config.resolve_api_key()))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    fn id(&self) -> &str {
        "http"
    }

    async fn open(&self, request: &ChatRequest) -> anyhow::Result<ByteStream> {
        debug!(endpoint = %self.endpoint, messages = request.messages.len(), "Opening agent stream");

        let mut req_builder = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            req_builder = req_builder.header("authorization", format!("Bearer {key}"));
        }

        let response = req_builder.json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Agent endpoint error {status}: {body}");
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::Transport(e.to_string())));
        Ok(Box::pin(bytes))
    }
}
