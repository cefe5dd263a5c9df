//! HTTP + SSE client for the in-sandbox coding agent.
//!
//! The agent exposes a session API and a server-sent-event stream; the bridge
//! drives prompts through [`AgentApi`] and translates the typed events it
//! gets back. The trait exists so bridge tests can script agent behavior.

use std::collections::VecDeque;
use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use futures_util::StreamExt;
use serde_json::{Value, json};

/// One event off the agent's SSE stream.
#[derive(Debug, Clone)]
pub struct AgentSseEvent {
    pub kind: String,
    pub properties: Value,
}

pub type AgentEventStream = Pin<Box<dyn Stream<Item = Result<AgentSseEvent>> + Send>>;

#[async_trait]
pub trait AgentApi: Send + Sync {
    /// Create (or return) the agent session the bridge drives.
    async fn ensure_session(&self) -> Result<String>;

    /// Submit a prompt and return the event stream for its execution.
    async fn send_prompt(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<AgentEventStream>;

    /// Best-effort abort of the in-flight prompt.
    async fn abort(&self, session_id: &str) -> Result<()>;
}

pub struct HttpAgentClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAgentClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn open_event_stream(&self) -> Result<AgentEventStream> {
        // The event stream has no overall deadline (prompts can run for a
        // long time); it ends when the agent closes it or the task is
        // cancelled. The explicit timeout overrides the client-wide 30 s.
        let resp = self
            .client
            .get(format!("{}/event", self.base_url))
            .timeout(std::time::Duration::from_secs(24 * 3600))
            .send()
            .await
            .context("failed to open agent event stream")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("agent event stream returned {status}");
        }

        let body = resp.bytes_stream().boxed();
        let stream = futures::stream::unfold(
            (body, SseParser::default(), VecDeque::new()),
            |(mut body, mut parser, mut ready)| async move {
                loop {
                    if let Some(event) = ready.pop_front() {
                        return Some((Ok(event), (body, parser, ready)));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => {
                            ready.extend(parser.feed(&String::from_utf8_lossy(&chunk)));
                        }
                        Some(Err(e)) => {
                            return Some((
                                Err(anyhow::anyhow!("agent event stream error: {e}")),
                                (body, parser, ready),
                            ));
                        }
                        None => return None,
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn ensure_session(&self) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/session", self.base_url))
            .json(&json!({}))
            .send()
            .await
            .context("failed to create agent session")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("agent session create returned {status}");
        }
        let body: Value = resp
            .json()
            .await
            .context("failed to parse agent session response")?;
        body["id"]
            .as_str()
            .map(String::from)
            .context("agent session response missing 'id'")
    }

    async fn send_prompt(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<AgentEventStream> {
        // Subscribe before submitting so no events are missed.
        let stream = self.open_event_stream().await?;

        let resp = self
            .client
            .post(format!("{}/session/{session_id}/message", self.base_url))
            .json(&json!({
                "messageID": message_id,
                "parts": [{ "type": "text", "text": content }],
            }))
            .send()
            .await
            .context("failed to submit prompt to agent")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("agent prompt submit returned {status}");
        }

        Ok(stream)
    }

    async fn abort(&self, session_id: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/session/{session_id}/abort", self.base_url))
            .send()
            .await
            .context("failed to send abort to agent")?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("agent abort returned {status}");
        }
        Ok(())
    }
}

/// Incremental parser for `text/event-stream` frames.
///
/// Frames are separated by a blank line; each frame's payload is the joined
/// `data:` lines holding `{"type": ..., "properties": {...}}`.
#[derive(Default)]
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<AgentSseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(split_at) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..split_at + 2).collect();
            if let Some(event) = parse_frame(&frame) {
                events.push(event);
            }
        }

        events
    }
}

fn parse_frame(frame: &str) -> Option<AgentSseEvent> {
    let data: String = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect::<Vec<_>>()
        .join("\n");

    if data.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(&data) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "discarding unparseable agent event");
            return None;
        }
    };

    Some(AgentSseEvent {
        kind: value["type"].as_str().unwrap_or_default().to_string(),
        properties: value.get("properties").cloned().unwrap_or(Value::Null),
    })
}
