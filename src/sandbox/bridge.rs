//! Bridge between the sandboxed coding agent and the control plane.
//!
//! The bridge keeps a logical event stream alive across an unreliable
//! websocket. Critical events carry ack ids and are retransmitted on every
//! new socket until the control plane acknowledges them; everything else is
//! best-effort. Prompt execution runs as its own task so a socket drop never
//! kills an in-flight agent run.
//!
//! Delivery rules:
//! - an event enters `pending_acks` only after a successful socket write;
//! - `pending_acks` entries are removed only by an inbound `ack` command;
//! - on reconnect the buffer flushes first (FIFO), then pending acks are
//!   re-sent, skipping ids that just went out with the buffer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use super::agent::AgentApi;
use super::socket::{BridgeSocket, EventSocket};

/// Events whose delivery must be reconfirmed by an `ack` command.
pub const CRITICAL_EVENT_TYPES: &[&str] = &[
    "execution_complete",
    "error",
    "snapshot_ready",
    "push_complete",
    "workspace_ready",
    "setup_complete",
];

pub const DEFAULT_MAX_EVENT_BUFFER_SIZE: usize = 500;

const MAX_RECONNECT_BACKOFF_SECS: u64 = 8;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub fn is_critical(event_type: &str) -> bool {
    CRITICAL_EVENT_TYPES.contains(&event_type)
}

/// The control plane rejected the session outright; reconnecting is useless.
#[derive(thiserror::Error, Debug)]
#[error("session terminated by control plane: {0}")]
pub struct SessionTerminatedError(pub String);

/// A connection failure is fatal only for explicit session-level rejections.
/// 5xx, network errors, and timeouts are all retriable.
pub fn is_fatal_connection_error(error: &str) -> bool {
    ["HTTP 401", "HTTP 403", "HTTP 404", "HTTP 410"]
        .iter()
        .any(|needle| error.contains(needle))
}

struct PromptTask {
    message_id: String,
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct BridgeState {
    socket: Option<Box<dyn EventSocket>>,
    event_buffer: VecDeque<Value>,
    pending_acks: HashMap<String, Value>,
    current_prompt: Option<PromptTask>,
    inflight_message_id: Option<String>,
    opencode_session_id: Option<String>,
    max_buffer: usize,
}

#[derive(Clone)]
pub struct AgentBridge {
    sandbox_id: String,
    session_id: String,
    control_plane_url: String,
    auth_token: String,
    agent: Arc<dyn AgentApi>,
    shutdown: CancellationToken,
    state: Arc<Mutex<BridgeState>>,
    prompt_seq: Arc<AtomicU64>,
}

enum ConnectionOutcome {
    Disconnected(String),
    Shutdown,
}

impl AgentBridge {
    pub fn new(
        sandbox_id: impl Into<String>,
        session_id: impl Into<String>,
        control_plane_url: impl Into<String>,
        auth_token: impl Into<String>,
        agent: Arc<dyn AgentApi>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            session_id: session_id.into(),
            control_plane_url: control_plane_url.into(),
            auth_token: auth_token.into(),
            agent,
            shutdown,
            state: Arc::new(Mutex::new(BridgeState {
                socket: None,
                event_buffer: VecDeque::new(),
                pending_acks: HashMap::new(),
                current_prompt: None,
                inflight_message_id: None,
                opencode_session_id: None,
                max_buffer: DEFAULT_MAX_EVENT_BUFFER_SIZE,
            })),
            prompt_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    // ── Run loop ────────────────────────────────────────────────────

    /// Service the control-plane connection until shutdown or a fatal
    /// rejection. On exit any in-flight prompt task is cancelled (and still
    /// emits its `execution_complete`).
    pub async fn run(&self) -> Result<(), SessionTerminatedError> {
        self.acquire_agent_session().await;
        let result = self.connect_loop().await;

        let task = {
            let mut st = self.state.lock().await;
            st.current_prompt.take()
        };
        if let Some(task) = task {
            tracing::info!(message_id = %task.message_id, "cancelling in-flight prompt on bridge exit");
            task.cancel.cancel();
            let _ = task.handle.await;
        }

        result
    }

    /// Acquire the agent session id, retrying with backoff until the agent
    /// answers or the shutdown token fires. Returns `None` only on shutdown.
    async fn acquire_agent_session(&self) -> Option<String> {
        {
            let st = self.state.lock().await;
            if st.opencode_session_id.is_some() {
                return st.opencode_session_id.clone();
            }
        }
        let mut backoff_secs: u64 = 1;
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            match self.agent.ensure_session().await {
                Ok(id) => {
                    tracing::info!(agent_session = %id, "acquired agent session");
                    let mut st = self.state.lock().await;
                    st.opencode_session_id = Some(id.clone());
                    return Some(id);
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff_secs, "agent session not ready yet");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                _ = self.shutdown.cancelled() => return None,
            }
            backoff_secs = (backoff_secs * 2).min(MAX_RECONNECT_BACKOFF_SECS);
        }
    }

    async fn connect_loop(&self) -> Result<(), SessionTerminatedError> {
        let mut backoff_secs: u64 = 1;
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.connect_and_run().await {
                Ok(ConnectionOutcome::Shutdown) => return Ok(()),
                Ok(ConnectionOutcome::Disconnected(reason)) => {
                    tracing::info!(reason = %reason, "websocket closed, reconnecting");
                    backoff_secs = 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    if is_fatal_connection_error(&message) {
                        tracing::error!(error = %message, "control plane rejected session, stopping bridge");
                        return Err(SessionTerminatedError(message));
                    }
                    tracing::warn!(error = %message, "websocket error, reconnecting");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                _ = self.shutdown.cancelled() => return Ok(()),
            }
            backoff_secs = (backoff_secs * 2).min(MAX_RECONNECT_BACKOFF_SECS);
        }
    }

    fn websocket_url(&self) -> anyhow::Result<String> {
        let base = self.control_plane_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            anyhow::bail!("unsupported control plane URL scheme: {base}");
        };
        Ok(format!("{ws_base}/sandboxes/{}/bridge", self.sandbox_id))
    }

    async fn connect_and_run(&self) -> anyhow::Result<ConnectionOutcome> {
        let url = self.websocket_url()?;
        let mut request = url.clone().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.auth_token).parse()?,
        );
        request
            .headers_mut()
            .insert("X-Session-Id", self.session_id.parse()?);

        let (ws, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(ok) => ok,
            Err(WsError::Http(resp)) => {
                anyhow::bail!(
                    "server rejected WebSocket connection: HTTP {}",
                    resp.status().as_u16()
                );
            }
            Err(e) => anyhow::bail!("websocket connect failed: {e}"),
        };

        tracing::info!(sandbox_id = %self.sandbox_id, "bridge connected");
        let (sink, mut read) = ws.split();
        {
            let mut st = self.state.lock().await;
            st.socket = Some(Box::new(BridgeSocket::new(sink)));
        }

        // Replay order: buffered events first, then unacknowledged criticals
        // (minus the ones the buffer flush just re-sent).
        let just_flushed = self.flush_event_buffer().await;
        self.flush_pending_acks(&just_flushed).await;

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // the first tick is immediate

        let outcome: anyhow::Result<ConnectionOutcome> = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(ConnectionOutcome::Shutdown),
                _ = heartbeat.tick() => {
                    self.send_event(json!({ "type": "heartbeat" })).await;
                }
                msg = read.next() => match msg {
                    None => break Ok(ConnectionOutcome::Disconnected("stream ended".into())),
                    Some(Err(e)) => break Err(anyhow::anyhow!("websocket read error: {e}")),
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Value>(&text) {
                            Ok(command) => self.handle_command(command).await,
                            Err(e) => tracing::warn!(error = %e, "failed to parse bridge command"),
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        break Ok(ConnectionOutcome::Disconnected("close frame".into()));
                    }
                    Some(Ok(_)) => {} // ping/pong/binary
                }
            }
        };

        let mut st = self.state.lock().await;
        st.socket = None;
        drop(st);

        outcome
    }

    // ── Outbound events ─────────────────────────────────────────────

    /// Send one event to the control plane, buffering it whenever the socket
    /// is missing, closed, or the write fails.
    pub async fn send_event(&self, mut event: Value) {
        self.stamp(&mut event);

        let kind = event["type"].as_str().unwrap_or_default().to_string();
        if is_critical(&kind) && event.get("ackId").is_none() {
            let ack_id = make_ack_id(&event);
            event["ackId"] = json!(ack_id);
        }

        let mut st = self.state.lock().await;
        let text = event.to_string();
        let send_result = match st.socket.as_mut() {
            Some(socket) if socket.is_open() => Some(socket.send_text(text).await),
            _ => None,
        };

        match send_result {
            None => buffer_event(&mut st, event),
            Some(Ok(())) => {
                if is_critical(&kind) {
                    if let Some(ack_id) = event["ackId"].as_str().map(str::to_string) {
                        st.pending_acks.insert(ack_id, event);
                    }
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, event_type = %kind, "event write failed, buffering");
                buffer_event(&mut st, event);
            }
        }
    }

    fn stamp(&self, event: &mut Value) {
        if event.get("sandboxId").is_none() {
            event["sandboxId"] = json!(self.sandbox_id);
        }
        if event.get("timestamp").is_none() {
            event["timestamp"] = json!(Utc::now().to_rfc3339());
        }
    }

    /// Flush the event buffer FIFO onto the current socket. Stops at the
    /// first write failure, leaving the remainder (including the failed
    /// event) buffered. Returns the ack ids of critical events that entered
    /// `pending_acks` during this flush.
    pub async fn flush_event_buffer(&self) -> HashSet<String> {
        let mut just_added = HashSet::new();
        let mut st = self.state.lock().await;
        if st.event_buffer.is_empty() {
            return just_added;
        }

        while let Some(mut event) = st.event_buffer.pop_front() {
            let kind = event["type"].as_str().unwrap_or_default().to_string();
            if is_critical(&kind) && event.get("ackId").is_none() {
                event["ackId"] = json!(make_ack_id(&event));
            }

            let text = event.to_string();
            let sent = match st.socket.as_mut() {
                Some(socket) if socket.is_open() => socket.send_text(text).await.is_ok(),
                _ => false,
            };

            if sent {
                if is_critical(&kind) {
                    if let Some(ack_id) = event["ackId"].as_str().map(str::to_string) {
                        st.pending_acks.insert(ack_id.clone(), event);
                        just_added.insert(ack_id);
                    }
                }
            } else {
                st.event_buffer.push_front(event);
                break;
            }
        }

        just_added
    }

    /// Re-send every unacknowledged critical event on the current socket.
    /// Entries stay in `pending_acks`; only an inbound `ack` removes them.
    pub async fn flush_pending_acks(&self, skip_ack_ids: &HashSet<String>) {
        let mut st = self.state.lock().await;
        if st.pending_acks.is_empty() {
            return;
        }

        let entries: Vec<(String, Value)> = st
            .pending_acks
            .iter()
            .filter(|(ack_id, _)| !skip_ack_ids.contains(*ack_id))
            .map(|(ack_id, event)| (ack_id.clone(), event.clone()))
            .collect();

        for (ack_id, event) in entries {
            let text = event.to_string();
            let sent = match st.socket.as_mut() {
                Some(socket) if socket.is_open() => socket.send_text(text).await.is_ok(),
                _ => false,
            };
            if !sent {
                tracing::warn!(ack_id = %ack_id, "pending-ack re-send failed, will retry on next connect");
                break;
            }
        }
    }

    // ── Inbound commands ────────────────────────────────────────────

    pub async fn handle_command(&self, command: Value) {
        match command["type"].as_str().unwrap_or_default() {
            "ack" => {
                if let Some(ack_id) = command.get("ackId").and_then(|v| v.as_str()) {
                    let mut st = self.state.lock().await;
                    if st.pending_acks.remove(ack_id).is_some() {
                        tracing::debug!(ack_id = %ack_id, "event acknowledged");
                    }
                }
            }
            "prompt" => self.spawn_prompt(command).await,
            "stop" => self.handle_stop().await,
            other => {
                tracing::debug!(command = %other, "ignoring unknown bridge command");
            }
        }
    }

    async fn spawn_prompt(&self, command: Value) {
        let message_id = command
            .get("messageId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let generation = self.prompt_seq.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        tracing::info!(message_id = %message_id, "starting prompt task");

        // Hold the lock across the spawn so the task cannot observe (or try
        // to clear) `current_prompt` before this generation is recorded.
        let mut st = self.state.lock().await;

        let bridge = self.clone();
        let task_cancel = cancel.clone();
        let task_message_id = message_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                result = bridge.handle_prompt(&command) => result,
                _ = task_cancel.cancelled() => {
                    tracing::info!(message_id = %task_message_id, "prompt task cancelled");
                    Err(anyhow::anyhow!("prompt cancelled"))
                }
            };

            let success = match &outcome {
                Ok(()) => true,
                Err(e) => {
                    if !task_cancel.is_cancelled() {
                        tracing::error!(message_id = %task_message_id, error = %e, "prompt failed");
                    }
                    false
                }
            };

            // Every completion path reports back, cancelled ones included.
            bridge
                .send_event(json!({
                    "type": "execution_complete",
                    "messageId": task_message_id,
                    "success": success,
                }))
                .await;

            // Only clear the slot if a newer prompt has not replaced us.
            let mut st = bridge.state.lock().await;
            if st
                .current_prompt
                .as_ref()
                .is_some_and(|task| task.generation == generation)
            {
                st.current_prompt = None;
            }
        });

        st.current_prompt = Some(PromptTask {
            message_id,
            generation,
            cancel,
            handle,
        });
    }

    async fn handle_prompt(&self, command: &Value) -> anyhow::Result<()> {
        let message_id = command
            .get("messageId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        {
            let mut st = self.state.lock().await;
            st.inflight_message_id = Some(message_id.clone());
        }

        let Some(session_id) = self.acquire_agent_session().await else {
            anyhow::bail!("bridge is shutting down");
        };

        let content = command
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let mut stream = self
            .agent
            .send_prompt(&session_id, &message_id, content)
            .await?;

        while let Some(event) = stream.next().await {
            let event = event?;
            match event.kind.as_str() {
                "server.connected" => {
                    tracing::debug!("agent event stream connected");
                }
                "session.idle" => {
                    let idle_session = event.properties.get("sessionID").and_then(|v| v.as_str());
                    if idle_session.is_none_or(|s| s == session_id) {
                        break;
                    }
                }
                "message.part.updated" => {
                    if let Some(text) = event
                        .properties
                        .pointer("/part/text")
                        .and_then(|v| v.as_str())
                    {
                        self.send_event(json!({
                            "type": "token",
                            "messageId": message_id,
                            "content": text,
                        }))
                        .await;
                    }
                }
                "session.error" => {
                    let detail = event
                        .properties
                        .get("error")
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "agent error".to_string());
                    self.send_event(json!({
                        "type": "error",
                        "messageId": message_id,
                        "error": detail,
                    }))
                    .await;
                    anyhow::bail!("agent reported session error: {detail}");
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn handle_stop(&self) {
        let session_id = {
            let st = self.state.lock().await;
            if let Some(task) = &st.current_prompt {
                if !task.handle.is_finished() {
                    tracing::info!(message_id = %task.message_id, "stop requested, cancelling prompt task");
                    task.cancel.cancel();
                }
            }
            st.opencode_session_id.clone()
        };

        // Best-effort agent-side abort, issued whether or not a task exists.
        if let Some(session_id) = session_id {
            if let Err(e) = self.agent.abort(&session_id).await {
                tracing::debug!(error = %e, "agent abort failed");
            }
        }
    }
}

/// Ack id generation: deterministic for events tied to a prompt (so retried
/// prompt outcomes deduplicate), random otherwise.
fn make_ack_id(event: &Value) -> String {
    let kind = event["type"].as_str().unwrap_or("event");
    if let Some(message_id) = event.get("messageId").and_then(|v| v.as_str()) {
        return format!("{kind}:{message_id}");
    }
    let mut suffix = [0u8; 8];
    if getrandom::fill(&mut suffix).is_err() {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        suffix = nanos.to_le_bytes();
    }
    format!("{kind}:{}", hex::encode(suffix))
}

/// Append to the buffer, evicting under pressure: the first non-critical
/// entry goes first; if every buffered event is critical, the oldest goes.
/// Survivors keep their FIFO order, though ordering across an eviction gap
/// is no longer guaranteed.
fn buffer_event(st: &mut BridgeState, event: Value) {
    if st.event_buffer.len() >= st.max_buffer {
        let non_critical = st
            .event_buffer
            .iter()
            .position(|e| !is_critical(e["type"].as_str().unwrap_or_default()));
        match non_critical {
            Some(index) => {
                st.event_buffer.remove(index);
            }
            None => {
                st.event_buffer.pop_front();
            }
        }
        tracing::warn!(
            buffer_size = st.event_buffer.len() + 1,
            "event buffer full, evicted one event"
        );
    }
    st.event_buffer.push_back(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::agent::{AgentApi, AgentEventStream, AgentSseEvent};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    // ── Fakes ───────────────────────────────────────────────────────

    /// Agent whose prompts complete when released (or immediately).
    #[derive(Default)]
    struct FakeAgent {
        hang: bool,
        gates: StdMutex<HashMap<String, Arc<Notify>>>,
        aborts: StdMutex<Vec<String>>,
    }

    impl FakeAgent {
        fn gated() -> Self {
            Self {
                hang: true,
                ..Default::default()
            }
        }

        fn gate(&self, message_id: &str) -> Arc<Notify> {
            self.gates
                .lock()
                .unwrap()
                .entry(message_id.to_string())
                .or_default()
                .clone()
        }

        fn release(&self, message_id: &str) {
            self.gate(message_id).notify_one();
        }
    }

    #[async_trait]
    impl AgentApi for FakeAgent {
        async fn ensure_session(&self) -> anyhow::Result<String> {
            Ok("oc-session-123".to_string())
        }

        async fn send_prompt(
            &self,
            _session_id: &str,
            message_id: &str,
            _content: &str,
        ) -> anyhow::Result<AgentEventStream> {
            if self.hang {
                let gate = self.gate(message_id);
                Ok(Box::pin(futures::stream::once(async move {
                    gate.notified().await;
                    anyhow::Ok(AgentSseEvent {
                        kind: "session.idle".to_string(),
                        properties: Value::Null,
                    })
                })))
            } else {
                let events: Vec<anyhow::Result<AgentSseEvent>> = vec![
                    Ok(AgentSseEvent {
                        kind: "server.connected".to_string(),
                        properties: json!({}),
                    }),
                    Ok(AgentSseEvent {
                        kind: "session.idle".to_string(),
                        properties: json!({ "sessionID": "oc-session-123" }),
                    }),
                ];
                Ok(Box::pin(futures::stream::iter(events)))
            }
        }

        async fn abort(&self, session_id: &str) -> anyhow::Result<()> {
            self.aborts.lock().unwrap().push(session_id.to_string());
            Ok(())
        }
    }

    /// Socket that records frames and optionally fails after N good writes.
    struct FakeSocket {
        sent: Arc<StdMutex<Vec<String>>>,
        open: bool,
        fail_after: Option<usize>,
    }

    impl FakeSocket {
        fn new(sent: Arc<StdMutex<Vec<String>>>) -> Self {
            Self {
                sent,
                open: true,
                fail_after: None,
            }
        }

        fn failing_after(sent: Arc<StdMutex<Vec<String>>>, ok_writes: usize) -> Self {
            Self {
                sent,
                open: true,
                fail_after: Some(ok_writes),
            }
        }

        fn closed(sent: Arc<StdMutex<Vec<String>>>) -> Self {
            Self {
                sent,
                open: false,
                fail_after: None,
            }
        }
    }

    #[async_trait]
    impl EventSocket for FakeSocket {
        fn is_open(&self) -> bool {
            self.open
        }

        async fn send_text(&mut self, text: String) -> Result<(), crate::sandbox::socket::SocketError> {
            if let Some(limit) = self.fail_after {
                if self.sent.lock().unwrap().len() >= limit {
                    return Err(crate::sandbox::socket::SocketError("broken pipe".into()));
                }
            }
            self.sent.lock().unwrap().push(text);
            Ok(())
        }
    }

    struct TestBridge {
        bridge: AgentBridge,
        agent: Arc<FakeAgent>,
        sent: Arc<StdMutex<Vec<String>>>,
        shutdown: CancellationToken,
    }

    fn test_bridge(agent: FakeAgent) -> TestBridge {
        let agent = Arc::new(agent);
        let shutdown = CancellationToken::new();
        let bridge = AgentBridge::new(
            "test-sandbox",
            "test-session",
            "http://localhost:8787",
            "test-token",
            agent.clone(),
            shutdown.clone(),
        );
        TestBridge {
            bridge,
            agent,
            sent: Arc::new(StdMutex::new(Vec::new())),
            shutdown,
        }
    }

    impl TestBridge {
        async fn open_socket(&self) {
            let mut st = self.bridge.state.lock().await;
            st.socket = Some(Box::new(FakeSocket::new(self.sent.clone())));
        }

        async fn set_session(&self) {
            let mut st = self.bridge.state.lock().await;
            st.opencode_session_id = Some("oc-session-123".to_string());
        }

        fn sent_events(&self) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|text| serde_json::from_str(text).unwrap())
                .collect()
        }

        async fn pending_ack_ids(&self) -> Vec<String> {
            let st = self.bridge.state.lock().await;
            let mut ids: Vec<String> = st.pending_acks.keys().cloned().collect();
            ids.sort();
            ids
        }

        async fn buffer_types(&self) -> Vec<String> {
            let st = self.bridge.state.lock().await;
            st.event_buffer
                .iter()
                .map(|e| e["type"].as_str().unwrap_or_default().to_string())
                .collect()
        }
    }

    // ── Ack id generation ───────────────────────────────────────────

    #[test]
    fn deterministic_ack_id_with_message_id() {
        let event = json!({ "type": "execution_complete", "messageId": "msg-1" });
        assert_eq!(make_ack_id(&event), "execution_complete:msg-1");
    }

    #[test]
    fn random_ack_id_without_message_id() {
        let event = json!({ "type": "snapshot_ready" });
        let ack_id = make_ack_id(&event);
        let (prefix, suffix) = ack_id.split_once(':').unwrap();
        assert_eq!(prefix, "snapshot_ready");
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn random_ack_ids_are_unique() {
        let event = json!({ "type": "snapshot_ready" });
        let ids: HashSet<String> = (0..10).map(|_| make_ack_id(&event)).collect();
        assert_eq!(ids.len(), 10);
    }

    // ── send_event ──────────────────────────────────────────────────

    #[tokio::test]
    async fn critical_event_gets_ack_id_and_pending_entry() {
        let t = test_bridge(FakeAgent::default());
        t.open_socket().await;

        t.bridge
            .send_event(json!({ "type": "execution_complete", "messageId": "msg-1", "success": true }))
            .await;

        let sent = t.sent_events();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["ackId"], "execution_complete:msg-1");
        assert_eq!(sent[0]["sandboxId"], "test-sandbox");
        assert!(sent[0].get("timestamp").is_some());
        assert_eq!(t.pending_ack_ids().await, vec!["execution_complete:msg-1"]);
    }

    #[tokio::test]
    async fn non_critical_event_has_no_ack_id() {
        let t = test_bridge(FakeAgent::default());
        t.open_socket().await;

        t.bridge
            .send_event(json!({ "type": "token", "content": "hello", "messageId": "msg-1" }))
            .await;

        let sent = t.sent_events();
        assert!(sent[0].get("ackId").is_none());
        assert!(t.pending_ack_ids().await.is_empty());
    }

    #[tokio::test]
    async fn send_failure_buffers_without_pending_entry() {
        let t = test_bridge(FakeAgent::default());
        {
            let mut st = t.bridge.state.lock().await;
            st.socket = Some(Box::new(FakeSocket::failing_after(t.sent.clone(), 0)));
        }

        t.bridge
            .send_event(json!({ "type": "execution_complete", "messageId": "msg-1", "success": true }))
            .await;

        assert_eq!(t.buffer_types().await, vec!["execution_complete"]);
        assert!(t.pending_ack_ids().await.is_empty());
    }

    #[tokio::test]
    async fn existing_ack_id_is_never_overwritten() {
        let t = test_bridge(FakeAgent::default());
        t.open_socket().await;

        t.bridge
            .send_event(json!({
                "type": "execution_complete",
                "messageId": "msg-1",
                "ackId": "custom:id",
            }))
            .await;

        assert_eq!(t.sent_events()[0]["ackId"], "custom:id");
        assert_eq!(t.pending_ack_ids().await, vec!["custom:id"]);
    }

    #[tokio::test]
    async fn buffers_when_socket_missing_or_closed() {
        let t = test_bridge(FakeAgent::default());

        t.bridge.send_event(json!({ "type": "token", "content": "a" })).await;
        assert_eq!(t.buffer_types().await, vec!["token"]);

        {
            let mut st = t.bridge.state.lock().await;
            st.socket = Some(Box::new(FakeSocket::closed(t.sent.clone())));
        }
        t.bridge
            .send_event(json!({ "type": "execution_complete", "messageId": "msg-1" }))
            .await;
        assert_eq!(t.buffer_types().await, vec!["token", "execution_complete"]);
        assert!(t.sent.lock().unwrap().is_empty());

        // Stamps happen before buffering.
        let st = t.bridge.state.lock().await;
        assert_eq!(st.event_buffer[0]["sandboxId"], "test-sandbox");
        assert!(st.event_buffer[0].get("timestamp").is_some());
    }

    // ── Buffer overflow ─────────────────────────────────────────────

    #[tokio::test]
    async fn overflow_evicts_non_critical_first() {
        let t = test_bridge(FakeAgent::default());
        {
            let mut st = t.bridge.state.lock().await;
            st.max_buffer = 3;
            st.event_buffer = VecDeque::from(vec![
                json!({ "type": "execution_complete", "messageId": "msg-1" }),
                json!({ "type": "token", "content": "a" }),
                json!({ "type": "error", "messageId": "msg-2" }),
            ]);
        }

        t.bridge.send_event(json!({ "type": "snapshot_ready" })).await;

        let types = t.buffer_types().await;
        assert_eq!(types.len(), 3);
        assert!(!types.contains(&"token".to_string()));
        assert_eq!(types, vec!["execution_complete", "error", "snapshot_ready"]);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_when_all_critical() {
        let t = test_bridge(FakeAgent::default());
        {
            let mut st = t.bridge.state.lock().await;
            st.max_buffer = 2;
            st.event_buffer = VecDeque::from(vec![
                json!({ "type": "execution_complete", "messageId": "msg-1" }),
                json!({ "type": "error", "messageId": "msg-2" }),
            ]);
        }

        t.bridge.send_event(json!({ "type": "push_complete" })).await;

        assert_eq!(t.buffer_types().await, vec!["error", "push_complete"]);
    }

    // ── Buffer flush ────────────────────────────────────────────────

    #[tokio::test]
    async fn flush_sends_fifo_and_registers_criticals() {
        let t = test_bridge(FakeAgent::default());
        {
            let mut st = t.bridge.state.lock().await;
            st.event_buffer = VecDeque::from(vec![
                json!({ "type": "token", "content": "a" }),
                json!({ "type": "execution_complete", "messageId": "msg-1" }),
            ]);
        }
        t.open_socket().await;

        let just_added = t.bridge.flush_event_buffer().await;

        assert!(t.buffer_types().await.is_empty());
        let sent = t.sent_events();
        assert_eq!(sent[0]["type"], "token");
        assert_eq!(sent[1]["type"], "execution_complete");
        assert_eq!(t.pending_ack_ids().await, vec!["execution_complete:msg-1"]);
        assert_eq!(
            just_added,
            HashSet::from(["execution_complete:msg-1".to_string()])
        );
    }

    #[tokio::test]
    async fn flush_returns_empty_set_for_non_critical() {
        let t = test_bridge(FakeAgent::default());
        {
            let mut st = t.bridge.state.lock().await;
            st.event_buffer = VecDeque::from(vec![json!({ "type": "token", "content": "a" })]);
        }
        t.open_socket().await;

        let just_added = t.bridge.flush_event_buffer().await;
        assert!(just_added.is_empty());
        assert!(t.pending_ack_ids().await.is_empty());
    }

    #[tokio::test]
    async fn flush_stops_on_first_failure() {
        let t = test_bridge(FakeAgent::default());
        {
            let mut st = t.bridge.state.lock().await;
            st.event_buffer = VecDeque::from(vec![
                json!({ "type": "token", "content": "a" }),
                json!({ "type": "token", "content": "b" }),
                json!({ "type": "execution_complete", "messageId": "msg-1" }),
            ]);
            st.socket = Some(Box::new(FakeSocket::failing_after(t.sent.clone(), 1)));
        }

        t.bridge.flush_event_buffer().await;

        let st = t.bridge.state.lock().await;
        assert_eq!(st.event_buffer.len(), 2);
        assert_eq!(st.event_buffer[0]["content"], "b");
        assert_eq!(st.event_buffer[1]["type"], "execution_complete");
    }

    #[tokio::test]
    async fn flush_is_noop_on_empty_buffer() {
        let t = test_bridge(FakeAgent::default());
        t.open_socket().await;
        assert!(t.bridge.flush_event_buffer().await.is_empty());
        assert!(t.sent.lock().unwrap().is_empty());
    }

    // ── Pending-ack flush ───────────────────────────────────────────

    #[tokio::test]
    async fn pending_flush_resends_without_removing() {
        let t = test_bridge(FakeAgent::default());
        {
            let mut st = t.bridge.state.lock().await;
            st.pending_acks.insert(
                "execution_complete:msg-1".into(),
                json!({ "type": "execution_complete", "messageId": "msg-1", "ackId": "execution_complete:msg-1" }),
            );
            st.pending_acks.insert(
                "error:msg-2".into(),
                json!({ "type": "error", "messageId": "msg-2", "ackId": "error:msg-2" }),
            );
        }
        t.open_socket().await;

        t.bridge.flush_pending_acks(&HashSet::new()).await;

        assert_eq!(t.sent.lock().unwrap().len(), 2);
        assert_eq!(t.pending_ack_ids().await.len(), 2);
    }

    #[tokio::test]
    async fn pending_flush_skips_just_flushed_ids() {
        let t = test_bridge(FakeAgent::default());
        {
            let mut st = t.bridge.state.lock().await;
            st.pending_acks.insert(
                "execution_complete:msg-1".into(),
                json!({ "type": "execution_complete", "ackId": "execution_complete:msg-1" }),
            );
            st.pending_acks.insert(
                "error:msg-2".into(),
                json!({ "type": "error", "ackId": "error:msg-2" }),
            );
        }
        t.open_socket().await;

        let skip = HashSet::from(["execution_complete:msg-1".to_string()]);
        t.bridge.flush_pending_acks(&skip).await;

        let sent = t.sent_events();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["ackId"], "error:msg-2");
        assert_eq!(t.pending_ack_ids().await.len(), 2);
    }

    #[tokio::test]
    async fn pending_flush_stops_on_failure_and_keeps_entries() {
        let t = test_bridge(FakeAgent::default());
        {
            let mut st = t.bridge.state.lock().await;
            st.pending_acks.insert(
                "a:1".into(),
                json!({ "type": "execution_complete", "ackId": "a:1" }),
            );
            st.pending_acks
                .insert("b:2".into(), json!({ "type": "error", "ackId": "b:2" }));
            st.socket = Some(Box::new(FakeSocket::failing_after(t.sent.clone(), 1)));
        }

        t.bridge.flush_pending_acks(&HashSet::new()).await;

        assert_eq!(t.pending_ack_ids().await.len(), 2);
    }

    #[tokio::test]
    async fn pending_flush_is_noop_when_empty() {
        let t = test_bridge(FakeAgent::default());
        t.open_socket().await;
        t.bridge.flush_pending_acks(&HashSet::new()).await;
        assert!(t.sent.lock().unwrap().is_empty());
    }

    // ── ack command ─────────────────────────────────────────────────

    #[tokio::test]
    async fn ack_command_clears_matching_entry() {
        let t = test_bridge(FakeAgent::default());
        {
            let mut st = t.bridge.state.lock().await;
            st.pending_acks.insert(
                "execution_complete:msg-1".into(),
                json!({ "type": "execution_complete", "ackId": "execution_complete:msg-1" }),
            );
        }

        t.bridge
            .handle_command(json!({ "type": "ack", "ackId": "execution_complete:msg-1" }))
            .await;
        assert!(t.pending_ack_ids().await.is_empty());

        // Unknown ids and missing ackId fields are no-ops.
        {
            let mut st = t.bridge.state.lock().await;
            st.pending_acks.insert(
                "execution_complete:msg-1".into(),
                json!({ "type": "execution_complete" }),
            );
        }
        t.bridge
            .handle_command(json!({ "type": "ack", "ackId": "execution_complete:msg-999" }))
            .await;
        t.bridge.handle_command(json!({ "type": "ack" })).await;
        assert_eq!(t.pending_ack_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_command_type_is_ignored() {
        let t = test_bridge(FakeAgent::default());
        t.bridge
            .handle_command(json!({ "type": "mystery", "payload": 1 }))
            .await;
        // Nothing buffered, nothing pending, no task.
        assert!(t.buffer_types().await.is_empty());
        assert!(t.pending_ack_ids().await.is_empty());
    }

    // ── Prompt lifecycle ────────────────────────────────────────────

    #[tokio::test]
    async fn prompt_sets_current_task_and_clears_on_completion() {
        let t = test_bridge(FakeAgent::default());
        t.set_session().await;

        t.bridge
            .handle_command(json!({ "type": "prompt", "messageId": "msg-1", "content": "hello" }))
            .await;

        {
            let st = t.bridge.state.lock().await;
            assert_eq!(
                st.current_prompt.as_ref().unwrap().message_id,
                "msg-1"
            );
        }

        for _ in 0..100 {
            tokio::task::yield_now().await;
            if t.bridge.state.lock().await.current_prompt.is_none() {
                break;
            }
        }

        let st = t.bridge.state.lock().await;
        assert!(st.current_prompt.is_none());
        assert_eq!(st.inflight_message_id.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn prompt_completion_emits_execution_complete_success() {
        let t = test_bridge(FakeAgent::default());
        t.set_session().await;
        t.open_socket().await;

        t.bridge
            .handle_command(json!({ "type": "prompt", "messageId": "msg-1", "content": "hello" }))
            .await;

        // Wait for the task to finish.
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if t.bridge.state.lock().await.current_prompt.is_none() {
                break;
            }
        }

        let complete: Vec<Value> = t
            .sent_events()
            .into_iter()
            .filter(|e| e["type"] == "execution_complete")
            .collect();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0]["messageId"], "msg-1");
        assert_eq!(complete[0]["success"], true);
    }

    #[tokio::test]
    async fn prompt_survives_socket_loss() {
        let t = test_bridge(FakeAgent::gated());
        t.set_session().await;

        t.bridge
            .handle_command(json!({ "type": "prompt", "messageId": "msg-1", "content": "x" }))
            .await;
        tokio::task::yield_now().await;

        // Drop the socket, as the connection loop does on disconnect.
        {
            let mut st = t.bridge.state.lock().await;
            st.socket = None;
        }
        tokio::task::yield_now().await;

        {
            let st = t.bridge.state.lock().await;
            let task = st.current_prompt.as_ref().unwrap();
            assert!(!task.handle.is_finished());
        }

        t.agent.release("msg-1");
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if t.bridge.state.lock().await.current_prompt.is_none() {
                break;
            }
        }
        assert!(t.bridge.state.lock().await.current_prompt.is_none());
    }

    #[tokio::test]
    async fn run_exit_cancels_prompt_task() {
        let t = test_bridge(FakeAgent::gated());
        t.set_session().await;

        t.bridge
            .handle_command(json!({ "type": "prompt", "messageId": "msg-1", "content": "x" }))
            .await;
        tokio::task::yield_now().await;

        // Shutdown already set: run() skips connecting and cancels the task.
        t.shutdown.cancel();
        t.bridge.run().await.unwrap();

        let st = t.bridge.state.lock().await;
        assert!(st.current_prompt.is_none());
        let complete: Vec<&Value> = st
            .event_buffer
            .iter()
            .filter(|e| e["type"] == "execution_complete")
            .collect();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0]["messageId"], "msg-1");
        assert_eq!(complete[0]["success"], false);
    }

    #[tokio::test]
    async fn stop_cancels_running_prompt_and_aborts_agent() {
        let t = test_bridge(FakeAgent::gated());
        t.set_session().await;

        t.bridge
            .handle_command(json!({ "type": "prompt", "messageId": "msg-cancel", "content": "x" }))
            .await;
        tokio::task::yield_now().await;

        t.bridge.handle_command(json!({ "type": "stop" })).await;

        for _ in 0..100 {
            tokio::task::yield_now().await;
            if t.bridge.state.lock().await.current_prompt.is_none() {
                break;
            }
        }

        // Exactly one execution_complete with success=false, buffered since
        // there is no socket.
        let st = t.bridge.state.lock().await;
        let complete: Vec<&Value> = st
            .event_buffer
            .iter()
            .filter(|e| e["type"] == "execution_complete")
            .collect();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0]["messageId"], "msg-cancel");
        assert_eq!(complete[0]["success"], false);
        drop(st);

        assert_eq!(
            t.agent.aborts.lock().unwrap().as_slice(),
            ["oc-session-123"]
        );
    }

    #[tokio::test]
    async fn stop_without_task_still_aborts_agent() {
        let t = test_bridge(FakeAgent::default());
        t.set_session().await;

        t.bridge.handle_command(json!({ "type": "stop" })).await;

        assert_eq!(
            t.agent.aborts.lock().unwrap().as_slice(),
            ["oc-session-123"]
        );
    }

    #[tokio::test]
    async fn older_prompt_completion_does_not_clear_newer_task() {
        let t = test_bridge(FakeAgent::gated());
        t.set_session().await;

        t.bridge
            .handle_command(json!({ "type": "prompt", "messageId": "msg-old", "content": "old" }))
            .await;
        let old_generation = {
            let st = t.bridge.state.lock().await;
            st.current_prompt.as_ref().unwrap().generation
        };

        t.bridge
            .handle_command(json!({ "type": "prompt", "messageId": "msg-new", "content": "new" }))
            .await;
        {
            let st = t.bridge.state.lock().await;
            let task = st.current_prompt.as_ref().unwrap();
            assert_eq!(task.message_id, "msg-new");
            assert_ne!(task.generation, old_generation);
        }

        t.agent.release("msg-old");
        for _ in 0..100 {
            tokio::task::yield_now().await;
        }

        // The newer task still owns the slot.
        {
            let st = t.bridge.state.lock().await;
            assert_eq!(
                st.current_prompt.as_ref().unwrap().message_id,
                "msg-new"
            );
        }

        t.agent.release("msg-new");
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if t.bridge.state.lock().await.current_prompt.is_none() {
                break;
            }
        }
        assert!(t.bridge.state.lock().await.current_prompt.is_none());
    }

    #[tokio::test]
    async fn execution_complete_buffered_then_flushed_on_reconnect() {
        let t = test_bridge(FakeAgent::default());

        t.bridge
            .send_event(json!({ "type": "execution_complete", "messageId": "msg-1", "success": true }))
            .await;
        assert_eq!(t.buffer_types().await, vec!["execution_complete"]);

        t.open_socket().await;
        let just_added = t.bridge.flush_event_buffer().await;
        t.bridge.flush_pending_acks(&just_added).await;

        // Sent exactly once despite traversing both flush paths.
        let sent = t.sent_events();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "execution_complete");
        assert_eq!(sent[0]["messageId"], "msg-1");
        assert_eq!(sent[0]["success"], true);
        assert_eq!(t.pending_ack_ids().await, vec!["execution_complete:msg-1"]);

        // The control plane's ack drains the pending set.
        t.bridge
            .handle_command(json!({ "type": "ack", "ackId": "execution_complete:msg-1" }))
            .await;
        assert!(t.pending_ack_ids().await.is_empty());
    }

    // ── Connection failure classification ───────────────────────────

    #[test]
    fn fatal_statuses_are_fatal() {
        for status in [401, 403, 404, 410] {
            let error = format!("server rejected WebSocket connection: HTTP {status}");
            assert!(is_fatal_connection_error(&error), "{status} should be fatal");
        }
    }

    #[test]
    fn other_errors_are_retriable() {
        assert!(!is_fatal_connection_error(
            "server rejected WebSocket connection: HTTP 500"
        ));
        assert!(!is_fatal_connection_error("Connection refused"));
        assert!(!is_fatal_connection_error("Connection timed out"));
        assert!(!is_fatal_connection_error(""));
    }

    #[test]
    fn websocket_url_maps_schemes() {
        let t = test_bridge(FakeAgent::default());
        assert_eq!(
            t.bridge.websocket_url().unwrap(),
            "ws://localhost:8787/sandboxes/test-sandbox/bridge"
        );

        let agent: Arc<dyn AgentApi> = Arc::new(FakeAgent::default());
        let https = AgentBridge::new(
            "sbx",
            "sess",
            "https://cp.example.com/",
            "tok",
            agent,
            CancellationToken::new(),
        );
        assert_eq!(
            https.websocket_url().unwrap(),
            "wss://cp.example.com/sandboxes/sbx/bridge"
        );
    }
}
