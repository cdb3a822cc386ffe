//! Per-agent operations handed to user code and to the cognitive loop:
//! emit/request/reply/tool/join_thread plus the memory RPC helpers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use loom_proto::{client_event, ClientEvent, ExecutionRecord, PlanRecord, Publish, ToolCall, ToolStatus};

use crate::envelope::{agent_reply_topic, Envelope};
use crate::telemetry;
use crate::{Result, TransportError};

use super::bridge_client::BridgeClient;

/// Correlation-id → one-shot waiter map. At most one pending waiter per id;
/// a duplicate or late delivery against an already-resolved id is a no-op.
#[derive(Clone)]
pub struct PendingReplies {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<Envelope>>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn register(&self, correlation_id: String) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().await.insert(correlation_id, tx);
        rx
    }

    async fn deregister(&self, correlation_id: &str) {
        self.inner.lock().await.remove(correlation_id);
    }

    /// Completes the waiter for `correlation_id`, if one is pending. Silently
    /// does nothing when there is no correlation id, no pending waiter, or the
    /// waiter was already resolved (receiver dropped).
    pub async fn complete_if_pending(&self, correlation_id: Option<&str>, envelope: Envelope) {
        let Some(correlation_id) = correlation_id else { return };
        if let Some(tx) = self.inner.lock().await.remove(correlation_id) {
            let _ = tx.send(envelope);
        }
    }
}

impl Default for PendingReplies {
    fn default() -> Self {
        Self::new()
    }
}

/// Computes the plan-dedup hash: first 8 hex chars of MD5("{symbol}|{action}|{reasoning}").
pub fn plan_hash(symbol: &str, action: &str, reasoning: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{symbol}|{action}|{reasoning}").as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..8].to_string()
}

#[derive(Clone)]
pub struct EventContext {
    agent_id: String,
    outbound_tx: mpsc::Sender<ClientEvent>,
    pending_replies: PendingReplies,
    bridge: Arc<Mutex<BridgeClient>>,
}

impl EventContext {
    pub fn new(
        agent_id: String,
        outbound_tx: mpsc::Sender<ClientEvent>,
        pending_replies: PendingReplies,
        bridge_address: String,
    ) -> Self {
        Self {
            agent_id,
            outbound_tx,
            pending_replies,
            bridge: Arc::new(Mutex::new(BridgeClient::new(bridge_address))),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn reply_topic(&self) -> String {
        agent_reply_topic(&self.agent_id)
    }

    async fn enqueue_publish(&self, topic: String, envelope: Envelope) -> Result<()> {
        let frame = ClientEvent {
            msg: Some(client_event::Msg::Publish(Publish {
                topic,
                event: Some(envelope.to_proto()),
            })),
        };
        self.outbound_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::NotBound)
    }

    /// Builds an envelope (auto-filled id/timestamp/source), injects the
    /// current span's trace context, and enqueues a `Publish`.
    pub async fn emit(&self, topic: &str, event_type: &str, payload: Vec<u8>) -> Result<()> {
        let mut envelope = Envelope::new(event_type, self.agent_id.clone(), payload).with_sender(self.agent_id.clone());
        telemetry::inject_trace_context(&Span::current(), &mut envelope.metadata);
        self.enqueue_publish(topic.to_string(), envelope).await
    }

    /// Same as `emit` but lets the caller supply a pre-built envelope (e.g.
    /// to preserve `thread_id` across a chain of emits).
    pub async fn emit_envelope(&self, topic: &str, mut envelope: Envelope) -> Result<()> {
        telemetry::inject_trace_context(&Span::current(), &mut envelope.metadata);
        self.enqueue_publish(topic.to_string(), envelope).await
    }

    /// Publishes a request envelope whose `correlation_id` equals its `id`
    /// and whose `reply_to` is this agent's reply topic, then awaits a
    /// delivery carrying that correlation id (or times out).
    pub async fn request(
        &self,
        topic: &str,
        event_type: &str,
        payload: Vec<u8>,
        timeout_ms: u64,
    ) -> Result<Envelope> {
        let mut envelope = Envelope::new(event_type, self.agent_id.clone(), payload).with_sender(self.agent_id.clone());
        let id = envelope.id.clone();
        envelope = envelope.with_correlation_id(id).with_reply_to(self.reply_topic());
        telemetry::inject_trace_context(&Span::current(), &mut envelope.metadata);

        let correlation_id = envelope
            .correlation_id()
            .expect("correlation_id was just set")
            .to_string();
        let rx = self.pending_replies.register(correlation_id.clone()).await;

        self.enqueue_publish(topic.to_string(), envelope).await?;

        let result = tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await;
        self.pending_replies.deregister(&correlation_id).await;

        match result {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) | Err(_) => Err(TransportError::RequestTimeout),
        }
    }

    /// Replies to `original`, inheriting its `correlation_id` and `thread_id`
    /// and routing to `original.reply_to()` (falling back to the sender's
    /// conventional reply topic).
    pub async fn reply(&self, original: &Envelope, event_type: &str, payload: Vec<u8>) -> Result<()> {
        let destination = original
            .reply_to()
            .map(str::to_string)
            .or_else(|| original.sender().map(agent_reply_topic))
            .ok_or(TransportError::NotBound)?;

        let mut envelope = Envelope::new(event_type, self.agent_id.clone(), payload).with_sender(self.agent_id.clone());
        if let Some(correlation_id) = original.correlation_id() {
            envelope = envelope.with_correlation_id(correlation_id.to_string());
        }
        if let Some(thread_id) = original.thread_id() {
            envelope = envelope.with_thread_id(thread_id.to_string());
        }
        telemetry::inject_trace_context(&Span::current(), &mut envelope.metadata);

        self.enqueue_publish(destination, envelope).await
    }

    /// Invokes a remote tool over the bridge's unary `ForwardToolCall` RPC.
    pub async fn tool(
        &self,
        name: &str,
        payload: Option<serde_json::Value>,
        timeout_ms: u64,
        headers: Option<HashMap<String, String>>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut merged_headers = HashMap::new();
        merged_headers.insert("x-correlation-id".to_string(), id.clone());
        merged_headers.insert("x-agent-id".to_string(), self.agent_id.clone());
        if let Some(headers) = headers {
            merged_headers.extend(headers);
        }

        let arguments = payload.unwrap_or(serde_json::json!({})).to_string();
        let call = ToolCall {
            id: id.clone(),
            name: name.to_string(),
            arguments,
            headers: merged_headers,
            timeout_ms: timeout_ms as i64,
            correlation_id: id,
        };

        let span = tracing::info_span!("cognitive.tool_call", tool = %name);
        async {
            let mut bridge = self.bridge.lock().await;
            bridge.connect().await?;
            let result = bridge.forward_tool_call(call).await?;

            if result.status == ToolStatus::ToolOk as i32 {
                Ok(result.output)
            } else {
                let message = result
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unknown tool error".to_string());
                Err(TransportError::ToolInvocationFailed(message))
            }
        }
        .instrument(span)
        .await
    }

    /// Reserved for future thread-subscription support. Follows the naming
    /// convention `thread.<id>.events` for a topic that does not yet exist
    /// on the bridge side.
    pub async fn join_thread(&self, _thread_id: &str) -> Result<()> {
        Ok(())
    }

    pub async fn save_plan(&self, session_id: &str, plan: PlanRecord) -> Result<String> {
        let mut bridge = self.bridge.lock().await;
        bridge.connect().await?;
        let response = bridge.save_plan(session_id, plan).await?;
        Ok(response.plan_hash)
    }

    pub async fn check_duplicate_plan(
        &self,
        session_id: &str,
        symbol: &str,
        action: &str,
        time_window_sec: i64,
    ) -> Result<bool> {
        let mut bridge = self.bridge.lock().await;
        bridge.connect().await?;
        let response = bridge
            .check_duplicate(session_id, symbol, action, time_window_sec)
            .await?;
        Ok(response.duplicate)
    }

    pub async fn mark_executed(&self, session_id: &str, execution: ExecutionRecord) -> Result<bool> {
        let mut bridge = self.bridge.lock().await;
        bridge.connect().await?;
        let response = bridge.mark_executed(session_id, execution).await?;
        Ok(response.success)
    }

    pub async fn append_episodic_event(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let mut bridge = self.bridge.lock().await;
        bridge.connect().await?;
        bridge.append_event(session_id, role, content, metadata).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_hash_is_deterministic_and_8_hex_chars() {
        let a = plan_hash("BTCUSDT", "buy", "momentum breakout");
        let b = plan_hash("BTCUSDT", "buy", "momentum breakout");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn plan_hash_differs_on_input_change() {
        let a = plan_hash("BTCUSDT", "buy", "momentum breakout");
        let b = plan_hash("BTCUSDT", "sell", "momentum breakout");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn pending_reply_completes_exactly_once() {
        let pending = PendingReplies::new();
        let rx = pending.register("corr-1".to_string()).await;

        let envelope = Envelope::new("ans", "agent.b", b"r".to_vec()).with_correlation_id("corr-1");
        pending.complete_if_pending(Some("corr-1"), envelope.clone()).await;

        let received = rx.await.expect("waiter should resolve");
        assert_eq!(received.payload, envelope.payload);

        // A second completion for the same id (now deregistered) is a no-op.
        pending.complete_if_pending(Some("corr-1"), envelope).await;
    }

    #[tokio::test]
    async fn pending_reply_ignores_missing_correlation_id() {
        let pending = PendingReplies::new();
        pending
            .complete_if_pending(None, Envelope::new("x", "a", vec![]))
            .await;
    }
}
