//! Stream-lifecycle state machine: owns the single live connection to the
//! bridge, multiplexes outbound frames, dispatches inbound deliveries and
//! tool calls, and reconnects with exponential backoff on failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use loom_proto::{client_event, server_event, Ack, ClientEvent, ToolDescriptor, ToolError as ProtoToolError, ToolResult as ProtoToolResult, ToolStatus};

use crate::envelope::{agent_reply_topic, Envelope};
use crate::telemetry;
use crate::tools::ToolRegistry;
use crate::{Result, TransportError};

use super::bridge_client::BridgeClient;
use super::context::{EventContext, PendingReplies};

const OUTBOUND_QUEUE_CAPACITY: usize = 1024;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_CEILING: Duration = Duration::from_secs(10);

/// Handler invoked on each delivered envelope: `(ctx, topic, envelope)`.
pub type EventHandler =
    Arc<dyn Fn(EventContext, String, Envelope) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Init,
    Connecting,
    Running,
    Reconnecting,
    Stopped,
}

/// Construction-time configuration for an `Agent`.
pub struct AgentConfig {
    pub agent_id: String,
    pub topics: Vec<String>,
    pub bridge_address: Option<String>,
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            topics: Vec::new(),
            bridge_address: None,
        }
    }

    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_bridge_address(mut self, address: impl Into<String>) -> Self {
        self.bridge_address = Some(address.into());
        self
    }

    fn resolved_address(&self) -> String {
        self.bridge_address.clone().unwrap_or_else(|| {
            std::env::var("LOOM_BRIDGE_ADDR").unwrap_or_else(|_| "127.0.0.1:50051".to_string())
        })
    }
}

struct Shared {
    agent_id: String,
    topics: Vec<String>,
    bridge_address: String,
    state: RwLock<AgentState>,
    outbound_tx: mpsc::Sender<ClientEvent>,
    outbound_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
    handler: RwLock<Option<EventHandler>>,
    tools: ToolRegistry,
    pending_replies: PendingReplies,
    stopping: AtomicBool,
    heartbeat_failed: tokio::sync::Notify,
}

/// Owns exactly one live stream to the bridge at a time and drives the
/// Init → Connecting → Running → Reconnecting → Stopped lifecycle.
#[derive(Clone)]
pub struct Agent {
    shared: Arc<Shared>,
}

impl Agent {
    pub fn new(config: AgentConfig, tools: ToolRegistry) -> Self {
        telemetry::init_telemetry(
            &std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| format!("agent-{}", config.agent_id)),
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let mut topics = config.topics.clone();
        let reply_topic = agent_reply_topic(&config.agent_id);
        if !topics.contains(&reply_topic) {
            topics.push(reply_topic);
        }

        let shared = Arc::new(Shared {
            agent_id: config.agent_id,
            topics,
            bridge_address: config.resolved_address(),
            state: RwLock::new(AgentState::Init),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            handler: RwLock::new(None),
            tools,
            pending_replies: PendingReplies::new(),
            stopping: AtomicBool::new(false),
            heartbeat_failed: tokio::sync::Notify::new(),
        });

        Self { shared }
    }

    pub fn agent_id(&self) -> &str {
        &self.shared.agent_id
    }

    pub async fn state(&self) -> AgentState {
        *self.shared.state.read().await
    }

    async fn set_state(&self, state: AgentState) {
        *self.shared.state.write().await = state;
    }

    pub async fn on_event(&self, handler: EventHandler) {
        *self.shared.handler.write().await = Some(handler);
    }

    /// Builds an `EventContext` bound to this agent's outbound queue and
    /// correlation map. Cheap to call repeatedly.
    pub fn context(&self) -> EventContext {
        EventContext::new(
            self.shared.agent_id.clone(),
            self.shared.outbound_tx.clone(),
            self.shared.pending_replies.clone(),
            self.shared.bridge_address.clone(),
        )
    }

    /// Starts the connect/register/stream loop, spawning the heartbeat task
    /// alongside it. Returns once the first connection attempt either
    /// succeeds (state reaches `Running`) or the agent is stopped.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        self.set_state(AgentState::Connecting).await;

        let outbound_rx = self
            .shared
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::StreamBroken("agent already started".into()))?;

        let agent = self.clone();
        let handle = tokio::spawn(async move {
            agent.run(outbound_rx).await;
        });

        Ok(handle)
    }

    pub async fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.set_state(AgentState::Stopped).await;
    }

    fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.shared
            .tools
            .list_tool_descriptors()
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name,
                description: t.description,
                parameters_schema: t.parameters_schema,
            })
            .collect()
    }

    /// Drives reconnect-with-backoff around a single connect+register+stream
    /// cycle until `stop()` is called. `outbound_rx` is reused verbatim across
    /// reconnects: the queue and its producers outlive any one stream.
    async fn run(&self, mut outbound_rx: mpsc::Receiver<ClientEvent>) {
        let mut backoff = BACKOFF_INITIAL;

        loop {
            if self.is_stopping() {
                return;
            }

            match self.connect_and_register().await {
                Ok(mut client) => {
                    backoff = BACKOFF_INITIAL;
                    self.set_state(AgentState::Running).await;

                    let heartbeat_agent = self.clone();
                    let heartbeat_handle = tokio::spawn(async move {
                        heartbeat_agent.heartbeat_loop().await;
                    });

                    self.stream_loop(&mut client, &mut outbound_rx).await;
                    heartbeat_handle.abort();

                    if self.is_stopping() {
                        return;
                    }
                    self.set_state(AgentState::Reconnecting).await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "bridge connection attempt failed");
                    self.set_state(AgentState::Reconnecting).await;
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = std::cmp::min(backoff * 2, BACKOFF_CEILING);
        }
    }

    async fn connect_and_register(&self) -> Result<BridgeClient> {
        let mut client = BridgeClient::new(self.shared.bridge_address.clone());
        client.connect().await?;
        client
            .register_agent(
                &self.shared.agent_id,
                self.shared.topics.clone(),
                self.tool_descriptors(),
                HashMap::new(),
            )
            .await?;
        Ok(client)
    }

    /// Sends the handshake `Ack` frame, then pumps outbound frames into the
    /// stream while dispatching inbound frames, until the stream breaks.
    async fn stream_loop(&self, client: &mut BridgeClient, outbound_rx: &mut mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let handshake = ClientEvent {
            msg: Some(client_event::Msg::Ack(Ack {
                message_id: self.shared.agent_id.clone(),
            })),
        };
        if tx.send(handshake).await.is_err() {
            return;
        }

        let mut inbound = match client.event_stream(rx).await {
            Ok(inbound) => inbound,
            Err(err) => {
                tracing::warn!(error = %err, "failed to open event stream");
                return;
            }
        };

        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if tx.send(frame).await.is_err() {
                                tracing::warn!("outbound channel to bridge closed");
                                return;
                            }
                        }
                        None => return,
                    }
                }
                message = inbound.message() => {
                    match message {
                        Ok(Some(server_event)) => {
                            if let Some(msg) = server_event.msg {
                                self.dispatch_inbound(client, msg).await;
                            }
                        }
                        Ok(None) => {
                            tracing::info!("bridge closed the event stream");
                            return;
                        }
                        Err(status) => {
                            tracing::warn!(error = %status, "event stream error");
                            return;
                        }
                    }
                }
                _ = self.shared.heartbeat_failed.notified() => {
                    tracing::warn!("heartbeat failure triggered reconnect");
                    return;
                }
            }

            if self.is_stopping() {
                return;
            }
        }
    }

    async fn dispatch_inbound(&self, client: &mut BridgeClient, msg: server_event::Msg) {
        match msg {
            server_event::Msg::Delivery(delivery) => {
                self.handle_delivery(delivery.topic, delivery.event).await;
            }
            server_event::Msg::ToolCall(call) => {
                self.handle_tool_call(call).await;
            }
            server_event::Msg::Pong(_) => {}
            server_event::Msg::Err(err) => {
                tracing::warn!(code = %err.code, message = %err.message, "bridge reported an error");
            }
        }
        let _ = client;
    }

    async fn handle_delivery(&self, topic: String, event: Option<loom_proto::Event>) {
        let Some(event) = event else { return };
        let envelope = Envelope::from_proto(event);

        self.shared
            .pending_replies
            .complete_if_pending(envelope.correlation_id(), envelope.clone())
            .await;

        let handler = self.shared.handler.read().await.clone();
        if let Some(handler) = handler {
            let span = telemetry::span_from_metadata("agent.on_event", &envelope.metadata);
            let _entered = span.enter();
            let ctx = self.context();
            handler(ctx, topic, envelope);
        }
    }

    async fn handle_tool_call(&self, call: loom_proto::ToolCall) {
        use tracing::Instrument;
        let span = tracing::info_span!("tool.invoke", tool = %call.name);

        async {
            let arguments: Result<Value> = serde_json::from_str(&call.arguments)
                .map_err(|e| TransportError::ToolInvocationFailed(e.to_string()));

            let result = match arguments {
                Ok(args) => match self.shared.tools.call(&call.name, args).await {
                    Ok(output) => ProtoToolResult {
                        id: call.id.clone(),
                        status: ToolStatus::ToolOk as i32,
                        output: serde_json::to_string(&output).unwrap_or_default(),
                        error: None,
                    },
                    Err(err) => tool_error_result(&call.id, &err),
                },
                Err(_) => ProtoToolResult {
                    id: call.id.clone(),
                    status: ToolStatus::ToolError as i32,
                    output: String::new(),
                    error: Some(ProtoToolError {
                        code: "INVALID_ARGUMENTS".into(),
                        message: "arguments were not valid JSON".into(),
                    }),
                },
            };

            let frame = ClientEvent {
                msg: Some(client_event::Msg::ToolResult(result)),
            };
            if self.shared.outbound_tx.send(frame).await.is_err() {
                tracing::warn!("failed to queue tool result: outbound channel closed");
            }
        }
        .instrument(span)
        .await
    }

    async fn heartbeat_loop(&self) {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if self.is_stopping() {
                return;
            }

            let mut client = BridgeClient::new(self.shared.bridge_address.clone());
            let probe = tokio::time::timeout(HEARTBEAT_TIMEOUT, async {
                client.connect().await?;
                client.heartbeat(&self.shared.agent_id).await
            })
            .await;

            match probe {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "heartbeat failed");
                    self.shared.heartbeat_failed.notify_one();
                    return;
                }
                Err(_) => {
                    tracing::warn!("heartbeat timed out");
                    self.shared.heartbeat_failed.notify_one();
                    return;
                }
            }
        }
    }
}

fn tool_error_result(call_id: &str, err: &crate::ToolError) -> ProtoToolResult {
    let code = match err {
        crate::ToolError::NotFound(_) => "NOT_FOUND",
        crate::ToolError::InvalidArguments(_) | crate::ToolError::Serialization(_) => "INVALID_ARGUMENTS",
        crate::ToolError::InvalidInput(_) => "INVALID_INPUT",
        _ => "TOOL_ERROR",
    };
    ProtoToolResult {
        id: call_id.to_string(),
        status: ToolStatus::ToolError as i32,
        output: String::new(),
        error: Some(ProtoToolError {
            code: code.into(),
            message: err.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_topic_always_added() {
        let config = AgentConfig::new("a-1").with_topics(vec!["prices".into()]);
        let tools = ToolRegistry::new();
        let agent = Agent::new(config, tools);
        assert!(agent.shared.topics.contains(&"agent.a-1.replies".to_string()));
        assert!(agent.shared.topics.contains(&"prices".to_string()));
    }

    #[tokio::test]
    async fn starts_in_init_and_moves_to_connecting_on_start() {
        let config = AgentConfig::new("a-2");
        let tools = ToolRegistry::new();
        let agent = Agent::new(config, tools);
        assert_eq!(agent.state().await, AgentState::Init);
    }
}
