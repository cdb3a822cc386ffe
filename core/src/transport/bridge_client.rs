//! Stateless gRPC connection to the bridge broker.
//!
//! `BridgeClient` is a thin wrapper over the generated `loom-proto` tonic
//! clients: it performs no retry, no caching, and holds no agent state beyond
//! the channel itself. `connect`/`close` are idempotent so callers (notably
//! `Agent`'s reconnect loop) can call them freely.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Channel;
use tonic::Streaming;

use loom_proto::bridge_client::BridgeClient as GrpcBridgeClient;
use loom_proto::memory_service_client::MemoryServiceClient as GrpcMemoryClient;
use loom_proto::{
    AgentRegisterRequest, AgentRegisterResponse,
    CheckDuplicateRequest, CheckDuplicateResponse, CheckExecutedRequest, CheckExecutedResponse,
    ClientEvent, ExecutionRecord, GetExecutionStatsRequest, GetExecutionStatsResponse,
    GetRecentPlansRequest, GetRecentPlansResponse, HeartbeatRequest, HeartbeatResponse,
    MarkExecutedRequest, MarkExecutedResponse, MemoryRetrieveRequest, MemoryRetrieveResponse,
    MemorySummarizeRequest, MemorySummarizeResponse, MemoryWriteRequest, MemoryWriteResponse,
    PlanRecord, SavePlanRequest, SavePlanResponse, ServerEvent, ToolCall, ToolDescriptor,
    ToolResult,
};

use crate::{Result, TransportError};

/// Outbound channel handed to `event_stream`; the agent writes frames into it
/// and this client turns them into the request stream tonic expects.
pub type Outbound = mpsc::Receiver<ClientEvent>;

pub struct BridgeClient {
    address: String,
    bridge: Option<GrpcBridgeClient<Channel>>,
    memory: Option<GrpcMemoryClient<Channel>>,
}

impl BridgeClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            bridge: None,
            memory: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.bridge.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.bridge.is_some() {
            return Ok(());
        }
        let endpoint = format!("http://{}", self.address);
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| TransportError::BridgeUnavailable(e.to_string()))?
            .connect()
            .await
            .map_err(|e| TransportError::BridgeUnavailable(e.to_string()))?;
        self.bridge = Some(GrpcBridgeClient::new(channel.clone()));
        self.memory = Some(GrpcMemoryClient::new(channel));
        Ok(())
    }

    pub fn close(&mut self) {
        self.bridge = None;
        self.memory = None;
    }

    fn bridge_mut(&mut self) -> Result<&mut GrpcBridgeClient<Channel>> {
        self.bridge
            .as_mut()
            .ok_or_else(|| TransportError::BridgeUnavailable("not connected".into()))
    }

    fn memory_mut(&mut self) -> Result<&mut GrpcMemoryClient<Channel>> {
        self.memory
            .as_mut()
            .ok_or_else(|| TransportError::BridgeUnavailable("not connected".into()))
    }

    pub async fn register_agent(
        &mut self,
        agent_id: &str,
        topics: Vec<String>,
        tool_descriptors: Vec<ToolDescriptor>,
        metadata: HashMap<String, String>,
    ) -> Result<AgentRegisterResponse> {
        let request = AgentRegisterRequest {
            agent_id: agent_id.to_string(),
            subscribed_topics: topics,
            tool_descriptors,
            metadata,
        };
        let response = self
            .bridge_mut()?
            .register_agent(request)
            .await
            .map_err(|status| TransportError::RegistrationFailed(status.message().to_string()))?
            .into_inner();
        if !response.success {
            return Err(TransportError::RegistrationFailed(response.error_message));
        }
        Ok(response)
    }

    /// Opens the bidirectional event stream. `outbound` is consumed by tonic;
    /// the caller retains a sender (constructed alongside) to push frames in.
    pub async fn event_stream(&mut self, outbound: Outbound) -> Result<Streaming<ServerEvent>> {
        let stream = ReceiverStream::new(outbound);
        let response = self.bridge_mut()?.event_stream(stream).await?;
        Ok(response.into_inner())
    }

    pub async fn forward_tool_call(&mut self, call: ToolCall) -> Result<ToolResult> {
        let response = self.bridge_mut()?.forward_tool_call(call).await?;
        Ok(response.into_inner())
    }

    pub async fn heartbeat(&mut self, agent_id: &str) -> Result<HeartbeatResponse> {
        let request = HeartbeatRequest {
            agent_id: agent_id.to_string(),
        };
        let response = self.bridge_mut()?.heartbeat(request).await?;
        Ok(response.into_inner())
    }

    pub async fn save_plan(&mut self, session_id: &str, plan: PlanRecord) -> Result<SavePlanResponse> {
        let request = SavePlanRequest {
            session_id: session_id.to_string(),
            plan: Some(plan),
        };
        Ok(self.memory_mut()?.save_plan(request).await?.into_inner())
    }

    pub async fn get_recent_plans(
        &mut self,
        session_id: &str,
        symbol: &str,
        limit: i32,
    ) -> Result<GetRecentPlansResponse> {
        let request = GetRecentPlansRequest {
            session_id: session_id.to_string(),
            symbol: symbol.to_string(),
            limit,
        };
        Ok(self.memory_mut()?.get_recent_plans(request).await?.into_inner())
    }

    pub async fn check_duplicate(
        &mut self,
        session_id: &str,
        symbol: &str,
        action: &str,
        time_window_sec: i64,
    ) -> Result<CheckDuplicateResponse> {
        let request = CheckDuplicateRequest {
            session_id: session_id.to_string(),
            symbol: symbol.to_string(),
            action: action.to_string(),
            time_window_sec,
        };
        Ok(self.memory_mut()?.check_duplicate(request).await?.into_inner())
    }

    pub async fn mark_executed(
        &mut self,
        session_id: &str,
        execution: ExecutionRecord,
    ) -> Result<MarkExecutedResponse> {
        let request = MarkExecutedRequest {
            session_id: session_id.to_string(),
            execution: Some(execution),
        };
        Ok(self.memory_mut()?.mark_executed(request).await?.into_inner())
    }

    pub async fn check_executed(
        &mut self,
        session_id: &str,
        plan_hash: &str,
    ) -> Result<CheckExecutedResponse> {
        let request = CheckExecutedRequest {
            session_id: session_id.to_string(),
            plan_hash: plan_hash.to_string(),
        };
        Ok(self.memory_mut()?.check_executed(request).await?.into_inner())
    }

    pub async fn get_execution_stats(&mut self, session_id: &str) -> Result<GetExecutionStatsResponse> {
        let request = GetExecutionStatsRequest {
            session_id: session_id.to_string(),
        };
        Ok(self
            .memory_mut()?
            .get_execution_stats(request)
            .await?
            .into_inner())
    }

    pub async fn append_event(
        &mut self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: HashMap<String, String>,
    ) -> Result<MemoryWriteResponse> {
        let request = MemoryWriteRequest {
            session_id: session_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            metadata,
        };
        Ok(self.memory_mut()?.append_event(request).await?.into_inner())
    }

    pub async fn retrieve(
        &mut self,
        session_id: &str,
        query: &str,
        limit: i32,
    ) -> Result<MemoryRetrieveResponse> {
        let request = MemoryRetrieveRequest {
            session_id: session_id.to_string(),
            query: query.to_string(),
            limit,
        };
        Ok(self.memory_mut()?.retrieve(request).await?.into_inner())
    }

    pub async fn summarize_episode(
        &mut self,
        session_id: &str,
        max_events: i32,
    ) -> Result<MemorySummarizeResponse> {
        let request = MemorySummarizeRequest {
            session_id: session_id.to_string(),
            max_events,
        };
        Ok(self.memory_mut()?.summarize_episode(request).await?.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_is_not_connected() {
        let client = BridgeClient::new("127.0.0.1:50051");
        assert!(!client.is_connected());
    }
}
