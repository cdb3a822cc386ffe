//! Bridge transport: stream lifecycle, outbound multiplexing, request/reply
//! correlation, and the thin RPC wrapper around the bridge's gRPC surface.

pub mod agent;
pub mod bridge_client;
pub mod context;

pub use agent::{Agent, AgentConfig, AgentState, EventHandler};
pub use bridge_client::BridgeClient;
pub use context::{plan_hash, EventContext, PendingReplies};
