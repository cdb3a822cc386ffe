// Loom Core Library
// Agent-side runtime: bridge transport, event context, tool registry, cognitive loop.

pub mod cognitive;
pub mod envelope;
pub mod telemetry;
pub mod tools;
pub mod transport;

pub use cognitive::{CognitiveAgent, CognitiveChunk, CognitiveConfig, ThinkingStrategy};
pub use envelope::Envelope;
pub use transport::{Agent, AgentConfig, BridgeClient, EventContext};

// Generated proto code, re-exported under the path existing call sites expect.
pub use loom_proto as proto;

use thiserror::Error;

/// Errors surfaced by the bridge transport (connection, registration, stream lifecycle).
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bridge unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("stream broken: {0}")]
    StreamBroken(String),

    #[error("heartbeat timed out")]
    HeartbeatTimeout,

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("event context is not bound to a running agent")]
    NotBound,

    #[error("request timed out waiting for a reply")]
    RequestTimeout,

    #[error("tool invocation failed: {0}")]
    ToolInvocationFailed(String),

    #[error("agent stopped")]
    AgentStopped,

    #[error("grpc transport error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised while registering, validating, or invoking a locally-hosted tool.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("tool execution failed: {0}")]
    ExecutionFailed(String),

    #[error("path traversal detected")]
    PathTraversal,

    #[error("timeout")]
    Timeout,

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Errors raised by the cognitive loop and its LLM provider.
#[derive(Error, Debug)]
pub enum CognitiveError {
    #[error("LLM HTTP error: status={status} body={body}")]
    LlmHttpError { status: u16, body: String },

    #[error("LLM request timed out")]
    LlmTimeout,

    #[error("LLM transport error: {0}")]
    LlmTransport(String),

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

pub type CognitiveResult<T> = std::result::Result<T, CognitiveError>;
