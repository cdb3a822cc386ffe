//! The wire envelope: the unit of event transport between agents and the bridge.
//!
//! `Envelope` is the agent-side view of the bridge's `Event` proto message. It
//! round-trips losslessly through `to_proto`/`from_proto`: every reserved
//! `loom.`-prefixed metadata key (thread, correlation, sender, reply-to, ttl)
//! plus W3C `traceparent`/`tracestate` survive the conversion unchanged.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::proto::Event;

/// Reserved metadata keys, all carried under the `loom.` prefix on the wire.
pub mod keys {
    pub const THREAD_ID: &str = "loom.thread_id";
    pub const CORRELATION_ID: &str = "loom.correlation_id";
    pub const SENDER: &str = "loom.sender";
    pub const REPLY_TO: &str = "loom.reply_to";
    pub const TTL_MS: &str = "loom.ttl_ms";
    pub const TRACEPARENT: &str = "traceparent";
    pub const TRACESTATE: &str = "tracestate";
}

/// Default envelope priority when the caller does not set one.
pub const DEFAULT_PRIORITY: i32 = 50;

/// Build the conventional reply topic for an agent: `agent.<id>.replies`.
pub fn agent_reply_topic(agent_id: &str) -> String {
    format!("agent.{agent_id}.replies")
}

/// Unit of event transport. Carries payload, correlation, threading, TTL,
/// and (via `metadata`) W3C distributed-tracing context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp_ms: i64,
    pub source: String,
    pub payload: Vec<u8>,
    pub metadata: HashMap<String, String>,
    pub tags: Vec<String>,
    pub priority: i32,
}

impl Default for Envelope {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: String::new(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            source: String::new(),
            payload: Vec::new(),
            metadata: HashMap::new(),
            tags: Vec::new(),
            priority: DEFAULT_PRIORITY,
        }
    }
}

impl Envelope {
    /// Construct a fresh envelope with a new UUID v4 id and the current timestamp.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.metadata.get(keys::THREAD_ID).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata.get(keys::CORRELATION_ID).map(String::as_str)
    }

    pub fn sender(&self) -> Option<&str> {
        self.metadata.get(keys::SENDER).map(String::as_str)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.metadata.get(keys::REPLY_TO).map(String::as_str)
    }

    pub fn ttl_ms(&self) -> Option<i64> {
        self.metadata
            .get(keys::TTL_MS)
            .and_then(|s| s.parse::<i64>().ok())
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.metadata.insert(keys::THREAD_ID.into(), thread_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata
            .insert(keys::CORRELATION_ID.into(), correlation_id.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.metadata.insert(keys::SENDER.into(), sender.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.metadata.insert(keys::REPLY_TO.into(), reply_to.into());
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.metadata.insert(keys::TTL_MS.into(), ttl_ms.to_string());
        self
    }

    /// Convert to the bridge wire `Event` message. Confidence is not
    /// interpreted by this crate and is always round-tripped at `1.0`.
    pub fn to_proto(&self) -> Event {
        Event {
            id: self.id.clone(),
            r#type: self.event_type.clone(),
            timestamp_ms: self.timestamp_ms,
            source: self.source.clone(),
            metadata: self.metadata.clone(),
            payload: self.payload.clone(),
            confidence: 1.0,
            tags: self.tags.clone(),
            priority: self.priority,
        }
    }

    /// Reconstruct from a wire `Event` message.
    pub fn from_proto(event: Event) -> Self {
        Self {
            id: event.id,
            event_type: event.r#type,
            timestamp_ms: event.timestamp_ms,
            source: event.source,
            payload: event.payload,
            metadata: event.metadata,
            tags: event.tags,
            priority: event.priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_reserved_metadata_and_fields() {
        let envelope = Envelope::new("price.update", "agent.a", b"payload".to_vec())
            .with_thread_id("th-1")
            .with_correlation_id("corr-1")
            .with_sender("agent.a")
            .with_reply_to("agent.a.replies")
            .with_ttl_ms(5_000);

        let mut envelope = envelope;
        envelope.tags = vec!["x".into(), "y".into()];
        envelope.priority = 80;

        let round_tripped = Envelope::from_proto(envelope.to_proto());

        assert_eq!(round_tripped.id, envelope.id);
        assert_eq!(round_tripped.event_type, envelope.event_type);
        assert_eq!(round_tripped.payload, envelope.payload);
        assert_eq!(round_tripped.thread_id(), envelope.thread_id());
        assert_eq!(round_tripped.correlation_id(), envelope.correlation_id());
        assert_eq!(round_tripped.sender(), envelope.sender());
        assert_eq!(round_tripped.reply_to(), envelope.reply_to());
        assert_eq!(round_tripped.ttl_ms(), envelope.ttl_ms());
        assert_eq!(round_tripped.tags, envelope.tags);
        assert_eq!(round_tripped.priority, envelope.priority);
    }

    #[test]
    fn reply_topic_follows_convention() {
        assert_eq!(agent_reply_topic("a-1"), "agent.a-1.replies");
    }
}
