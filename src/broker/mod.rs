//! Publish/subscribe boundary
//!
//! The relay only needs two primitives from a message broker: a wildcard
//! subscription for device requests and a publish to per-device topics.
//! Topics are written in the MQTT style used by the device protocol
//! (`iot/+/audio_request`); adapters translate to their native syntax.

mod nats;
pub mod topic;

pub use nats::NatsBroker;

use anyhow::Result;
use futures::stream::BoxStream;

/// A message received from the broker, with its topic in MQTT form
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Broker capability consumed by the relay
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe to a topic pattern (`+` and `#` wildcards allowed)
    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, InboundMessage>>;

    /// Publish a payload to a concrete topic
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Get broker name for logging
    fn name(&self) -> &str;
}
