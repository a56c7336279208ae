//! Relay engine
//!
//! Consumes device envelopes from the broker, routes each to its device's
//! session, and publishes upstream responses back on the device's topic.
//! - `engine`: dispatch, admission and shutdown
//! - `driver`: one task per session, handshake to teardown
//! - `publisher`: broker publish with retry
//! - `health`: periodic status records

mod driver;
mod engine;
mod health;
mod publisher;
mod stats;

pub use engine::{RelayEngine, RelaySettings};
pub use health::{HealthCheckMessage, HealthStatus};
pub use publisher::{backoff_delay, Publisher};
pub use stats::{RelayStats, RelayStatsSnapshot};
