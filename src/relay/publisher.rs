use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::error::{RelayError, RelayResult};

/// Longest wait between two publish attempts
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Broker publish with bounded exponential-backoff retry
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    retries: u32,
    backoff: Duration,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, retries: u32, backoff: Duration) -> Self {
        Self {
            broker,
            retries,
            backoff,
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, config: &BrokerConfig) -> Self {
        Self::new(
            broker,
            config.publish_retries,
            Duration::from_millis(config.publish_backoff_ms),
        )
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Publish `payload`, retrying up to the configured number of times.
    ///
    /// Exhaustion yields [`RelayError::BrokerPublish`] carrying the last
    /// broker error.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> RelayResult<()> {
        let mut attempt = 0u32;
        loop {
            match self.broker.publish(topic, payload.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retries => {
                    let delay = backoff_delay(self.backoff, attempt);
                    warn!(
                        "Publish to {} failed (attempt {}/{}): {:#}, retrying in {:?}",
                        topic,
                        attempt + 1,
                        self.retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(RelayError::BrokerPublish {
                        topic: topic.to_string(),
                        message: format!("{:#}", e),
                    })
                }
            }
        }
    }
}

/// `base * 2^attempt`, capped
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF)
}
