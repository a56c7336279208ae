use anyhow::{Context, Result};
use async_nats::Client;
use futures::stream::{BoxStream, StreamExt};
use tracing::{debug, info};

use super::topic::{from_nats_subject, to_nats_subject};
use super::{Broker, InboundMessage};
use crate::config::BrokerConfig;

/// Broker adapter over a NATS connection
pub struct NatsBroker {
    client: Client,
}

impl NatsBroker {
    /// Connect to NATS server
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        info!("Connecting to NATS at {}", config.url);

        let mut options = async_nats::ConnectOptions::new().name(&config.client_name);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(config.url.as_str())
            .await
            .context("Failed to connect to NATS")?;

        info!("Connected to NATS successfully");

        Ok(Self { client })
    }

    /// Flush pending publishes before shutdown
    pub async fn close(&self) -> Result<()> {
        info!("Closing NATS connection");
        self.client
            .flush()
            .await
            .context("Failed to flush NATS connection")?;
        // async-nats handles cleanup on drop
        Ok(())
    }
}

#[async_trait::async_trait]
impl Broker for NatsBroker {
    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, InboundMessage>> {
        let subject = to_nats_subject(pattern);

        info!("Subscribing to {} (NATS subject {})", pattern, subject);

        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .with_context(|| format!("Failed to subscribe to {}", subject))?;

        Ok(subscriber
            .map(|msg| InboundMessage {
                topic: from_nats_subject(&msg.subject.to_string()),
                payload: msg.payload.to_vec(),
            })
            .boxed())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let subject = to_nats_subject(topic);
        let len = payload.len();

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .with_context(|| format!("Failed to publish to {}", subject))?;

        debug!("Published {} bytes to {}", len, subject);

        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}
