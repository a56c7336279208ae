use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::engine::RelayEngine;
use super::stats::RelayStatsSnapshot;
use crate::codec::MessageType;
use crate::error::{RelayError, RelayResult};

/// Relay status as seen by health topic subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Running, but the upstream provider failed its health check
    Degraded,
    /// Published once on shutdown
    Offline,
}

/// Record published on the health topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckMessage {
    pub message_id: String,
    pub device_id: String,
    pub timestamp: f64,
    pub message_type: MessageType,
    pub session_id: String,
    pub status: HealthStatus,
    pub uptime_seconds: f64,
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub provider: String,
    pub stats: RelayStatsSnapshot,
}

impl RelayEngine {
    /// Current health record with the given status
    pub async fn health_record(&self, status: HealthStatus) -> HealthCheckMessage {
        let registry = &self.inner.registry;

        HealthCheckMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            device_id: "server".to_string(),
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            message_type: MessageType::HealthCheck,
            session_id: String::new(),
            status,
            uptime_seconds: self.uptime().as_secs_f64(),
            active_sessions: registry.len().await,
            max_sessions: registry.limits().max_concurrent_sessions,
            provider: registry.provider().to_string(),
            stats: self.stats(),
        }
    }

    /// Probe the provider and report healthy or degraded
    pub async fn current_health(&self) -> HealthStatus {
        if self.inner.registry.provider_healthy().await {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }

    /// Publish one health record. Always JSON, whatever the device encoding.
    pub async fn publish_health(&self, status: HealthStatus) -> RelayResult<()> {
        let record = self.health_record(status).await;
        let payload = serde_json::to_vec(&record)
            .map_err(|e| RelayError::Parse(format!("failed to encode health record: {}", e)))?;

        self.inner
            .publisher
            .publish(&self.inner.settings.health_topic, payload)
            .await
    }

    pub(super) fn spawn_health_publisher(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        let cancel = self.inner.cancel.child_token();

        tokio::spawn(async move {
            info!(
                "Publishing health to {} every {:?}",
                engine.inner.settings.health_topic, interval
            );

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let status = engine.current_health().await;
                        if status == HealthStatus::Degraded {
                            warn!("Upstream provider {} failed its health check", engine.inner.registry.provider());
                        }
                        match engine.publish_health(status).await {
                            Ok(()) => debug!("Published health: {:?}", status),
                            Err(e) => warn!("Health publish failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}
