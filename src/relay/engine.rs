use anyhow::Result;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::health::HealthStatus;
use super::publisher::Publisher;
use super::stats::{RelayStats, RelayStatsSnapshot};
use crate::broker::topic::{device_from_topic, response_topic};
use crate::broker::Broker;
use crate::codec::{AudioFragment, FragmentKind, FrameBuilder};
use crate::config::Config;
use crate::error::RelayError;
use crate::session::{Inbound, SessionLimits, SessionRegistry};
use crate::upstream::UpstreamFactory;

/// Topics and timers the engine runs with
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub request_topic: String,
    /// Template with a `{device_id}` placeholder
    pub response_topic: String,
    pub health_topic: String,
    pub sweep_interval: Duration,
    /// `None` disables periodic health records
    pub health_interval: Option<Duration>,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_topic: config.broker.request_topic.clone(),
            response_topic: config.broker.response_topic.clone(),
            health_topic: config.broker.health_topic.clone(),
            sweep_interval: config.server.sweep_interval(),
            health_interval: config
                .server
                .enable_health_checks
                .then(|| config.server.health_check_interval()),
        }
    }
}

/// Bridges device envelopes on the broker to per-device upstream sessions.
///
/// Cheap to clone; all clones share one registry and one set of tasks.
#[derive(Clone)]
pub struct RelayEngine {
    pub(super) inner: Arc<EngineInner>,
}

pub(super) struct EngineInner {
    pub(super) registry: Arc<SessionRegistry>,
    pub(super) codec: FrameBuilder,
    pub(super) publisher: Publisher,
    pub(super) settings: RelaySettings,
    pub(super) stats: RelayStats,
    /// Root of every task and session token
    pub(super) cancel: CancellationToken,
    /// Session drivers and deferred closes
    pub(super) tasks: TaskTracker,
    background: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl RelayEngine {
    pub fn new(broker: Arc<dyn Broker>, factory: Arc<dyn UpstreamFactory>, config: &Config) -> Self {
        Self::with_parts(
            Publisher::from_config(broker, &config.broker),
            factory,
            FrameBuilder::new(&config.codec),
            SessionLimits::from_config(&config.server, &config.upstream),
            RelaySettings::from_config(config),
        )
    }

    pub fn with_parts(
        publisher: Publisher,
        factory: Arc<dyn UpstreamFactory>,
        codec: FrameBuilder,
        limits: SessionLimits,
        settings: RelaySettings,
    ) -> Self {
        let cancel = CancellationToken::new();
        let registry = Arc::new(SessionRegistry::new(factory, limits, cancel.clone()));

        Self {
            inner: Arc::new(EngineInner {
                registry,
                codec,
                publisher,
                settings,
                stats: RelayStats::default(),
                cancel,
                tasks: TaskTracker::new(),
                background: Mutex::new(Vec::new()),
                started_at: Instant::now(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Subscribe to device requests and dispatch them until cancelled.
    ///
    /// Also starts the idle sweeper and, when enabled, the health publisher.
    pub async fn run(&self) -> Result<()> {
        let topic = self.inner.settings.request_topic.clone();
        let mut requests = self.inner.publisher.broker().subscribe(&topic).await?;

        self.start_background().await;
        info!(
            "Relay listening on {} via {} (provider {})",
            topic,
            self.inner.publisher.broker().name(),
            self.inner.registry.provider()
        );

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                message = requests.next() => match message {
                    Some(message) => self.on_inbound(&message.topic, &message.payload).await,
                    None => {
                        warn!("Request subscription on {} ended", topic);
                        break;
                    }
                },
            }
        }

        info!("Relay dispatcher stopped");
        Ok(())
    }

    async fn start_background(&self) {
        let mut background = self.inner.background.lock().await;

        background.push(
            self.inner
                .registry
                .spawn_sweeper(self.inner.settings.sweep_interval, self.inner.cancel.child_token()),
        );

        if let Some(interval) = self.inner.settings.health_interval {
            background.push(self.spawn_health_publisher(interval));
        }
    }

    /// Handle one envelope from the request topic.
    ///
    /// Never fails: malformed envelopes are logged and dropped, and routing
    /// failures are reported to the device where a reply is meaningful.
    pub async fn on_inbound(&self, topic: &str, payload: &[u8]) {
        self.inner.stats.envelope_received();

        let topic_device = device_from_topic(&self.inner.settings.request_topic, topic);
        let fragment = match self.inner.codec.parse(payload, topic_device.as_deref()) {
            Ok(fragment) => fragment,
            Err(e) => {
                self.inner.stats.parse_error();
                warn!("Dropping envelope on {}: {}", topic, e);
                return;
            }
        };

        debug!(
            "Envelope {} from {}/{} ({} bytes, chunk {:?}/{:?})",
            fragment.message_id,
            fragment.device_id,
            fragment.session_id,
            fragment.payload.len(),
            fragment.chunk_id,
            fragment.total_chunks
        );

        match fragment.kind {
            FragmentKind::Audio => self.route_audio(fragment).await,
            FragmentKind::EndOfStream => self.end_session(&fragment).await,
        }
    }

    async fn route_audio(&self, fragment: AudioFragment) {
        let resolution = match self.inner.registry.resolve_or_create(&fragment).await {
            Ok(resolution) => resolution,
            Err(e) => {
                if matches!(e, RelayError::Capacity { .. }) {
                    self.inner.stats.session_rejected();
                }
                warn!(
                    "Refusing session {} for device {}: {}",
                    fragment.session_id, fragment.device_id, e
                );
                self.report_error(
                    &fragment.device_id,
                    &fragment.session_id,
                    &e,
                    Some(&fragment.message_id),
                )
                .await;
                return;
            }
        };

        if let Some(stale) = resolution.evicted {
            let grace = self.inner.registry.limits().close_grace;
            self.inner.tasks.spawn(async move {
                stale.close(grace).await;
            });
        }

        let session = resolution.session;
        if let Some(inbox) = resolution.inbox {
            self.inner.stats.session_created();
            let engine = self.clone();
            let driven = Arc::clone(&session);
            self.inner
                .tasks
                .spawn(async move { engine.drive(driven, inbox).await });
        }

        let device_id = session.device_id().to_string();
        if !session.enqueue(Inbound::Audio(fragment)) {
            warn!(
                "Session {}/{} is shutting down, dropping fragment",
                device_id,
                session.session_id()
            );
        }
    }

    /// Explicit `session_end` from a device. Only ends the matching session.
    async fn end_session(&self, fragment: &AudioFragment) {
        let session = match self.inner.registry.get(&fragment.device_id).await {
            Some(session) if session.session_id() == fragment.session_id => session,
            _ => {
                debug!(
                    "session_end for unknown session {}/{}",
                    fragment.device_id, fragment.session_id
                );
                return;
            }
        };

        info!(
            "Device {} ended session {}",
            fragment.device_id, fragment.session_id
        );

        if !session.enqueue(Inbound::End) {
            // Driver already gone; finish the cleanup it would have done
            self.inner.registry.remove_session(&session).await;
            let grace = self.inner.registry.limits().close_grace;
            self.inner.tasks.spawn(async move {
                session.close(grace).await;
            });
        }
    }

    /// Publish an `error` envelope if the device should hear about `error`
    pub(super) async fn report_error(
        &self,
        device_id: &str,
        session_id: &str,
        error: &RelayError,
        original_message_id: Option<&str>,
    ) {
        if !error.is_reported() {
            return;
        }

        let envelope = match self.inner.codec.error_envelope(
            device_id,
            session_id,
            error,
            original_message_id,
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Failed to build error envelope for {}: {}", device_id, e);
                return;
            }
        };

        let topic = self.device_topic(device_id);
        if let Err(e) = self.inner.publisher.publish(&topic, envelope).await {
            self.inner.stats.publish_failure();
            warn!("Could not deliver {} to {}: {}", error.error_code(), device_id, e);
        }
    }

    pub(super) fn device_topic(&self, device_id: &str) -> String {
        response_topic(&self.inner.settings.response_topic, device_id)
    }

    /// Stop dispatching, close every session and announce the relay offline.
    ///
    /// Drivers get the close grace period (twice over) to finish before they
    /// are abandoned.
    pub async fn shutdown(&self) {
        info!("Shutting down relay");
        self.inner.cancel.cancel();

        let closed = self.inner.registry.close_all().await;

        self.inner.tasks.close();
        let grace = self.inner.registry.limits().close_grace * 2;
        if tokio::time::timeout(grace, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                "{} session task(s) still running after {:?}",
                self.inner.tasks.len(),
                grace
            );
        }

        let handles: Vec<JoinHandle<()>> = self.inner.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        if self.inner.settings.health_interval.is_some() {
            if let Err(e) = self.publish_health(HealthStatus::Offline).await {
                warn!("Failed to publish offline status: {}", e);
            }
        }

        info!("Relay stopped, {} session(s) closed", closed);
    }
}
