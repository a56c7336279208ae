use super::config::SessionLimits;
use super::session::{Inbound, Session};
use super::stats::SessionStats;
use crate::codec::AudioFragment;
use crate::error::{RelayError, RelayResult};
use crate::upstream::{StreamOptions, UpstreamFactory};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Outcome of [`SessionRegistry::resolve_or_create`]
pub struct Resolution {
    pub session: Arc<Session>,
    /// Present only for a freshly created session; its driver reads from it
    pub inbox: Option<mpsc::UnboundedReceiver<Inbound>>,
    /// The device's previous session, already removed and closing.
    /// The caller releases its upstream with [`Session::close`].
    pub evicted: Option<Arc<Session>>,
}

impl Resolution {
    pub fn is_new(&self) -> bool {
        self.inbox.is_some()
    }
}

/// Bounded set of live sessions, at most one per device.
///
/// Every mutation happens under a single lock, and no I/O is awaited while
/// it is held; upstream closes run after the entry is gone.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    factory: Arc<dyn UpstreamFactory>,
    limits: SessionLimits,
    /// Parent of every session's cancellation token
    root: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn UpstreamFactory>,
        limits: SessionLimits,
        root: CancellationToken,
    ) -> Self {
        info!(
            "Session registry initialized: capacity {}, timeout {:?}, provider {}",
            limits.max_concurrent_sessions,
            limits.session_timeout,
            factory.name()
        );

        Self {
            sessions: Mutex::new(HashMap::new()),
            factory,
            limits,
            root,
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn provider(&self) -> &str {
        self.factory.name()
    }

    pub async fn provider_healthy(&self) -> bool {
        self.factory.health_check().await
    }

    /// Find the device's live session for this fragment or admit a new one.
    ///
    /// A live session with a different `session_id` is removed and moved to
    /// `Closing` before the new one is created; a device without a session
    /// is admitted only below capacity.
    pub async fn resolve_or_create(&self, fragment: &AudioFragment) -> RelayResult<Resolution> {
        let mut sessions = self.sessions.lock().await;

        let evicted = match sessions.get(&fragment.device_id).cloned() {
            Some(existing)
                if existing.session_id() == fragment.session_id && existing.is_live() =>
            {
                return Ok(Resolution {
                    session: existing,
                    inbox: None,
                    evicted: None,
                });
            }
            Some(_) => sessions.remove(&fragment.device_id),
            None => None,
        };
        if let Some(stale) = &evicted {
            info!(
                "Device {} switched from session {} to {}, closing the old one",
                fragment.device_id,
                stale.session_id(),
                fragment.session_id
            );
            stale.begin_close();
        }

        if sessions.len() >= self.limits.max_concurrent_sessions {
            return Err(RelayError::Capacity {
                active: sessions.len(),
                max: self.limits.max_concurrent_sessions,
            });
        }

        let (session, inbox) = Session::new(
            fragment.device_id.clone(),
            fragment.session_id.clone(),
            StreamOptions::from_fragment(fragment),
            self.factory.create(),
            self.root.child_token(),
        );
        sessions.insert(fragment.device_id.clone(), Arc::clone(&session));

        Ok(Resolution {
            session,
            inbox: Some(inbox),
            evicted,
        })
    }

    /// Remove the device's session for cleanup. No-op if absent.
    pub async fn remove(&self, device_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.remove(device_id)
    }

    /// Remove `session` only if it is still the device's registered session
    pub async fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(session.device_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.device_id());
                true
            }
            _ => false,
        }
    }

    /// Remove and close the device's session
    pub async fn close_device(&self, device_id: &str) -> bool {
        match self.remove(device_id).await {
            Some(session) => {
                session.close(self.limits.close_grace).await;
                true
            }
            None => false,
        }
    }

    /// Reclaim sessions quiet for longer than the session timeout.
    ///
    /// Quiet streaming sessions are marked idle on the way. Returns the
    /// number of sessions closed.
    pub async fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().await;

            for session in sessions.values() {
                session.mark_idle_if_quiet(now, self.limits.idle_grace);
            }

            let keys: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.is_expired(now, self.limits.session_timeout))
                .map(|(device, _)| device.clone())
                .collect();

            keys.iter().filter_map(|k| sessions.remove(k)).collect()
        };

        for session in &expired {
            info!(
                "Session {}/{} idle for {:.1}s, reclaiming",
                session.device_id(),
                session.session_id(),
                session.idle_for(now).as_secs_f64()
            );
        }

        let grace = self.limits.close_grace;
        join_all(expired.iter().map(|s| s.close(grace))).await;

        expired.len()
    }

    /// Remove every session, for shutdown
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().await.drain().map(|(_, s)| s).collect()
    }

    /// Drain the registry and close every upstream
    pub async fn close_all(&self) -> usize {
        let sessions = self.drain().await;
        let grace = self.limits.close_grace;
        join_all(sessions.iter().map(|s| s.close(grace))).await;
        sessions.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(device_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<SessionStats> {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().await.values().cloned().collect();
        sessions.iter().map(|s| s.stats()).collect()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `cancel` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            info!("Session sweeper started (every {:?})", interval);

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reclaimed = registry.sweep(Instant::now()).await;
                        if reclaimed > 0 {
                            debug!("Sweep reclaimed {} session(s)", reclaimed);
                        }
                    }
                }
            }

            info!("Session sweeper stopped");
        })
    }
}
