use super::state::SessionState;
use super::stats::SessionStats;
use crate::codec::{AudioFragment, EnvelopeTemplate};
use crate::error::{RelayError, RelayResult};
use crate::upstream::{StreamOptions, UpstreamEvents, UpstreamStream};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Work handed from the broker boundary to a session's driver task
#[derive(Debug)]
pub enum Inbound {
    Audio(AudioFragment),
    /// Device ended the session
    End,
}

/// One device's conversation, bridging the broker to its own upstream
pub struct Session {
    device_id: String,

    session_id: String,

    /// Options of the fragment that opened the session
    options: StreamOptions,

    /// When the session was admitted
    created_at: chrono::DateTime<chrono::Utc>,

    state: StdMutex<SessionState>,

    /// Updated by every inbound and outbound fragment
    last_activity_at: StdMutex<Instant>,

    /// Exclusively owned provider connection
    upstream: Mutex<Box<dyn UpstreamStream>>,

    provider: String,

    /// Outbound envelope sequence counter
    pending_chunk_id: AtomicU64,

    /// Transcript of the response in progress
    transcript: StdMutex<String>,

    inbox: mpsc::UnboundedSender<Inbound>,

    /// Cancels the driver task and anything tied to it
    cancel: CancellationToken,

    /// Set once the upstream has been released
    closed: AtomicBool,

    fragments_in: AtomicU64,
    fragments_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Session {
    /// Create a session in `Connecting` state.
    ///
    /// Returns the receiving end of its inbox for the driver task.
    pub fn new(
        device_id: String,
        session_id: String,
        options: StreamOptions,
        upstream: Box<dyn UpstreamStream>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Inbound>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let provider = upstream.name().to_string();

        info!(
            "Creating session {} for device {} (provider {})",
            session_id, device_id, provider
        );

        let session = Arc::new(Self {
            device_id,
            session_id,
            options,
            created_at: Utc::now(),
            state: StdMutex::new(SessionState::Connecting),
            last_activity_at: StdMutex::new(Instant::now()),
            upstream: Mutex::new(upstream),
            provider,
            pending_chunk_id: AtomicU64::new(0),
            transcript: StdMutex::new(String::new()),
            inbox,
            cancel,
            closed: AtomicBool::new(false),
            fragments_in: AtomicU64::new(0),
            fragments_out: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        });

        (session, rx)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Whether new fragments may attach to this session
    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.state().is_live()
    }

    /// Apply a state transition if the state machine allows it
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = lock(&self.state);
        if !state.can_transition_to(next) {
            debug!(
                "Session {}/{}: ignoring transition {} -> {}",
                self.device_id, self.session_id, *state, next
            );
            return false;
        }
        debug!(
            "Session {}/{}: {} -> {}",
            self.device_id, self.session_id, *state, next
        );
        *state = next;
        true
    }

    pub fn touch(&self) {
        *lock(&self.last_activity_at) = Instant::now();
    }

    pub fn last_activity_at(&self) -> Instant {
        *lock(&self.last_activity_at)
    }

    /// Time since the last fragment in either direction
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_at())
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.idle_for(now) > timeout
    }

    /// Streaming → Idle once quiet past the grace window
    pub fn mark_idle_if_quiet(&self, now: Instant, grace: Duration) -> bool {
        self.state() == SessionState::Streaming
            && self.idle_for(now) >= grace
            && self.transition(SessionState::Idle)
    }

    /// Queue work for the driver. False when the driver is gone.
    pub fn enqueue(&self, inbound: Inbound) -> bool {
        self.inbox.send(inbound).is_ok()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Perform the upstream handshake and take its outbound sequence.
    pub async fn open_upstream(&self, timeout: Duration) -> RelayResult<UpstreamEvents> {
        let mut upstream = self.upstream.lock().await;

        let opened = tokio::time::timeout(timeout, upstream.open(&self.options))
            .await
            .unwrap_or_else(|_| {
                Err(RelayError::UpstreamHandshake(format!(
                    "handshake timed out after {:?}",
                    timeout
                )))
            });

        let events = opened.and_then(|()| {
            upstream.pull_audio().ok_or_else(|| {
                RelayError::UpstreamHandshake("upstream produced no outbound stream".into())
            })
        });

        match events {
            Ok(events) => {
                self.transition(SessionState::Streaming);
                self.touch();
                info!(
                    "Session {}/{} streaming via {}",
                    self.device_id, self.session_id, self.provider
                );
                Ok(events)
            }
            Err(e) => {
                self.transition(SessionState::Error);
                Err(e)
            }
        }
    }

    /// Forward one inbound fragment's audio to the upstream
    pub async fn push(&self, fragment: &AudioFragment) -> RelayResult<()> {
        self.touch();
        if self.state() == SessionState::Idle {
            self.transition(SessionState::Streaming);
        }

        self.upstream.lock().await.push_audio(&fragment.payload).await?;

        self.fragments_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in
            .fetch_add(fragment.payload.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// End the device's current utterance
    pub async fn finish_input(&self) -> RelayResult<()> {
        self.upstream.lock().await.finish_input().await
    }

    pub async fn upstream_healthy(&self) -> bool {
        self.upstream.lock().await.is_healthy()
    }

    /// Provider cost estimate for everything received so far
    pub async fn cost_estimate(&self) -> f64 {
        let seconds = self.bytes_in.load(Ordering::Relaxed) as f64 / self.options.byte_rate();
        self.upstream.lock().await.estimate_cost(seconds)
    }

    /// Reserve the next outbound sequence number
    pub fn next_sequence(&self) -> u64 {
        self.pending_chunk_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Account for one published envelope
    pub fn record_outbound(&self, bytes: usize) {
        self.touch();
        if self.state() == SessionState::Idle {
            self.transition(SessionState::Streaming);
        }
        self.fragments_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn append_transcript(&self, delta: &str) {
        lock(&self.transcript).push_str(delta);
    }

    pub fn take_transcript(&self) -> String {
        std::mem::take(&mut *lock(&self.transcript))
    }

    pub fn envelope_template(&self) -> EnvelopeTemplate {
        EnvelopeTemplate {
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            format: self.options.format.clone(),
        }
    }

    /// Move to `Error` after an upstream failure; close follows
    pub fn fail(&self, error: &RelayError) {
        warn!(
            "Session {}/{} failed: {}",
            self.device_id, self.session_id, error
        );
        self.transition(SessionState::Error);
    }

    /// Move to `Closing` and cancel the driver without waiting on I/O
    pub fn begin_close(&self) {
        self.transition(SessionState::Closing);
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the session and release its upstream.
    ///
    /// Idempotent: only the first call closes the upstream, later calls
    /// return `false`. The upstream gets `grace` to acknowledge before it is
    /// dropped.
    pub async fn close(&self, grace: Duration) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.begin_close();

        info!("Closing session {}/{}", self.device_id, self.session_id);

        let closed = tokio::time::timeout(grace, async {
            self.upstream.lock().await.close().await
        })
        .await;

        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "Upstream close for {}/{} failed: {}",
                self.device_id, self.session_id, e
            ),
            Err(_) => warn!(
                "Upstream close for {}/{} exceeded {:?}, forcing",
                self.device_id, self.session_id, grace
            ),
        }

        self.transition(SessionState::Closed);
        true
    }

    pub fn stats(&self) -> SessionStats {
        let now = Instant::now();
        let duration = Utc::now().signed_duration_since(self.created_at);

        SessionStats {
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state(),
            provider: self.provider.clone(),
            created_at: self.created_at,
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            idle_secs: self.idle_for(now).as_secs_f64(),
            fragments_in: self.fragments_in.load(Ordering::Relaxed),
            fragments_out: self.fragments_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            transcript_chars: lock(&self.transcript).chars().count(),
        }
    }
}

/// Lock a std mutex, recovering the data if a panicking holder poisoned it
fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
