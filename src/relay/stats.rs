use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Relay-wide counters, shared by the dispatcher and every driver task
#[derive(Debug, Default)]
pub struct RelayStats {
    envelopes_received: AtomicU64,
    parse_errors: AtomicU64,
    sessions_created: AtomicU64,
    sessions_rejected: AtomicU64,
    sessions_closed: AtomicU64,
    upstream_errors: AtomicU64,
    fragments_out: AtomicU64,
    responses_completed: AtomicU64,
    publish_failures: AtomicU64,
}

/// Serializable copy of [`RelayStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayStatsSnapshot {
    pub envelopes_received: u64,
    pub parse_errors: u64,
    pub sessions_created: u64,
    /// Admissions refused at capacity
    pub sessions_rejected: u64,
    pub sessions_closed: u64,
    pub upstream_errors: u64,
    /// `audio_response` envelopes published
    pub fragments_out: u64,
    pub responses_completed: u64,
    pub publish_failures: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl RelayStats {
    counter! {
        envelope_received => envelopes_received,
        parse_error => parse_errors,
        session_created => sessions_created,
        session_rejected => sessions_rejected,
        session_closed => sessions_closed,
        upstream_error => upstream_errors,
        fragment_out => fragments_out,
        response_completed => responses_completed,
        publish_failure => publish_failures,
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            fragments_out: self.fragments_out.load(Ordering::Relaxed),
            responses_completed: self.responses_completed.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}
