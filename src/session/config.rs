use std::time::Duration;

use crate::config::{ServerConfig, UpstreamConfig};

/// Limits and timers applied to every relay session
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Registry capacity
    /// Default: 50
    pub max_concurrent_sessions: usize,

    /// Sessions quiet for longer than this are reclaimed by the sweep
    /// Default: 300 seconds
    pub session_timeout: Duration,

    /// Quiet time after which a streaming session is marked idle
    pub idle_grace: Duration,

    /// Bound on an upstream close before it is abandoned
    pub close_grace: Duration,

    /// Bound on the upstream handshake
    pub handshake_timeout: Duration,
}

impl SessionLimits {
    pub fn from_config(server: &ServerConfig, upstream: &UpstreamConfig) -> Self {
        Self {
            max_concurrent_sessions: server.max_concurrent_sessions,
            session_timeout: server.session_timeout(),
            idle_grace: server.idle_grace(),
            close_grace: server.close_grace(),
            handshake_timeout: upstream.handshake_timeout(),
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 50,
            session_timeout: Duration::from_secs(300), // 5 minutes
            idle_grace: Duration::from_secs(2),
            close_grace: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}
