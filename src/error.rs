//! Relay error taxonomy.

/// Errors raised by the relay core.
///
/// Every variant is scoped to a single envelope or session; none of them is
/// fatal to the process once the relay is running.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Malformed or oversized inbound envelope. Dropped, never forwarded.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Registry is full.
    #[error("Capacity exceeded: {active}/{max} sessions active")]
    Capacity {
        /// Sessions live at the time of the refusal.
        active: usize,
        /// Configured bound.
        max: usize,
    },

    /// Provider connect/auth failure; the session never reaches streaming.
    #[error("Upstream handshake failed: {0}")]
    UpstreamHandshake(String),

    /// Mid-session provider failure.
    #[error("Upstream stream error: {0}")]
    UpstreamStream(String),

    /// An operation exceeded its time bound.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Broker publish failed after all retries.
    #[error("Publish to {topic} failed: {message}")]
    BrokerPublish {
        /// Destination topic.
        topic: String,
        /// Last error reported by the broker.
        message: String,
    },

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Code carried in `error` envelopes sent back to devices.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Parse(_) => "PARSE_ERROR",
            Self::Capacity { .. } => "CAPACITY_EXCEEDED",
            Self::UpstreamHandshake(_) => "HANDSHAKE_FAILED",
            Self::UpstreamStream(_) => "UPSTREAM_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::BrokerPublish { .. } => "PUBLISH_FAILED",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Whether the device should be told about this error.
    ///
    /// Parse errors have no trustworthy reply address and timeouts are
    /// normal lifecycle, so neither is reported.
    pub fn is_reported(&self) -> bool {
        matches!(
            self,
            Self::Capacity { .. } | Self::UpstreamHandshake(_) | Self::UpstreamStream(_)
        )
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RelayError::Capacity { active: 1, max: 1 }.error_code(),
            "CAPACITY_EXCEEDED"
        );
        assert_eq!(
            RelayError::UpstreamHandshake("denied".into()).error_code(),
            "HANDSHAKE_FAILED"
        );
        assert_eq!(RelayError::Parse("bad".into()).error_code(), "PARSE_ERROR");
    }

    #[test]
    fn test_reporting_policy() {
        assert!(RelayError::Capacity { active: 2, max: 2 }.is_reported());
        assert!(RelayError::UpstreamStream("reset".into()).is_reported());
        assert!(!RelayError::Parse("bad".into()).is_reported());
        assert!(!RelayError::Timeout("idle".into()).is_reported());
    }
}
