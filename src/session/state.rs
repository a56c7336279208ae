use serde::{Deserialize, Serialize};

/// Lifecycle of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Upstream handshake in flight
    Connecting,
    /// Audio flowing in either direction
    Streaming,
    /// Quiet for longer than the idle grace window, upstream still open
    Idle,
    /// Upstream failed; always followed by `Closing`
    Error,
    /// Shutdown initiated
    Closing,
    /// Terminal
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }

    /// Whether the session still accepts device audio
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming | Self::Idle)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, Streaming) => true,
            (Streaming, Idle) | (Idle, Streaming) => true,
            (Connecting | Streaming | Idle, Error) => true,
            (Connecting | Streaming | Idle | Error, Closing) => true,
            (Closing, Closed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;

    #[test]
    fn test_happy_path() {
        assert!(Connecting.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Streaming));
        assert!(Idle.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
    }

    #[test]
    fn test_error_only_leads_to_closing() {
        assert!(Connecting.can_transition_to(Error));
        assert!(Error.can_transition_to(Closing));
        assert!(!Error.can_transition_to(Streaming));
        assert!(!Error.can_transition_to(Closed));
    }

    #[test]
    fn test_closed_is_terminal() {
        for next in [Connecting, Streaming, Idle, Error, Closing, Closed] {
            assert!(!Closed.can_transition_to(next));
        }
        assert!(!Closing.can_transition_to(Error));
        assert!(!Connecting.can_transition_to(Idle));
    }
}
