use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::SessionState;

/// Point-in-time view of one relay session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub device_id: String,

    pub session_id: String,

    pub state: SessionState,

    /// Upstream provider serving the session
    pub provider: String,

    /// When the session was admitted
    pub created_at: DateTime<Utc>,

    /// Age in seconds
    pub duration_secs: f64,

    /// Seconds since the last inbound or outbound fragment
    pub idle_secs: f64,

    /// Fragments forwarded to the upstream
    pub fragments_in: u64,

    /// Envelopes published to the device
    pub fragments_out: u64,

    pub bytes_in: u64,

    pub bytes_out: u64,

    /// Length of the accumulated response transcript
    pub transcript_chars: usize,
}
