//! Relay session management
//!
//! This module provides the `Session` abstraction and its registry:
//! - One session per device, owning one upstream connection
//! - Session state machine (connecting, streaming, idle, closing)
//! - Capacity-bounded admission and device session switching
//! - Idle-timeout sweep
//! - Session statistics

mod config;
pub mod registry;
mod session;
mod state;
mod stats;

pub use config::SessionLimits;
pub use registry::{Resolution, SessionRegistry};
pub use session::{Inbound, Session};
pub use state::SessionState;
pub use stats::SessionStats;
