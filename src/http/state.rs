use crate::relay::RelayEngine;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Running relay; sessions and counters are read through it
    pub engine: RelayEngine,
}

impl AppState {
    pub fn new(engine: RelayEngine) -> Self {
        Self { engine }
    }
}
