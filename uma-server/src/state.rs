use std::sync::Arc;

use uma_core::supervisor::Supervisor;

use crate::websocket::StreamSessions;

/// Shared application state: the core supervisor plus surface-level session
/// tracking. Everything is an `Arc`; cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Supervisor>,
    pub sessions: Arc<StreamSessions>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("sessions", &self.sessions.count())
            .finish()
    }
}

impl AppState {
    pub fn new(core: Arc<Supervisor>) -> Self {
        Self {
            core,
            sessions: Arc::new(StreamSessions::default()),
        }
    }
}
