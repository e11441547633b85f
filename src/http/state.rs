use crate::session::LiveSession;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The one live session this process drives
    pub session: LiveSession,
}

impl AppState {
    pub fn new(session: LiveSession) -> Self {
        Self { session }
    }
}
