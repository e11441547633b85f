//! HTTP API for driving the live session from a front-end
//!
//! - POST /live/start - Start talking (409 if already active)
//! - POST /live/stop - Stop and release everything
//! - GET /live/status - Session snapshot
//! - GET /live/transcript - Finalized turns so far
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use handlers::{ErrorResponse, StartSessionResponse};
pub use routes::create_router;
pub use state::AppState;
