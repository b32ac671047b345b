pub mod active_requests;
pub mod auth;
pub mod channel_selector;
pub mod classify;
pub mod cooldown;
pub mod error;
pub mod forwarder;
pub mod handler;
pub mod key_selector;
pub mod log_writer;
pub mod orchestrator;
pub mod router;
pub mod state;

pub use error::{AuthError, ProxyError};
pub use handler::proxy_handler;
pub use router::build_router;
pub use state::AppState;
