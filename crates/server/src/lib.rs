//! Cistern control-plane server library.

pub mod auth;
pub mod consumer;
pub mod error;
pub mod events;
pub mod handlers;
pub mod ratelimit;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
