//! Dripline API - HTTP control surface over the scheduler engine

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::{ApiError, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
