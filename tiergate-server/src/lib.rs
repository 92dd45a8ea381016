//! Tiergate HTTP surface
//!
//! Exposes the messages API (streamed and non-streamed), local token
//! counting and the admin endpoints over axum.

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

pub use auth::{ApiKeyResolver, AuthError, IdentityResolver};
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
