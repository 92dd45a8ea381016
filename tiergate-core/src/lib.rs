//! Tiergate core library
//!
//! Routing, resilience and protocol transcoding for a messages-API gateway
//! that fronts native and OpenAI-compatible upstream providers.

pub mod cache;
pub mod circuit;
pub mod config;
pub mod context;
pub mod gateway;
pub mod health;
pub mod http;
pub mod protocol;
pub mod providers;
pub mod sink;
pub mod streaming;

pub use gateway::{Gateway, GatewayStatus, InitError, ProviderStatus};

/// Returns the version of the core library.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
