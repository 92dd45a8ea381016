use crate::auth::{ApiKeyResolver, IdentityResolver};
use std::sync::Arc;
use tiergate_core::Gateway;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub identity: Arc<dyn IdentityResolver>,
}

impl AppState {
    /// State using the configured inbound API keys
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self::with_resolver(gateway, Arc::new(ApiKeyResolver))
    }

    pub fn with_resolver(gateway: Arc<Gateway>, identity: Arc<dyn IdentityResolver>) -> Self {
        Self { gateway, identity }
    }
}
