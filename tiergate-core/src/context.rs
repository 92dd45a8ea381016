//! Per-request context
//!
//! Everything a request needs from the outside world is carried here and
//! passed down explicitly: the verified caller identity and the
//! configuration snapshot the request was admitted under.

use crate::config::ConfigSnapshot;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque accounting identity produced by the auth collaborator
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Context threaded through router, retry executor and converter
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub identity: Identity,
    /// Configuration pinned for the whole lifetime of the request
    pub snapshot: Arc<ConfigSnapshot>,
    pub started: Instant,
}

impl RequestContext {
    pub fn new(snapshot: Arc<ConfigSnapshot>, identity: Identity) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            identity,
            snapshot,
            started: Instant::now(),
        }
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn config_version(&self) -> u64 {
        self.snapshot.version
    }
}
