//! In-memory state store implementation for the Gangway engine
//!
//! This crate provides in-memory implementations of the adapter traits
//! defined in gangway-core. It is primarily useful for development,
//! testing, and single-process deployments where durable persistence is
//! not required; the optimistic versioning contract matches what a
//! document store would provide, so embedders can swap stores without
//! touching the interpreter.

use std::sync::Arc;

pub mod repositories;
pub use repositories::{
    BufferedDiscoveryChannel, InMemoryCredentialVault, InMemoryInstanceRepository,
    InMemorySessionRepository, RedirectOAuthGateway,
};

/// Bundle of in-memory adapters wired for a single engine
pub struct InMemoryStateStoreProvider {
    /// Session repository
    pub sessions: Arc<InMemorySessionRepository>,
    /// Credential vault
    pub credentials: Arc<InMemoryCredentialVault>,
    /// Discovery channel
    pub discovery: Arc<BufferedDiscoveryChannel>,
    /// Instance repository
    pub instances: Arc<InMemoryInstanceRepository>,
}

impl InMemoryStateStoreProvider {
    /// Create a fresh set of adapters
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(InMemorySessionRepository::new()),
            credentials: Arc::new(InMemoryCredentialVault::new()),
            discovery: Arc::new(BufferedDiscoveryChannel::new()),
            instances: Arc::new(InMemoryInstanceRepository::new()),
        }
    }
}

impl Default for InMemoryStateStoreProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests;
