//! Adapter traits for the Gangway engine
//!
//! The interpreter owns no storage or transport of its own; everything it
//! touches beyond the loaded flow catalog goes through these traits.
//! External crates implement them to provide real persistence, credential
//! vaults, and discovery feeds.

use async_trait::async_trait;
use std::time::Duration;

use super::session::{Session, SessionId, StepId};
use crate::error::EngineError;
use crate::types::AnswerMap;

/// Store for persisted sessions with optimistic concurrency
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Find a session by ID
    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, EngineError>;

    /// Save a session, guarding against concurrent writers
    ///
    /// `expected_version` must match the stored version (0 for a new
    /// session). Returns the new stored version; a mismatch surfaces
    /// `ConcurrentModificationError` and leaves the store untouched.
    async fn save(&self, session: &Session, expected_version: u64) -> Result<u64, EngineError>;

    /// Delete a session
    async fn delete(&self, id: &SessionId) -> Result<(), EngineError>;

    /// List sessions belonging to an integration
    async fn list_for_integration(&self, integration: &str) -> Result<Vec<Session>, EngineError>;
}

/// Credential vault, scoped per integration
///
/// Secret form answers are diverted here at submission time; sessions and
/// instance documents only ever carry `secret://` references, which tools
/// and the runtime bridge resolve back through this trait.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Resolve a credential slot to its value
    async fn resolve(&self, integration: &str, slot: &str)
        -> Result<Option<String>, EngineError>;

    /// Store a value under a slot, returning the opaque reference that may
    /// be persisted in its place
    async fn store(
        &self,
        integration: &str,
        slot: &str,
        value: &str,
    ) -> Result<String, EngineError>;
}

/// Device-announcement feed polled by discovery steps
#[async_trait]
pub trait DiscoveryChannel: Send + Sync {
    /// Collect candidate items for up to `duration`; empty is a valid
    /// result, not an error
    async fn poll(
        &self,
        integration: &str,
        duration: Duration,
    ) -> Result<Vec<serde_json::Value>, EngineError>;
}

/// Collaborator owning persisted instance configurations
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Whether a flow prerequisite (flow or instance id) is satisfied
    async fn exists(&self, id: &str) -> Result<bool, EngineError>;

    /// Hand off a completed session's answer set as an instance document
    async fn persist(
        &self,
        integration: &str,
        session: &SessionId,
        document: AnswerMap,
    ) -> Result<String, EngineError>;
}

/// Produces OAuth redirect targets for `oauth` steps
#[async_trait]
pub trait OAuthGateway: Send + Sync {
    /// Redirect URL the client must visit; the provider's callback resumes
    /// the session out of band
    async fn authorize_url(
        &self,
        integration: &str,
        session: &SessionId,
        step: &StepId,
    ) -> Result<String, EngineError>;
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Mutex;

    /// In-memory session repository with optimistic version checking
    pub struct MemorySessionRepository {
        sessions: DashMap<String, Session>,
    }

    impl MemorySessionRepository {
        /// Create a new memory session repository
        pub fn new() -> Self {
            Self {
                sessions: DashMap::with_capacity(16),
            }
        }
    }

    impl Default for MemorySessionRepository {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl SessionRepository for MemorySessionRepository {
        async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, EngineError> {
            Ok(self.sessions.get(&id.0).map(|s| s.clone()))
        }

        async fn save(&self, session: &Session, expected_version: u64) -> Result<u64, EngineError> {
            // entry() holds the shard lock across the check-and-set
            match self.sessions.entry(session.id.0.clone()) {
                dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                    if occupied.get().version != expected_version {
                        return Err(EngineError::ConcurrentModification(session.id.0.clone()));
                    }
                    let mut stored = session.clone();
                    stored.version = expected_version + 1;
                    let version = stored.version;
                    occupied.insert(stored);
                    Ok(version)
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    if expected_version != 0 {
                        return Err(EngineError::ConcurrentModification(session.id.0.clone()));
                    }
                    let mut stored = session.clone();
                    stored.version = 1;
                    vacant.insert(stored);
                    Ok(1)
                }
            }
        }

        async fn delete(&self, id: &SessionId) -> Result<(), EngineError> {
            self.sessions.remove(&id.0);
            Ok(())
        }

        async fn list_for_integration(
            &self,
            integration: &str,
        ) -> Result<Vec<Session>, EngineError> {
            Ok(self
                .sessions
                .iter()
                .filter(|s| s.integration == integration)
                .map(|s| s.clone())
                .collect())
        }
    }

    /// Credential vault backed by a concurrent map
    pub struct MemoryCredentialResolver {
        slots: DashMap<(String, String), String>,
    }

    impl MemoryCredentialResolver {
        /// Build a vault from `(integration, slot, value)` triples
        pub fn new(entries: &[(&str, &str, &str)]) -> Self {
            let slots = DashMap::new();
            for (i, s, v) in entries {
                slots.insert((i.to_string(), s.to_string()), v.to_string());
            }
            Self { slots }
        }
    }

    #[async_trait]
    impl CredentialResolver for MemoryCredentialResolver {
        async fn resolve(
            &self,
            integration: &str,
            slot: &str,
        ) -> Result<Option<String>, EngineError> {
            Ok(self
                .slots
                .get(&(integration.to_string(), slot.to_string()))
                .map(|v| v.clone()))
        }

        async fn store(
            &self,
            integration: &str,
            slot: &str,
            value: &str,
        ) -> Result<String, EngineError> {
            self.slots
                .insert((integration.to_string(), slot.to_string()), value.to_string());
            Ok(format!("secret://{}/{}", integration, slot))
        }
    }

    /// Discovery channel that serves pre-scripted announcements
    pub struct ScriptedDiscoveryChannel {
        items: Mutex<Vec<serde_json::Value>>,
    }

    impl ScriptedDiscoveryChannel {
        /// Create a channel that will answer every poll with `items`
        pub fn new(items: Vec<serde_json::Value>) -> Self {
            Self {
                items: Mutex::new(items),
            }
        }

        /// A channel that never finds anything
        pub fn empty() -> Self {
            Self::new(Vec::new())
        }
    }

    #[async_trait]
    impl DiscoveryChannel for ScriptedDiscoveryChannel {
        async fn poll(
            &self,
            _integration: &str,
            _duration: Duration,
        ) -> Result<Vec<serde_json::Value>, EngineError> {
            Ok(self.items.lock().expect("discovery items lock").clone())
        }
    }

    /// Instance store recording persisted documents in memory
    pub struct MemoryInstanceStore {
        known: DashMap<String, ()>,
        persisted: DashMap<String, AnswerMap>,
    }

    impl MemoryInstanceStore {
        /// Create an empty store
        pub fn new() -> Self {
            Self {
                known: DashMap::new(),
                persisted: DashMap::new(),
            }
        }

        /// Pre-register an existing flow/instance id for prerequisites
        pub fn with_existing(self, id: &str) -> Self {
            self.known.insert(id.to_string(), ());
            self
        }

        /// The document persisted for a session, if any
        pub fn document_for(&self, session: &SessionId) -> Option<AnswerMap> {
            self.persisted.get(&session.0).map(|d| d.clone())
        }
    }

    impl Default for MemoryInstanceStore {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl InstanceStore for MemoryInstanceStore {
        async fn exists(&self, id: &str) -> Result<bool, EngineError> {
            Ok(self.known.contains_key(id))
        }

        async fn persist(
            &self,
            integration: &str,
            session: &SessionId,
            document: AnswerMap,
        ) -> Result<String, EngineError> {
            let instance_id = format!("{}-{}", integration, session.0);
            self.persisted.insert(session.0.clone(), document);
            self.known.insert(instance_id.clone(), ());
            Ok(instance_id)
        }
    }

    /// OAuth gateway producing deterministic redirect URLs
    pub struct StaticOAuthGateway {
        base: String,
    }

    impl StaticOAuthGateway {
        /// Gateway that prefixes every redirect with `base`
        pub fn new(base: impl Into<String>) -> Self {
            Self { base: base.into() }
        }
    }

    #[async_trait]
    impl OAuthGateway for StaticOAuthGateway {
        async fn authorize_url(
            &self,
            integration: &str,
            session: &SessionId,
            step: &StepId,
        ) -> Result<String, EngineError> {
            Ok(format!(
                "{}/authorize?integration={}&session={}&step={}",
                self.base, integration, session, step
            ))
        }
    }

}
