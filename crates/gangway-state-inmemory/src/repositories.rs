use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use gangway_core::{
    domain::repository::{
        CredentialResolver, DiscoveryChannel, InstanceStore, OAuthGateway, SessionRepository,
    },
    domain::session::{Session, SessionId, StepId},
    AnswerMap, EngineError,
};

/// In-memory implementation of the SessionRepository
///
/// Saves are check-and-set: the caller's expected version must match the
/// stored one, and the stored copy gets the incremented version. This is
/// the same optimistic scheme a document store would provide.
pub struct InMemorySessionRepository {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl InMemorySessionRepository {
    /// Create a new in-memory session repository
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Drop sessions whose expiry has passed; returns how many were swept
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));
        let swept = before - sessions.len();
        if swept > 0 {
            debug!(swept, "swept expired sessions");
        }
        swept
    }
}

impl Default for InMemorySessionRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn find_by_id(&self, id: &SessionId) -> Result<Option<Session>, EngineError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(&id.0).cloned())
    }

    async fn save(&self, session: &Session, expected_version: u64) -> Result<u64, EngineError> {
        let mut sessions = self.sessions.write().await;
        let stored_version = sessions.get(&session.id.0).map(|s| s.version).unwrap_or(0);
        if stored_version != expected_version {
            warn!(
                session = %session.id,
                stored_version,
                expected_version,
                "rejecting write from stale session copy"
            );
            return Err(EngineError::ConcurrentModification(session.id.0.clone()));
        }

        let mut updated = session.clone();
        updated.version = expected_version + 1;
        let version = updated.version;
        sessions.insert(session.id.0.clone(), updated);
        Ok(version)
    }

    async fn delete(&self, id: &SessionId) -> Result<(), EngineError> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&id.0);
        Ok(())
    }

    async fn list_for_integration(&self, integration: &str) -> Result<Vec<Session>, EngineError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.integration == integration)
            .cloned()
            .collect())
    }
}

/// In-memory credential vault
pub struct InMemoryCredentialVault {
    slots: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl InMemoryCredentialVault {
    /// Create an empty vault
    pub fn new() -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryCredentialVault {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialResolver for InMemoryCredentialVault {
    async fn resolve(
        &self,
        integration: &str,
        slot: &str,
    ) -> Result<Option<String>, EngineError> {
        let slots = self.slots.read().await;
        Ok(slots
            .get(&(integration.to_string(), slot.to_string()))
            .cloned())
    }

    async fn store(
        &self,
        integration: &str,
        slot: &str,
        value: &str,
    ) -> Result<String, EngineError> {
        let mut slots = self.slots.write().await;
        slots.insert(
            (integration.to_string(), slot.to_string()),
            value.to_string(),
        );
        Ok(format!("secret://{}/{}", integration, slot))
    }
}

/// Discovery channel fed by announced items
///
/// Integrations (or their transports) push device announcements in;
/// discovery steps drain the current snapshot. The poll duration is a
/// ceiling, not a wait: announcements already buffered return immediately.
pub struct BufferedDiscoveryChannel {
    announcements: Arc<RwLock<Vec<serde_json::Value>>>,
}

impl BufferedDiscoveryChannel {
    /// Create an empty channel
    pub fn new() -> Self {
        Self {
            announcements: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Push a device announcement
    pub async fn announce(&self, item: serde_json::Value) {
        self.announcements.write().await.push(item);
    }

    /// Clear buffered announcements
    pub async fn clear(&self) {
        self.announcements.write().await.clear();
    }
}

impl Default for BufferedDiscoveryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiscoveryChannel for BufferedDiscoveryChannel {
    async fn poll(
        &self,
        _integration: &str,
        _duration: Duration,
    ) -> Result<Vec<serde_json::Value>, EngineError> {
        Ok(self.announcements.read().await.clone())
    }
}

/// In-memory instance repository
pub struct InMemoryInstanceRepository {
    documents: Arc<RwLock<HashMap<String, AnswerMap>>>,
}

impl InMemoryInstanceRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self {
            documents: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetch a persisted instance document
    pub async fn get(&self, instance_id: &str) -> Option<AnswerMap> {
        self.documents.read().await.get(instance_id).cloned()
    }
}

impl Default for InMemoryInstanceRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceRepository {
    async fn exists(&self, id: &str) -> Result<bool, EngineError> {
        Ok(self.documents.read().await.contains_key(id))
    }

    async fn persist(
        &self,
        integration: &str,
        session: &SessionId,
        document: AnswerMap,
    ) -> Result<String, EngineError> {
        let instance_id = format!("{}-{}", integration, uuid::Uuid::new_v4());
        debug!(%instance_id, session = %session, "persisting instance configuration");
        self.documents
            .write()
            .await
            .insert(instance_id.clone(), document);
        Ok(instance_id)
    }
}

/// OAuth gateway building redirect URLs off a fixed authorize endpoint
pub struct RedirectOAuthGateway {
    authorize_endpoint: String,
}

impl RedirectOAuthGateway {
    /// Gateway issuing redirects against the given authorize endpoint
    pub fn new(authorize_endpoint: impl Into<String>) -> Self {
        Self {
            authorize_endpoint: authorize_endpoint.into(),
        }
    }
}

#[async_trait]
impl OAuthGateway for RedirectOAuthGateway {
    async fn authorize_url(
        &self,
        integration: &str,
        session: &SessionId,
        step: &StepId,
    ) -> Result<String, EngineError> {
        Ok(format!(
            "{}?integration={}&state={}:{}",
            self.authorize_endpoint, integration, session, step
        ))
    }
}
