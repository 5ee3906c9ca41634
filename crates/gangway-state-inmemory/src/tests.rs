use super::*;
use gangway_core::domain::repository::{
    CredentialResolver, DiscoveryChannel, InstanceStore, SessionRepository,
};
use gangway_core::domain::session::{FlowId, Session, SessionId, StepId};
use gangway_core::EngineError;
use serde_json::json;
use std::time::Duration;

fn sample_session() -> Session {
    Session::new(
        "shimmer",
        FlowId("setup".to_string()),
        StepId("welcome".to_string()),
    )
}

#[tokio::test]
async fn save_and_reload_round_trips() {
    let repo = InMemorySessionRepository::new();
    let session = sample_session();

    let version = repo.save(&session, 0).await.unwrap();
    assert_eq!(version, 1);

    let loaded = repo.find_by_id(&session.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, session.id);
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.current_step, session.current_step);
}

#[tokio::test]
async fn stale_writer_loses_the_version_race() {
    let repo = InMemorySessionRepository::new();
    let session = sample_session();
    repo.save(&session, 0).await.unwrap();

    let fresh = repo.find_by_id(&session.id).await.unwrap().unwrap();
    repo.save(&fresh, fresh.version).await.unwrap();

    // The first copy still believes version 1; its write must be refused
    let result = repo.save(&fresh, 1).await;
    assert!(matches!(
        result,
        Err(EngineError::ConcurrentModification(_))
    ));
}

#[tokio::test]
async fn missing_session_is_none_not_error() {
    let repo = InMemorySessionRepository::new();
    let found = repo
        .find_by_id(&SessionId("never-created".to_string()))
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn sweep_removes_only_expired_sessions() {
    let repo = InMemorySessionRepository::new();

    let mut expired = sample_session();
    expired.expires_at = Some(chrono::Utc::now() - chrono::Duration::minutes(5));
    repo.save(&expired, 0).await.unwrap();

    let fresh = sample_session();
    repo.save(&fresh, 0).await.unwrap();

    assert_eq!(repo.sweep_expired().await, 1);
    assert!(repo.find_by_id(&expired.id).await.unwrap().is_none());
    assert!(repo.find_by_id(&fresh.id).await.unwrap().is_some());
}

#[tokio::test]
async fn vault_stores_and_resolves_scoped_slots() {
    let vault = InMemoryCredentialVault::new();
    let reference = vault.store("shimmer", "token", "tok-raw-4711").await.unwrap();
    assert_eq!(reference, "secret://shimmer/token");

    let value = vault.resolve("shimmer", "token").await.unwrap();
    assert_eq!(value.as_deref(), Some("tok-raw-4711"));

    // Slots are scoped per integration
    let other = vault.resolve("other", "token").await.unwrap();
    assert!(other.is_none());
}

#[tokio::test]
async fn discovery_serves_buffered_announcements() {
    let channel = BufferedDiscoveryChannel::new();
    assert!(channel
        .poll("shimmer", Duration::from_secs(1))
        .await
        .unwrap()
        .is_empty());

    channel.announce(json!({"addr": "192.168.1.40"})).await;
    channel.announce(json!({"addr": "192.168.1.41"})).await;

    let items = channel.poll("shimmer", Duration::from_secs(1)).await.unwrap();
    assert_eq!(items.len(), 2);

    channel.clear().await;
    assert!(channel
        .poll("shimmer", Duration::from_secs(1))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn persisted_instances_satisfy_prerequisites() {
    let instances = InMemoryInstanceRepository::new();
    let session = sample_session();

    let mut document = gangway_core::AnswerMap::new();
    document.insert("host".to_string(), json!("192.168.1.40"));
    let instance_id = instances
        .persist("shimmer", &session.id, document.clone())
        .await
        .unwrap();

    assert!(instances.exists(&instance_id).await.unwrap());
    assert_eq!(instances.get(&instance_id).await.unwrap(), document);
}
