use crate::{error::EngineError, types::AnswerMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Value object: Session ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

/// Value object: Flow ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

/// Value object: Step ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is being driven by the client
    Active,

    /// Session is parked awaiting an out-of-band OAuth callback
    PendingCallback,

    /// Flow finished and the instance configuration was handed off
    Completed,

    /// Session was closed without producing an instance
    Aborted,
}

impl SessionStatus {
    /// Whether the session can still accept step responses
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, SessionStatus::Active | SessionStatus::PendingCallback)
    }
}

/// Aggregate: one in-progress (or finished) execution of a setup flow
///
/// Mutated exclusively by the interpreter. `history` is the ordered path of
/// entered steps with the current step as its last element; answers for
/// steps the session has advanced past are immutable unless a rerun
/// truncates history back to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,

    /// Integration this session is onboarding
    pub integration: String,

    /// Flow definition being interpreted
    pub flow_id: FlowId,

    /// Ordered path of entered steps, current step last
    pub history: Vec<StepId>,

    /// Validated/coerced answers keyed by step id
    pub answers: HashMap<StepId, AnswerMap>,

    /// The step the session is currently at
    pub current_step: StepId,

    /// Current status
    pub status: SessionStatus,

    /// Optimistic concurrency version, bumped by the store on save
    pub version: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    /// Hard expiry for parked sessions (OAuth callback wait)
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a new session positioned at the flow's initial step
    pub fn new(integration: impl Into<String>, flow_id: FlowId, initial_step: StepId) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId(Uuid::new_v4().to_string()),
            integration: integration.into(),
            flow_id,
            history: vec![initial_step.clone()],
            answers: HashMap::with_capacity(8),
            current_step: initial_step,
            status: SessionStatus::Active,
            version: 0,
            created_at: now,
            updated_at: now,
            expires_at: None,
        }
    }

    /// Update the timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the session has passed its expiry
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Record answers for the current step
    ///
    /// Overwriting is only legal for the current step; anything else is a
    /// violation of the append-only history invariant.
    pub fn record_answers(&mut self, step: &StepId, answers: AnswerMap) -> Result<(), EngineError> {
        if !self.status.is_open() {
            return Err(EngineError::SessionClosed(self.id.0.clone()));
        }
        if *step != self.current_step {
            return Err(EngineError::StaleStep {
                expected: self.current_step.0.clone(),
                got: step.0.clone(),
            });
        }

        self.answers.insert(step.clone(), answers);
        self.touch();
        Ok(())
    }

    /// Merge additional keys into the current step's answers
    pub fn merge_answers(&mut self, step: &StepId, extra: AnswerMap) -> Result<(), EngineError> {
        let mut merged = self.answers.get(step).cloned().unwrap_or_default();
        for (k, v) in extra {
            merged.insert(k, v);
        }
        self.record_answers(step, merged)
    }

    /// Advance the session to the given step, appending it to the path
    pub fn advance_to(&mut self, step: StepId) -> Result<(), EngineError> {
        if !self.status.is_open() {
            return Err(EngineError::SessionClosed(self.id.0.clone()));
        }

        self.history.push(step.clone());
        self.current_step = step;
        self.status = SessionStatus::Active;
        self.touch();
        Ok(())
    }

    /// Truncate history back to a previously entered step and reopen it
    ///
    /// Answers collected at and after the target step are discarded; the
    /// resulting history is a prefix of the old path ending at the target.
    pub fn truncate_to(&mut self, step: &StepId) -> Result<(), EngineError> {
        if !self.status.is_open() {
            return Err(EngineError::SessionClosed(self.id.0.clone()));
        }

        let position = self
            .history
            .iter()
            .position(|s| s == step)
            .ok_or_else(|| EngineError::StaleStep {
                expected: self.current_step.0.clone(),
                got: step.0.clone(),
            })?;

        for dropped in self.history.drain(position + 1..) {
            self.answers.remove(&dropped);
        }
        self.answers.remove(step);
        self.current_step = step.clone();
        self.status = SessionStatus::Active;
        self.expires_at = None;
        self.touch();
        Ok(())
    }

    /// Restart the session on a flow, discarding all progress
    pub fn restart(
        &mut self,
        flow_id: FlowId,
        initial_step: StepId,
        seed: Option<AnswerMap>,
    ) -> Result<(), EngineError> {
        if !self.status.is_open() {
            return Err(EngineError::SessionClosed(self.id.0.clone()));
        }

        self.flow_id = flow_id;
        self.history = vec![initial_step.clone()];
        self.answers.clear();
        if let Some(seed) = seed {
            self.answers.insert(initial_step.clone(), seed);
        }
        self.current_step = initial_step;
        self.status = SessionStatus::Active;
        self.expires_at = None;
        self.touch();
        Ok(())
    }

    /// Park the session awaiting an out-of-band callback
    pub fn park(&mut self, expires_at: DateTime<Utc>) -> Result<(), EngineError> {
        if self.status != SessionStatus::Active {
            return Err(EngineError::SessionClosed(self.id.0.clone()));
        }
        self.status = SessionStatus::PendingCallback;
        self.expires_at = Some(expires_at);
        self.touch();
        Ok(())
    }

    /// Mark the session completed
    pub fn complete(&mut self) -> Result<(), EngineError> {
        if !self.status.is_open() {
            return Err(EngineError::SessionClosed(self.id.0.clone()));
        }
        self.status = SessionStatus::Completed;
        self.expires_at = None;
        self.touch();
        Ok(())
    }

    /// Mark the session aborted; partial answers are never handed off
    pub fn abort(&mut self) -> Result<(), EngineError> {
        if !self.status.is_open() {
            return Err(EngineError::SessionClosed(self.id.0.clone()));
        }
        self.status = SessionStatus::Aborted;
        self.expires_at = None;
        self.touch();
        Ok(())
    }

    /// Flatten accumulated answers in path order; later steps win on key
    /// collisions
    pub fn flattened_answers(&self) -> AnswerMap {
        let mut flat = AnswerMap::new();
        for step in &self.history {
            if let Some(map) = self.answers.get(step) {
                for (k, v) in map {
                    flat.insert(k.clone(), v.clone());
                }
            }
        }
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn answers(pairs: &[(&str, serde_json::Value)]) -> AnswerMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn new_session() -> Session {
        Session::new(
            "shimmer",
            FlowId("setup".to_string()),
            StepId("welcome".to_string()),
        )
    }

    #[test]
    fn test_session_creation() {
        let session = new_session();
        assert_eq!(session.integration, "shimmer");
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.history, vec![StepId("welcome".to_string())]);
        assert_eq!(session.current_step, StepId("welcome".to_string()));
        assert_eq!(session.version, 0);
        assert!(!session.id.0.is_empty());
    }

    #[test]
    fn test_record_answers_rejects_non_current_step() {
        let mut session = new_session();
        let result = session.record_answers(
            &StepId("credentials".to_string()),
            answers(&[("token", json!("abc"))]),
        );

        match result {
            Err(EngineError::StaleStep { expected, got }) => {
                assert_eq!(expected, "welcome");
                assert_eq!(got, "credentials");
            }
            other => panic!("Expected StaleStep, got {:?}", other),
        }
    }

    #[test]
    fn test_advance_appends_to_history() {
        let mut session = new_session();
        session
            .record_answers(
                &StepId("welcome".to_string()),
                answers(&[("deviceType", json!("light"))]),
            )
            .unwrap();
        session.advance_to(StepId("credentials".to_string())).unwrap();

        assert_eq!(session.current_step, StepId("credentials".to_string()));
        assert_eq!(session.history.len(), 2);

        // Prior step answers are still visible but can no longer be written
        let result = session.record_answers(
            &StepId("welcome".to_string()),
            answers(&[("deviceType", json!("plug"))]),
        );
        assert!(matches!(result, Err(EngineError::StaleStep { .. })));
    }

    #[test]
    fn test_truncate_to_yields_prefix() {
        let mut session = new_session();
        for step in ["credentials", "discovery", "summary"] {
            session.advance_to(StepId(step.to_string())).unwrap();
            session
                .record_answers(&StepId(step.to_string()), answers(&[("k", json!(step))]))
                .unwrap();
        }

        let full_path = session.history.clone();
        session.truncate_to(&StepId("credentials".to_string())).unwrap();

        assert_eq!(session.current_step, StepId("credentials".to_string()));
        assert_eq!(session.history, full_path[..2].to_vec());
        // Reopened and later steps lose their answers
        assert!(!session.answers.contains_key(&StepId("credentials".to_string())));
        assert!(!session.answers.contains_key(&StepId("discovery".to_string())));
        assert!(!session.answers.contains_key(&StepId("summary".to_string())));
    }

    #[test]
    fn test_truncate_to_unknown_step() {
        let mut session = new_session();
        let result = session.truncate_to(&StepId("never_entered".to_string()));
        assert!(matches!(result, Err(EngineError::StaleStep { .. })));
    }

    #[test]
    fn test_flattened_answers_later_steps_win() {
        let mut session = new_session();
        session
            .record_answers(
                &StepId("welcome".to_string()),
                answers(&[("host", json!("old.local")), ("deviceType", json!("light"))]),
            )
            .unwrap();
        session.advance_to(StepId("credentials".to_string())).unwrap();
        session
            .record_answers(
                &StepId("credentials".to_string()),
                answers(&[("host", json!("new.local"))]),
            )
            .unwrap();

        let flat = session.flattened_answers();
        assert_eq!(flat.get("host").unwrap(), &json!("new.local"));
        assert_eq!(flat.get("deviceType").unwrap(), &json!("light"));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut session = new_session();
        session.complete().unwrap();

        assert!(matches!(
            session.advance_to(StepId("x".to_string())),
            Err(EngineError::SessionClosed(_))
        ));
        assert!(matches!(session.abort(), Err(EngineError::SessionClosed(_))));
    }

    #[test]
    fn test_park_and_expiry() {
        let mut session = new_session();
        let past = Utc::now() - chrono::Duration::seconds(10);
        session.park(past).unwrap();

        assert_eq!(session.status, SessionStatus::PendingCallback);
        assert!(session.status.is_open());
        assert!(session.is_expired(Utc::now()));

        // Truncating back clears the pending expiry
        session.truncate_to(&StepId("welcome".to_string())).unwrap();
        assert!(session.expires_at.is_none());
        assert!(!session.is_expired(Utc::now()));
    }

    #[test]
    fn test_restart_discards_progress_and_seeds() {
        let mut session = new_session();
        session
            .record_answers(
                &StepId("welcome".to_string()),
                answers(&[("deviceType", json!("light"))]),
            )
            .unwrap();
        session.advance_to(StepId("credentials".to_string())).unwrap();

        session
            .restart(
                FlowId("manual".to_string()),
                StepId("address".to_string()),
                Some(answers(&[("host", json!("192.168.1.40"))])),
            )
            .unwrap();

        assert_eq!(session.flow_id, FlowId("manual".to_string()));
        assert_eq!(session.history, vec![StepId("address".to_string())]);
        assert_eq!(
            session.flattened_answers().get("host").unwrap(),
            &json!("192.168.1.40")
        );
        assert!(session.flattened_answers().get("deviceType").is_none());
    }

    #[test]
    fn test_session_serialization() {
        let mut session = new_session();
        session
            .record_answers(
                &StepId("welcome".to_string()),
                answers(&[("deviceType", json!("light"))]),
            )
            .unwrap();

        let serialized = serde_json::to_string(&session).unwrap();
        let deserialized: Session = serde_json::from_str(&serialized).unwrap();

        assert_eq!(deserialized.id, session.id);
        assert_eq!(deserialized.current_step, session.current_step);
        assert_eq!(deserialized.flattened_answers(), session.flattened_answers());
    }
}
