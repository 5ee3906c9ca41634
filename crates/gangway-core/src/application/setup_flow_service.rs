//! The flow interpreter
//!
//! Stateless between requests: every transition loads the persisted
//! session, applies exactly one step response, and saves atomically under
//! an optimistic version check before anything is returned to the caller.

use crate::application::flow_catalog::FlowCatalog;
use crate::config::EngineConfig;
use crate::domain::flow_definition::{
    ActionKind, FlowAction, FlowDefinition, FlowStep, StepKind,
};
use crate::domain::form::{coerce_submission, redact, FormSchema};
use crate::domain::repository::{
    CredentialResolver, DiscoveryChannel, InstanceStore, OAuthGateway, SessionRepository,
};
use crate::domain::session::{Session, SessionId, SessionStatus, StepId};
use crate::error::{EngineError, FieldError};
use crate::types::AnswerMap;
use crate::{ToolRequest, ToolRunner};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One client response driving a session forward
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResponse {
    /// The step the client believes is current
    pub step_id: StepId,

    /// Raw submitted answers for that step
    #[serde(default)]
    pub answers: AnswerMap,

    /// Explicit action overriding the default linear advance
    #[serde(default)]
    pub action: Option<FlowAction>,

    /// Acknowledgement for actions carrying a confirm prompt
    #[serde(default)]
    pub confirmed: bool,
}

impl StepResponse {
    /// A bare submission of answers for a step
    pub fn answers(step_id: StepId, answers: AnswerMap) -> Self {
        Self {
            step_id,
            answers,
            action: None,
            confirmed: false,
        }
    }

    /// An action dispatch with no answers
    pub fn action(step_id: StepId, action: FlowAction) -> Self {
        Self {
            step_id,
            answers: AnswerMap::new(),
            action: Some(action),
            confirmed: false,
        }
    }
}

/// What the rendering collaborator needs to draw the next step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Step id
    pub step_id: StepId,

    /// Step type
    pub kind: StepKind,

    /// Form schema, when the step collects input
    pub schema: Option<FormSchema>,

    /// Actions available at the step
    pub actions: Vec<FlowAction>,

    /// Field-level errors to render inline, if any
    pub errors: Vec<FieldError>,

    /// Candidate items accumulated by a discovery step
    pub items: Option<Vec<Value>>,

    /// Redirect target produced by an OAuth step
    pub redirect_url: Option<String>,
}

/// Result of applying one step response
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Snapshot of the session after the transition was persisted
    pub session: Session,

    /// Descriptor of the step to render next; absent on terminal states
    pub descriptor: Option<StepDescriptor>,

    /// An `open_url`/`custom` action forwarded verbatim to the renderer
    pub forwarded: Option<FlowAction>,

    /// Identifier of the persisted instance, set on completion
    pub instance_id: Option<String>,
}

/// Internal progress marker produced by the transition phase
enum Advance {
    /// Stay at (or render) the session's current step
    AwaitInput,
    /// Session completed; instance configuration was handed off
    Completed(String),
    /// Session aborted without persisting partial instance data
    Aborted,
    /// Session parked awaiting an out-of-band OAuth callback
    Parked(String),
    /// Opaque action the renderer must handle
    Forwarded(FlowAction),
}

/// Service interpreting setup flows over persisted sessions
pub struct SetupFlowService {
    catalog: Arc<FlowCatalog>,
    sessions: Arc<dyn SessionRepository>,
    tools: Arc<dyn ToolRunner>,
    credentials: Arc<dyn CredentialResolver>,
    discovery: Arc<dyn DiscoveryChannel>,
    instances: Arc<dyn InstanceStore>,
    oauth: Arc<dyn OAuthGateway>,
    config: EngineConfig,
}

impl SetupFlowService {
    /// Create a new setup-flow service
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<FlowCatalog>,
        sessions: Arc<dyn SessionRepository>,
        tools: Arc<dyn ToolRunner>,
        credentials: Arc<dyn CredentialResolver>,
        discovery: Arc<dyn DiscoveryChannel>,
        instances: Arc<dyn InstanceStore>,
        oauth: Arc<dyn OAuthGateway>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            sessions,
            tools,
            credentials,
            discovery,
            instances,
            oauth,
            config,
        }
    }

    /// Start a new session on the named flow (or the integration default)
    pub async fn start(
        &self,
        integration: &str,
        flow_id: Option<&str>,
        seed: Option<AnswerMap>,
    ) -> Result<StepOutcome, EngineError> {
        let flow = match flow_id {
            Some(id) => self.catalog.resolve(integration, id)?,
            None => self.catalog.default_flow(integration).ok_or_else(|| {
                EngineError::FlowConfig(format!(
                    "Integration {} declares no default flow",
                    integration
                ))
            })?,
        };

        for prerequisite in &flow.prerequisites {
            if !self.instances.exists(prerequisite).await? {
                return Err(EngineError::FlowConfig(format!(
                    "Flow {} requires {} which does not exist",
                    flow.id, prerequisite
                )));
            }
        }

        // Guaranteed by catalog validation
        let initial = flow.initial_step().ok_or_else(|| {
            EngineError::FlowConfig(format!("Flow {} has no unconditional first step", flow.id))
        })?;

        let mut session = Session::new(integration, flow.id.clone(), initial.id.clone());
        if let Some(seed) = seed {
            let initial_id = initial.id.clone();
            session.record_answers(&initial_id, seed)?;
        }
        info!(session = %session.id, flow = %flow.id, integration, "session started");

        let progress = match self.enter_current(&mut session, flow, 0).await {
            Ok(progress) => progress,
            Err(err) => {
                if matches!(err, EngineError::FlowLoop { .. }) {
                    session.abort().ok();
                }
                self.persist_best_effort(&mut session, 0).await;
                return Err(err);
            }
        };
        self.persist(&mut session, 0).await?;
        self.outcome(session, progress)
    }

    /// Apply one step response to a session
    pub async fn handle(
        &self,
        session_id: &SessionId,
        response: StepResponse,
    ) -> Result<StepOutcome, EngineError> {
        let mut session = self.load_open(session_id).await?;
        let expected = session.version;
        let original = session.clone();

        if response.step_id != session.current_step {
            return Err(EngineError::StaleStep {
                expected: session.current_step.0.clone(),
                got: response.step_id.0.clone(),
            });
        }

        let progress = match self.transition(&mut session, response).await {
            Ok(progress) => progress,
            Err(err) => {
                if matches!(err, EngineError::FlowLoop { .. }) {
                    session.abort().ok();
                }
                // Tool failures and loop aborts have already moved the
                // session; persist the position so the step is re-enterable
                if session != original {
                    self.persist_best_effort(&mut session, expected).await;
                }
                return Err(err);
            }
        };

        self.persist(&mut session, expected).await?;
        self.outcome(session, progress)
    }

    /// Re-emit the current step's descriptor from persisted state alone
    pub async fn resume(&self, session_id: &SessionId) -> Result<StepOutcome, EngineError> {
        let session = self.load_open(session_id).await?;
        self.outcome(session, Advance::AwaitInput)
    }

    /// Abort a session explicitly
    pub async fn cancel(&self, session_id: &SessionId) -> Result<(), EngineError> {
        let mut session = self
            .sessions
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.0.clone()))?;
        if session.status.is_open() {
            let expected = session.version;
            session.abort()?;
            self.persist(&mut session, expected).await?;
        }
        Ok(())
    }

    /// List sessions for an integration
    pub async fn list(&self, integration: &str) -> Result<Vec<Session>, EngineError> {
        self.sessions.list_for_integration(integration).await
    }

    async fn load_open(&self, session_id: &SessionId) -> Result<Session, EngineError> {
        let mut session = self
            .sessions
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.0.clone()))?;

        if !session.status.is_open() {
            return Err(EngineError::SessionClosed(session_id.0.clone()));
        }
        if session.is_expired(Utc::now()) {
            let expected = session.version;
            session.abort().ok();
            self.persist_best_effort(&mut session, expected).await;
            return Err(EngineError::SessionExpired(session_id.0.clone()));
        }
        Ok(session)
    }

    /// The transition function: ingest the response at the current step,
    /// then apply the action override or the default linear advance
    async fn transition(
        &self,
        session: &mut Session,
        response: StepResponse,
    ) -> Result<Advance, EngineError> {
        let flow = self.current_flow(session)?.clone();
        let step = flow
            .step(&session.current_step)
            .ok_or_else(|| {
                EngineError::FlowConfig(format!(
                    "Session {} is at unknown step {}",
                    session.id, session.current_step
                ))
            })?
            .clone();

        match step.kind {
            StepKind::Form => {
                let schema = step.schema.as_ref().ok_or_else(|| {
                    EngineError::FlowConfig(format!("Form step {} has no schema", step.id))
                })?;
                let mut coerced =
                    coerce_submission(schema, &response.answers).map_err(|errors| {
                        EngineError::FieldValidation {
                            step: step.id.0.clone(),
                            errors,
                        }
                    })?;
                self.divert_secrets(session, schema, &mut coerced).await?;
                session.record_answers(&step.id, coerced)?;
            }
            StepKind::Tool => {
                self.run_tool_step(session, &flow, &step).await?;
            }
            StepKind::Discovery => {
                self.run_discovery_step(session, &step).await?;
            }
            StepKind::Oauth => {
                if response.answers.is_empty() && response.action.is_none() {
                    let url = self
                        .oauth
                        .authorize_url(&session.integration, &session.id, &step.id)
                        .await?;
                    let expires =
                        Utc::now() + chrono::Duration::seconds(self.config.pending_callback_ttl_secs as i64);
                    if session.status == SessionStatus::Active {
                        session.park(expires)?;
                    }
                    return Ok(Advance::Parked(url));
                }
                // Out-of-band callback resumed the session with the
                // provider's code in the answers
                if !response.answers.is_empty() {
                    session.record_answers(&step.id, response.answers.clone())?;
                }
            }
            StepKind::Select | StepKind::Summary | StepKind::Message | StepKind::Instance => {
                if !response.answers.is_empty() {
                    session.record_answers(&step.id, response.answers.clone())?;
                }
            }
        }

        match response.action {
            Some(action) => {
                self.apply_action(session, &flow, &step, action, response.confirmed)
                    .await
            }
            None => self.advance(session, &flow, 0).await,
        }
    }

    /// Apply an explicit action; it takes precedence over linear advance
    async fn apply_action(
        &self,
        session: &mut Session,
        flow: &FlowDefinition,
        step: &FlowStep,
        requested: FlowAction,
        confirmed: bool,
    ) -> Result<Advance, EngineError> {
        // The declared action is authoritative for confirm prompts and
        // payload defaults; submit/close are always available
        let declared = step.action(&requested.kind).cloned().or_else(|| {
            matches!(requested.kind, ActionKind::Submit | ActionKind::Close)
                .then(|| FlowAction::of(requested.kind.clone()))
        });
        let Some(declared) = declared else {
            return Err(EngineError::FlowConfig(format!(
                "Action {} is not declared on step {}",
                String::from(requested.kind),
                step.id
            )));
        };

        if let Some(prompt) = &declared.confirm {
            if !confirmed {
                return Err(EngineError::ConfirmationRequired(prompt.clone()));
            }
        }
        let payload = requested.payload.or_else(|| declared.payload.clone());

        debug!(session = %session.id, action = %String::from(declared.kind.clone()), "applying action");
        match declared.kind {
            ActionKind::Submit => {
                let answers = session.flattened_answers();
                if flow.next_satisfiable(&session.current_step, &answers).is_none() {
                    self.complete(session).await
                } else {
                    self.advance(session, flow, 0).await
                }
            }
            ActionKind::Close => {
                session.abort()?;
                info!(session = %session.id, "session aborted");
                Ok(Advance::Aborted)
            }
            ActionKind::GotoFlow => {
                let target = declared.flow.as_deref().ok_or_else(|| {
                    EngineError::FlowConfig(format!(
                        "goto_flow action on step {} names no flow",
                        step.id
                    ))
                })?;
                let next_flow = self.catalog.resolve(&session.integration, target)?;
                let initial = next_flow.initial_step().ok_or_else(|| {
                    EngineError::FlowConfig(format!(
                        "Flow {} has no unconditional first step",
                        next_flow.id
                    ))
                })?;
                let seed = payload.as_ref().and_then(|p| p.as_object()).cloned();
                session.restart(next_flow.id.clone(), initial.id.clone(), seed)?;
                self.enter_current(session, next_flow, 0).await
            }
            ActionKind::ResetFlow => {
                let next_flow = match declared.flow.as_deref() {
                    Some(target) => self.catalog.resolve(&session.integration, target)?,
                    None => flow,
                };
                let initial = next_flow.initial_step().ok_or_else(|| {
                    EngineError::FlowConfig(format!(
                        "Flow {} has no unconditional first step",
                        next_flow.id
                    ))
                })?;
                session.restart(next_flow.id.clone(), initial.id.clone(), None)?;
                self.enter_current(session, next_flow, 0).await
            }
            ActionKind::RerunStep => {
                let target = payload
                    .as_ref()
                    .and_then(|p| p.as_str())
                    .ok_or_else(|| {
                        EngineError::FlowConfig(format!(
                            "rerun_step action on step {} names no step",
                            step.id
                        ))
                    })?;
                session.truncate_to(&StepId(target.to_string()))?;
                self.enter_current(session, flow, 0).await
            }
            ActionKind::OpenUrl | ActionKind::Custom(_) => {
                let mut forwarded = declared.clone();
                forwarded.payload = payload;
                Ok(Advance::Forwarded(forwarded))
            }
        }
    }

    /// Default linear advance with bounded auto-advance
    async fn advance(
        &self,
        session: &mut Session,
        flow: &FlowDefinition,
        hops_so_far: u32,
    ) -> Result<Advance, EngineError> {
        let mut hops = hops_so_far;
        loop {
            let answers = session.flattened_answers();
            let Some(next) = flow.next_satisfiable(&session.current_step, &answers) else {
                // Last satisfiable step; wait for an explicit submit
                return Ok(Advance::AwaitInput);
            };

            hops += 1;
            if hops > self.config.max_auto_advance {
                warn!(session = %session.id, step = %next.id, "auto-advance bound exceeded");
                return Err(EngineError::FlowLoop {
                    step: next.id.0.clone(),
                    limit: self.config.max_auto_advance,
                });
            }

            let next = next.clone();
            session.advance_to(next.id.clone())?;
            debug!(session = %session.id, step = %next.id, "entered step");

            match self.on_entry(session, flow, &next).await? {
                Some(progress) => return Ok(progress),
                None if next.auto_advance && next.kind.advances_without_input() => continue,
                None => return Ok(Advance::AwaitInput),
            }
        }
    }

    /// Entry semantics for a freshly entered step during an advance chain
    async fn on_entry(
        &self,
        session: &mut Session,
        flow: &FlowDefinition,
        step: &FlowStep,
    ) -> Result<Option<Advance>, EngineError> {
        if !step.auto_advance {
            return Ok(None);
        }
        match step.kind {
            StepKind::Tool => {
                self.run_tool_step(session, flow, step).await?;
                Ok(None)
            }
            StepKind::Discovery => {
                self.run_discovery_step(session, step).await?;
                Ok(None)
            }
            StepKind::Instance => Ok(Some(self.complete(session).await?)),
            _ => Ok(None),
        }
    }

    /// Re-apply entry semantics after a restart/truncate positioned the
    /// session on a step without the usual advance bookkeeping
    async fn enter_current(
        &self,
        session: &mut Session,
        flow: &FlowDefinition,
        hops: u32,
    ) -> Result<Advance, EngineError> {
        let step = flow
            .step(&session.current_step)
            .ok_or_else(|| {
                EngineError::FlowConfig(format!(
                    "Session {} is at unknown step {}",
                    session.id, session.current_step
                ))
            })?
            .clone();

        match self.on_entry(session, flow, &step).await? {
            Some(progress) => Ok(progress),
            None if step.auto_advance && step.kind.advances_without_input() => {
                self.advance(session, flow, hops).await
            }
            None => Ok(Advance::AwaitInput),
        }
    }

    /// Hand the accumulated answers off as an instance configuration
    async fn complete(&self, session: &mut Session) -> Result<Advance, EngineError> {
        let document = session.flattened_answers();
        let instance_id = self
            .instances
            .persist(&session.integration, &session.id, document)
            .await?;
        session.complete()?;
        info!(session = %session.id, instance = %instance_id, "session completed");
        Ok(Advance::Completed(instance_id))
    }

    /// Execute the step's tool and merge its payload under the step id
    async fn run_tool_step(
        &self,
        session: &mut Session,
        flow: &FlowDefinition,
        step: &FlowStep,
    ) -> Result<(), EngineError> {
        let tool_name = step.tool.as_ref().ok_or_else(|| {
            EngineError::FlowConfig(format!("Tool step {} names no tool", step.id))
        })?;
        let definition = flow.tools.get(tool_name).ok_or_else(|| {
            EngineError::FlowConfig(format!(
                "Step {} references unknown tool: {}",
                step.id, tool_name
            ))
        })?;

        let request = ToolRequest {
            integration: session.integration.clone(),
            session: session.id.clone(),
            step: step.id.clone(),
            tool_name: tool_name.clone(),
            definition: definition.clone(),
            input: json!({ "answers": session.flattened_answers() }),
        };

        let payload = self.tools.run(request).await?;
        let merged = match payload.as_object() {
            Some(map) => map.clone(),
            None => {
                let mut map = AnswerMap::new();
                map.insert("result".to_string(), payload.into_value());
                map
            }
        };
        session.merge_answers(&step.id, merged)
    }

    /// Poll the discovery channel, bounded by the request deadline
    async fn run_discovery_step(
        &self,
        session: &mut Session,
        step: &FlowStep,
    ) -> Result<(), EngineError> {
        let window = self.config.discovery_window();
        let items = tokio::time::timeout(
            self.config.request_deadline(),
            self.discovery.poll(&session.integration, window),
        )
        .await
        .map_err(|_| {
            EngineError::Io(format!(
                "Discovery poll for step {} exceeded the request deadline",
                step.id
            ))
        })??;

        debug!(session = %session.id, step = %step.id, count = items.len(), "discovery poll finished");
        let mut map = AnswerMap::new();
        map.insert("items".to_string(), Value::Array(items));
        session.merge_answers(&step.id, map)
    }

    /// Move secret form values into the vault so neither the persisted
    /// session nor the instance document ever carries them raw
    async fn divert_secrets(
        &self,
        session: &Session,
        schema: &FormSchema,
        coerced: &mut AnswerMap,
    ) -> Result<(), EngineError> {
        let secret_fields: Vec<String> = schema.secret_fields().map(str::to_string).collect();
        for name in secret_fields {
            let Some(Value::String(value)) = coerced.get(&name) else {
                continue;
            };
            if value.starts_with("secret://") {
                continue;
            }
            let reference = self
                .credentials
                .store(&session.integration, &name, value)
                .await?;
            coerced.insert(name, Value::String(reference));
        }
        Ok(())
    }

    fn current_flow(&self, session: &Session) -> Result<&FlowDefinition, EngineError> {
        self.catalog
            .get(&session.integration, &session.flow_id)
            .ok_or_else(|| EngineError::FlowReference {
                flow: session.flow_id.0.clone(),
            })
    }

    async fn persist(&self, session: &mut Session, expected: u64) -> Result<(), EngineError> {
        let version = self.sessions.save(session, expected).await?;
        session.version = version;
        Ok(())
    }

    async fn persist_best_effort(&self, session: &mut Session, expected: u64) {
        if let Err(err) = self.persist(session, expected).await {
            warn!(session = %session.id, %err, "failed to persist session after error");
        }
    }

    /// Assemble the outcome returned to the transport collaborator
    fn outcome(&self, session: Session, progress: Advance) -> Result<StepOutcome, EngineError> {
        match progress {
            Advance::Completed(instance_id) => Ok(StepOutcome {
                session,
                descriptor: None,
                forwarded: None,
                instance_id: Some(instance_id),
            }),
            Advance::Aborted => Ok(StepOutcome {
                session,
                descriptor: None,
                forwarded: None,
                instance_id: None,
            }),
            Advance::Forwarded(action) => {
                let descriptor = self.describe(&session, None)?;
                Ok(StepOutcome {
                    session,
                    descriptor: Some(descriptor),
                    forwarded: Some(action),
                    instance_id: None,
                })
            }
            Advance::Parked(url) => {
                let descriptor = self.describe(&session, Some(url))?;
                Ok(StepOutcome {
                    session,
                    descriptor: Some(descriptor),
                    forwarded: None,
                    instance_id: None,
                })
            }
            Advance::AwaitInput => {
                let descriptor = self.describe(&session, None)?;
                Ok(StepOutcome {
                    session,
                    descriptor: Some(descriptor),
                    forwarded: None,
                    instance_id: None,
                })
            }
        }
    }

    /// Build the rendering descriptor for the session's current step
    fn describe(
        &self,
        session: &Session,
        redirect_url: Option<String>,
    ) -> Result<StepDescriptor, EngineError> {
        let flow = self.current_flow(session)?;
        let step = flow.step(&session.current_step).ok_or_else(|| {
            EngineError::FlowConfig(format!(
                "Session {} is at unknown step {}",
                session.id, session.current_step
            ))
        })?;

        // Previously discovered items ride along for select/discovery UIs;
        // a select step inherits them from the closest prior step
        let items = session
            .answers
            .get(&step.id)
            .and_then(|a| a.get("items"))
            .and_then(|v| v.as_array())
            .cloned()
            .or_else(|| {
                (step.kind == StepKind::Select)
                    .then(|| {
                        session
                            .history
                            .iter()
                            .rev()
                            .filter_map(|prior| session.answers.get(prior))
                            .find_map(|a| a.get("items").and_then(|v| v.as_array()).cloned())
                    })
                    .flatten()
            });

        // Echoed schemas never leak secret values through defaults
        let schema = step.schema.clone().map(|mut schema| {
            for field in &mut schema.fields {
                if field.secret {
                    field.default = None;
                }
            }
            schema
        });

        Ok(StepDescriptor {
            step_id: step.id.clone(),
            kind: step.kind,
            schema,
            actions: step.actions.clone(),
            errors: Vec::new(),
            items,
            redirect_url,
        })
    }

    /// Redacted view of a step's recorded answers, for echoes and logs
    pub fn redacted_answers(&self, session: &Session, step_id: &StepId) -> Option<AnswerMap> {
        let flow = self.current_flow(session).ok()?;
        let step = flow.step(step_id)?;
        let answers = session.answers.get(step_id)?;
        match &step.schema {
            Some(schema) => Some(redact(schema, answers)),
            None => Some(answers.clone()),
        }
    }
}
