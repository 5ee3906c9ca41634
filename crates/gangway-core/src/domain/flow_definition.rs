use crate::domain::form::FormSchema;
use crate::domain::session::{FlowId, StepId};
use crate::error::EngineError;
use crate::types::AnswerMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Step type, a closed variant set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Collects answers through a form schema
    Form,
    /// Runs a sandboxed integration tool
    Tool,
    /// Lets the user pick from previously discovered or listed items
    Select,
    /// Read-only recap of the accumulated configuration
    Summary,
    /// Polls the discovery channel for candidate devices
    Discovery,
    /// Informational text, usually auto-advancing
    Message,
    /// Persists the instance configuration and completes the flow
    Instance,
    /// Produces an OAuth redirect and waits for the callback
    Oauth,
}

impl StepKind {
    /// Whether a step of this kind can advance without client input
    pub fn advances_without_input(&self) -> bool {
        matches!(
            self,
            StepKind::Message
                | StepKind::Summary
                | StepKind::Tool
                | StepKind::Discovery
                | StepKind::Instance
        )
    }
}

/// Action type; unknown discriminants are preserved verbatim as `Custom`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    /// Leave this flow and start the named flow
    GotoFlow,
    /// Ask the renderer to open an external URL
    OpenUrl,
    /// Discard progress and restart at the initial step
    ResetFlow,
    /// Truncate history back to a named prior step
    RerunStep,
    /// Complete the flow from its last satisfiable step
    Submit,
    /// Abort without persisting partial instance data
    Close,
    /// Opaque; forwarded verbatim to the rendering collaborator
    Custom(String),
}

impl From<String> for ActionKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "goto_flow" => ActionKind::GotoFlow,
            "open_url" => ActionKind::OpenUrl,
            "reset_flow" => ActionKind::ResetFlow,
            "rerun_step" => ActionKind::RerunStep,
            "submit" => ActionKind::Submit,
            "close" => ActionKind::Close,
            _ => ActionKind::Custom(s),
        }
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::GotoFlow => "goto_flow".to_string(),
            ActionKind::OpenUrl => "open_url".to_string(),
            ActionKind::ResetFlow => "reset_flow".to_string(),
            ActionKind::RerunStep => "rerun_step".to_string(),
            ActionKind::Submit => "submit".to_string(),
            ActionKind::Close => "close".to_string(),
            ActionKind::Custom(s) => s,
        }
    }
}

/// A caller- or author-declared directive altering step progression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowAction {
    /// Action type
    #[serde(rename = "type")]
    pub kind: ActionKind,

    /// Target flow for goto/reset actions
    #[serde(default)]
    pub flow: Option<String>,

    /// Opaque action payload; for `rerun_step` this names the target step
    #[serde(default)]
    pub payload: Option<serde_json::Value>,

    /// Prompt that must be acknowledged before the action executes
    #[serde(default)]
    pub confirm: Option<String>,
}

impl FlowAction {
    /// Build a bare action of the given kind
    pub fn of(kind: ActionKind) -> Self {
        Self {
            kind,
            flow: None,
            payload: None,
            confirm: None,
        }
    }
}

/// Egress policy enforced on a tool subprocess
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPolicy {
    /// No network reachable at all
    #[default]
    None,
    /// Loopback only
    Local,
    /// Unrestricted egress
    Internet,
}

fn default_tool_timeout() -> u64 {
    30
}

/// An integration-supplied executable invoked under sandbox policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Executable plus arguments, shell-word split by the sandbox
    pub entry: String,

    /// Forcible termination bound in seconds
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,

    /// Egress policy
    #[serde(default)]
    pub network: NetworkPolicy,

    /// Credential slots injected into the subprocess environment only
    #[serde(default)]
    pub secrets: Vec<String>,

    /// Static environment for the subprocess
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// A single step of a setup flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    /// Step id, unique within the flow
    pub id: StepId,

    /// Step type
    #[serde(rename = "type")]
    pub kind: StepKind,

    /// Form schema, meaningful for `form` steps
    #[serde(default)]
    pub schema: Option<FormSchema>,

    /// Key into the flow's tool table, for `tool` steps
    #[serde(default)]
    pub tool: Option<String>,

    /// Prior-answer key to required value; step is skipped when unmet
    #[serde(default)]
    pub conditions: HashMap<String, serde_json::Value>,

    /// Step may be skipped by the user
    #[serde(default)]
    pub optional: bool,

    /// Step completes and advances without explicit submission
    #[serde(default)]
    pub auto_advance: bool,

    /// Actions available at this step
    #[serde(default)]
    pub actions: Vec<FlowAction>,
}

impl FlowStep {
    /// Whether this step's conditions hold against the accumulated answers
    pub fn conditions_met(&self, answers: &AnswerMap) -> bool {
        self.conditions
            .iter()
            .all(|(key, expected)| answers.get(key) == Some(expected))
    }

    /// Look up a declared action by kind
    pub fn action(&self, kind: &ActionKind) -> Option<&FlowAction> {
        self.actions.iter().find(|a| &a.kind == kind)
    }
}

/// A parsed and validated setup-flow definition
///
/// Immutable once registered with the catalog; owned by the integration's
/// static manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// ID of the flow
    pub id: FlowId,

    /// Flows or instances that must already exist before this flow starts
    #[serde(default)]
    pub prerequisites: Vec<String>,

    /// The steps of this flow, in declaration order
    pub steps: Vec<FlowStep>,

    /// The flow's tool table
    #[serde(default)]
    pub tools: HashMap<String, ToolDefinition>,

    /// At most one default flow per integration
    #[serde(default)]
    pub default: bool,
}

impl FlowDefinition {
    /// Validate the flow definition at load time
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::FlowConfig(format!(
                "Flow {} must have at least one step",
                self.id
            )));
        }

        let mut step_ids = std::collections::HashSet::new();
        for step in &self.steps {
            if !step_ids.insert(step.id.0.as_str()) {
                return Err(EngineError::FlowConfig(format!(
                    "Duplicate step ID: {}",
                    step.id
                )));
            }

            if let Some(schema) = &step.schema {
                schema.validate()?;
            }

            match (&step.kind, &step.tool) {
                (StepKind::Tool, None) => {
                    return Err(EngineError::FlowConfig(format!(
                        "Tool step {} names no tool",
                        step.id
                    )));
                }
                (StepKind::Tool, Some(tool)) if !self.tools.contains_key(tool) => {
                    return Err(EngineError::FlowConfig(format!(
                        "Step {} references unknown tool: {}",
                        step.id, tool
                    )));
                }
                _ => {}
            }

            for action in &step.actions {
                if action.kind == ActionKind::GotoFlow && action.flow.is_none() {
                    return Err(EngineError::FlowConfig(format!(
                        "goto_flow action on step {} names no flow",
                        step.id
                    )));
                }
            }
        }

        // A flow must be startable against an empty answer set
        if self.initial_step().is_none() {
            return Err(EngineError::FlowConfig(format!(
                "Flow {} has no unconditional first step",
                self.id
            )));
        }

        Ok(())
    }

    /// The initial state: first step satisfiable against the empty answers
    pub fn initial_step(&self) -> Option<&FlowStep> {
        let empty = AnswerMap::new();
        self.steps.iter().find(|s| s.conditions_met(&empty))
    }

    /// Look up a step by id
    pub fn step(&self, id: &StepId) -> Option<&FlowStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Position of a step in declaration order
    pub fn step_index(&self, id: &StepId) -> Option<usize> {
        self.steps.iter().position(|s| &s.id == id)
    }

    /// First step after `current` whose conditions hold, in declaration
    /// order; declaration order is the authoritative tie-break
    pub fn next_satisfiable(&self, current: &StepId, answers: &AnswerMap) -> Option<&FlowStep> {
        let index = self.step_index(current)?;
        self.steps[index + 1..]
            .iter()
            .find(|s| s.conditions_met(answers))
    }
}
