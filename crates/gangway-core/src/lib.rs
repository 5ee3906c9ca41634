//!
//! Gangway Core - Setup-flow engine for the Gangway platform
//!
//! This crate defines the flow interpreter, domain models, and adapter
//! contracts for onboarding device-bridge integrations. Tool execution is
//! delegated through the [`ToolRunner`] seam so integration code never
//! runs inside the engine process.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;

/// Domain layer - core business models, entities, and rules
pub mod domain;

/// Application services - core application logic
pub mod application;

/// Core types
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

// Re-export key types
pub use application::flow_catalog::FlowCatalog;
pub use application::setup_flow_service::{
    SetupFlowService, StepDescriptor, StepOutcome, StepResponse,
};
pub use config::EngineConfig;
pub use domain::flow_definition::{
    ActionKind, FlowAction, FlowDefinition, FlowStep, NetworkPolicy, StepKind, ToolDefinition,
};
pub use domain::form::{coerce_submission, redact, FieldKind, FormField, FormSchema};
pub use domain::repository::{
    CredentialResolver, DiscoveryChannel, InstanceStore, OAuthGateway, SessionRepository,
};
pub use domain::session::{FlowId, Session, SessionId, SessionStatus, StepId};
pub use error::{EngineError, FieldError};
pub use types::{AnswerMap, Payload};

/// Everything a runner needs to execute one tool invocation
#[derive(Debug, Clone)]
pub struct ToolRequest {
    /// Integration owning the tool
    pub integration: String,

    /// Session on whose behalf the tool runs
    pub session: SessionId,

    /// Step that invoked the tool
    pub step: StepId,

    /// Key of the tool in the flow's tool table
    pub tool_name: String,

    /// The tool's declaration (entry, policy, secrets, environment)
    pub definition: ToolDefinition,

    /// Request document passed to the tool on stdin
    pub input: serde_json::Value,
}

/// Executes integration tools under sandbox policy
///
/// Implementations must enforce the declared network policy at the process
/// boundary, inject secrets through the environment only, terminate at the
/// declared timeout, and return only the tool's structured result. Tools
/// never touch the engine's persistence; the interpreter merges the
/// returned payload itself.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run one tool invocation to completion
    async fn run(&self, request: ToolRequest) -> Result<Payload, EngineError>;
}

/// Scripted runner for tests
#[cfg(feature = "testing")]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Outcome a [`ScriptedToolRunner`] serves for a tool
    pub type ScriptedResult = Result<serde_json::Value, EngineError>;

    /// Tool runner answering from a canned script, keyed by tool name
    pub struct ScriptedToolRunner {
        script: Mutex<HashMap<String, Vec<ScriptedResult>>>,
        invocations: Mutex<Vec<String>>,
    }

    impl ScriptedToolRunner {
        /// Create an empty runner; unknown tools fail with `ToolExecution`
        pub fn new() -> Self {
            Self {
                script: Mutex::new(HashMap::new()),
                invocations: Mutex::new(Vec::new()),
            }
        }

        /// Queue an outcome for the named tool (served in FIFO order; the
        /// last outcome repeats)
        pub fn enqueue(&self, tool: &str, result: ScriptedResult) {
            self.script
                .lock()
                .expect("script lock")
                .entry(tool.to_string())
                .or_default()
                .push(result);
        }

        /// Names of tools invoked so far, in order
        pub fn invocations(&self) -> Vec<String> {
            self.invocations.lock().expect("invocations lock").clone()
        }
    }

    impl Default for ScriptedToolRunner {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ToolRunner for ScriptedToolRunner {
        async fn run(&self, request: ToolRequest) -> Result<Payload, EngineError> {
            self.invocations
                .lock()
                .expect("invocations lock")
                .push(request.tool_name.clone());

            let mut script = self.script.lock().expect("script lock");
            let Some(queue) = script.get_mut(&request.tool_name) else {
                return Err(EngineError::ToolExecution {
                    tool: request.tool_name,
                    message: "no scripted outcome".to_string(),
                });
            };
            let result = if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue.first().cloned().ok_or_else(|| {
                    EngineError::ToolExecution {
                        tool: request.tool_name.clone(),
                        message: "no scripted outcome".to_string(),
                    }
                })?
            };
            result.map(Payload::new)
        }
    }
}
