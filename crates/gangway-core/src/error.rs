use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Name of the offending field
    pub field: String,

    /// What went wrong, suitable for rendering to the user
    pub message: String,
}

impl FieldError {
    /// Create a new field error
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Core error type for the Gangway engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Flow definition rejected at load time
    #[error("Flow configuration error: {0}")]
    FlowConfig(String),

    /// A goto/reset action named a flow that is not loaded
    #[error("Unknown flow referenced: {flow}")]
    FlowReference {
        /// The dangling flow id
        flow: String,
    },

    /// Submitted answers failed schema validation; no state was mutated
    #[error("Field validation failed for step {step}")]
    FieldValidation {
        /// Step whose schema rejected the submission
        step: String,
        /// Per-field failures, in field declaration order
        errors: Vec<FieldError>,
    },

    /// The response targets a step that is not the session's current step
    #[error("Response targets step {got} but session is at {expected}")]
    StaleStep {
        /// The session's current step
        expected: String,
        /// The step the caller submitted for
        got: String,
    },

    /// A concurrent request won the version race; caller must re-read
    #[error("Session modified concurrently: {0}")]
    ConcurrentModification(String),

    /// Auto-advance exceeded the configured bound; the session is aborted
    #[error("Auto-advance loop detected at step {step} (limit {limit})")]
    FlowLoop {
        /// Step at which the bound was exceeded
        step: String,
        /// The configured consecutive-advance limit
        limit: u32,
    },

    /// A tool violated its sandbox policy
    #[error("Sandbox policy violation in tool {tool}: {message}")]
    SandboxPolicy {
        /// Tool that violated the policy
        tool: String,
        /// Violation detail
        message: String,
    },

    /// A tool was forcibly terminated at its timeout
    #[error("Tool {tool} timed out after {seconds}s")]
    ToolTimeout {
        /// Tool that was terminated
        tool: String,
        /// The enforced timeout in seconds
        seconds: u64,
    },

    /// A tool exited abnormally or produced no structured result
    #[error("Tool {tool} failed: {message}")]
    ToolExecution {
        /// Tool that failed
        tool: String,
        /// Failure detail (exit status or envelope error)
        message: String,
    },

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session has passed its expiry and can no longer be driven
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Session already reached a terminal state
    #[error("Session is closed: {0}")]
    SessionClosed(String),

    /// An action carrying a confirm prompt was dispatched unconfirmed
    #[error("Action requires confirmation: {0}")]
    ConfirmationRequired(String),

    /// A named credential slot could not be resolved
    #[error("Credential slot not found: {0}")]
    Credential(String),

    /// State store error
    #[error("State store error: {0}")]
    StateStore(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    Io(String),
}

impl EngineError {
    /// Shorthand for a field-validation error over a single field
    pub fn invalid_field(
        step: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        EngineError::FieldValidation {
            step: step.into(),
            errors: vec![FieldError::new(field, message)],
        }
    }

    /// Whether the caller can retry after re-reading the session
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::FieldValidation { .. }
                | EngineError::StaleStep { .. }
                | EngineError::ConcurrentModification(_)
                | EngineError::ConfirmationRequired(_)
                | EngineError::ToolTimeout { .. }
                | EngineError::ToolExecution { .. }
                | EngineError::SandboxPolicy { .. }
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}
