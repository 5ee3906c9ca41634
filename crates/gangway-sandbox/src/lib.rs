//!
//! Gangway Sandbox - out-of-process execution of integration tools
//!
//! Implements the engine's [`ToolRunner`] seam as a supervised subprocess:
//! the tool receives its request document on stdin and must print a single
//! structured envelope as its final stdout line; everything else it emits
//! is diagnostic only. The declared network policy is applied at the
//! namespace boundary, secrets enter through the environment alone, and
//! the child is forcibly terminated at its timeout.

use async_trait::async_trait;
use gangway_core::{
    CredentialResolver, EngineError, NetworkPolicy, Payload, ToolRequest, ToolRunner,
};
use serde::Deserialize;
use serde_json::Value;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Network-policy enforcement (namespace setup between fork and exec)
pub mod policy;

/// Orphan reaping for engine restarts
pub mod reaper;

pub use reaper::{reap_orphans, SANDBOX_MARKER};

fn default_max_timeout() -> u64 {
    300
}

/// The single structured result a tool reports on its final stdout line
#[derive(Debug, Deserialize)]
struct ToolEnvelope {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ToolFault>,
}

/// Typed error half of the envelope
#[derive(Debug, Default, Deserialize)]
struct ToolFault {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Subprocess-based [`ToolRunner`]
pub struct SubprocessRunner {
    credentials: Arc<dyn CredentialResolver>,
    max_timeout_secs: u64,
}

impl SubprocessRunner {
    /// Create a runner resolving secrets through the given vault
    pub fn new(credentials: Arc<dyn CredentialResolver>) -> Self {
        Self {
            credentials,
            max_timeout_secs: default_max_timeout(),
        }
    }

    /// Override the upper clamp applied to tool-declared timeouts
    pub fn with_max_timeout(mut self, seconds: u64) -> Self {
        self.max_timeout_secs = seconds;
        self
    }
}

#[async_trait]
impl ToolRunner for SubprocessRunner {
    async fn run(&self, request: ToolRequest) -> Result<Payload, EngineError> {
        let tool = request.tool_name.clone();
        let definition = &request.definition;

        let argv = split_entry(&definition.entry).map_err(|message| {
            EngineError::ToolExecution {
                tool: tool.clone(),
                message,
            }
        })?;

        // Secrets are injected as environment variables only; they never
        // appear in the argument list
        let mut secret_envs = Vec::with_capacity(definition.secrets.len());
        let mut secret_values = Vec::with_capacity(definition.secrets.len());
        for slot in &definition.secrets {
            let value = self
                .credentials
                .resolve(&request.integration, slot)
                .await?
                .ok_or_else(|| EngineError::Credential(slot.clone()))?;
            secret_envs.push((secret_env_name(slot), value.clone()));
            secret_values.push(value);
        }

        let net = definition.network;
        let mut command = std::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(&definition.environment)
            .env(SANDBOX_MARKER, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so a timeout can sweep grandchildren too
            .process_group(0);
        for (name, value) in &secret_envs {
            command.env(name, value);
        }
        if policy::requires_isolation(net) {
            // SAFETY: the hook runs post-fork/pre-exec and only issues raw
            // namespace syscalls
            unsafe {
                command.pre_exec(move || policy::isolate(net));
            }
        }

        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| spawn_error(&tool, net, err))?;
        let pid = child.id();

        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(&request.input)?;
            // Tools are free to ignore their input; a closed pipe is fine
            if let Err(err) = stdin.write_all(&body).await {
                debug!(%tool, %err, "tool closed stdin before reading its input");
            }
        }

        let timeout = Duration::from_secs(
            definition
                .timeout_secs
                .min(self.max_timeout_secs)
                .max(1),
        );
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(waited) => waited.map_err(|err| EngineError::Io(err.to_string()))?,
            Err(_) => {
                // The dropped child gets SIGKILL via kill_on_drop; sweep
                // the rest of its process group as well
                if let Some(pid) = pid {
                    unsafe {
                        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
                    }
                }
                warn!(%tool, seconds = timeout.as_secs(), "tool terminated at timeout");
                return Err(EngineError::ToolTimeout {
                    tool,
                    seconds: timeout.as_secs(),
                });
            }
        };

        let stderr = scrub_text(&String::from_utf8_lossy(&output.stderr), &secret_values);
        if !stderr.trim().is_empty() {
            debug!(%tool, diagnostics = %stderr.trim(), "tool stderr");
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let envelope = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str::<ToolEnvelope>(line).ok());

        match envelope {
            Some(envelope) if envelope.ok => {
                if !output.status.success() {
                    return Err(EngineError::ToolExecution {
                        tool,
                        message: format!(
                            "claimed success but exited with {}",
                            describe_status(&output.status)
                        ),
                    });
                }
                let mut value = envelope.result.unwrap_or(Value::Null);
                scrub_value(&mut value, &secret_values);
                Ok(Payload::new(value))
            }
            Some(envelope) => {
                let fault = envelope.error.unwrap_or_default();
                let message = scrub_text(&fault.message, &secret_values);
                if matches!(fault.kind.as_str(), "egress_denied" | "network_policy") {
                    Err(EngineError::SandboxPolicy { tool, message })
                } else {
                    let message = if message.is_empty() {
                        fault.kind
                    } else {
                        message
                    };
                    Err(EngineError::ToolExecution { tool, message })
                }
            }
            None => Err(EngineError::ToolExecution {
                tool,
                message: format!(
                    "{} with no structured result",
                    describe_status(&output.status)
                ),
            }),
        }
    }
}

fn spawn_error(tool: &str, net: NetworkPolicy, err: io::Error) -> EngineError {
    match err.kind() {
        io::ErrorKind::NotFound => EngineError::ToolExecution {
            tool: tool.to_string(),
            message: format!("entry not found: {}", err),
        },
        _ if policy::requires_isolation(net) => EngineError::SandboxPolicy {
            tool: tool.to_string(),
            message: format!("failed to enter sandbox namespace: {}", err),
        },
        _ => EngineError::ToolExecution {
            tool: tool.to_string(),
            message: err.to_string(),
        },
    }
}

fn describe_status(status: &std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {}", code),
        None => "termination by signal".to_string(),
    }
}

/// Environment variable name for a credential slot
fn secret_env_name(slot: &str) -> String {
    slot.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Split a tool entry into argv, honoring single/double quotes
fn split_entry(entry: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = entry.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => quote = Some(c),
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                }
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        words.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            },
        }
    }

    if quote.is_some() {
        return Err("unbalanced quote in tool entry".to_string());
    }
    if !current.is_empty() {
        words.push(current);
    }
    if words.is_empty() {
        return Err("empty tool entry".to_string());
    }
    Ok(words)
}

/// Replace secret values in free text with a mask
fn scrub_text(text: &str, secrets: &[String]) -> String {
    let mut scrubbed = text.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            scrubbed = scrubbed.replace(secret, "***");
        }
    }
    scrubbed
}

/// Replace secret values anywhere inside a JSON payload
fn scrub_value(value: &mut Value, secrets: &[String]) {
    match value {
        Value::String(s) => {
            if secrets.iter().any(|secret| s.contains(secret)) {
                *s = scrub_text(s, secrets);
            }
        }
        Value::Array(items) => {
            for item in items {
                scrub_value(item, secrets);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                scrub_value(item, secrets);
            }
        }
        _ => {}
    }
}
