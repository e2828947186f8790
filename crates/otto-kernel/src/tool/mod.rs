//! Tool dispatch surface
//!
//! Defines the invocation contract the executor dispatches against:
//! `invoke(params_map, context) → StepResult`. Concrete tool logic (email,
//! calendar, search, files) lives outside the kernel; each tool is a
//! black-box callable with a declared parameter/result schema and a set of
//! capability tags the validator and finalizer reason over.

pub mod registry;

pub use registry::{RegistryError, ToolRegistry};

use crate::plan::StepResult;
use crate::trace::CommitmentTag;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Reserved parameter name injected for memory-enabled tools.
pub const REASONING_CONTEXT_PARAM: &str = "_reasoning_context";

/// Capability tags declared by a tool descriptor.
///
/// These drive kernel behavior that must not depend on action-name string
/// matching: attachment auto-repair, writer-step warnings, verifiability,
/// and commitment fulfillment checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Writes a document/presentation and returns its path.
    ProducesFile,
    /// Sends something to the outside world (email, message).
    Delivers,
    /// Pulls data in from an external source (search, social, mail read).
    Fetches,
    /// Turns fetched material into prose (summaries, reports).
    Synthesizes,
    /// Starts media playback.
    PlaysMedia,
    /// Publishes to a social platform.
    PostsSocial,
    /// Creates calendar entries.
    Schedules,
}

/// Declared shape of a tool: name, schemas, and kernel-relevant flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique action name.
    pub name: String,
    /// One-line description for the planner catalog.
    pub description: String,
    /// JSON Schema of the parameter map.
    pub parameter_schema: Value,
    /// JSON Schema of the success value map.
    pub result_schema: Value,
    /// Whether the tool receives the reserved `_reasoning_context` param.
    #[serde(default)]
    pub memory_enabled: bool,
    /// Marks the reply action. Exactly one registered tool carries this.
    #[serde(default)]
    pub terminal: bool,
    /// Capability tags.
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Per-tool deadline in seconds; falls back to the executor default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema: Value::Object(Map::new()),
            result_schema: Value::Object(Map::new()),
            memory_enabled: false,
            terminal: false,
            capabilities: Vec::new(),
            timeout_secs: None,
        }
    }

    /// Builder: set the parameter JSON Schema.
    pub fn with_parameter_schema(mut self, schema: Value) -> Self {
        self.parameter_schema = schema;
        self
    }

    /// Builder: set the result JSON Schema.
    pub fn with_result_schema(mut self, schema: Value) -> Self {
        self.result_schema = schema;
        self
    }

    /// Builder: mark the tool memory-enabled.
    pub fn with_memory_enabled(mut self) -> Self {
        self.memory_enabled = true;
        self
    }

    /// Builder: mark the tool as the terminal reply action.
    pub fn with_terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// Builder: add a capability tag.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Builder: set a per-tool deadline.
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Deadline for an invocation, given the executor default.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(default)
    }

    /// Whether the step's output is verified post-hoc. Default rule: any
    /// tool producing a user-visible artifact or touching the outside
    /// world.
    pub fn verifiable(&self) -> bool {
        self.capabilities.iter().any(|c| {
            matches!(
                c,
                Capability::ProducesFile
                    | Capability::Delivers
                    | Capability::PlaysMedia
                    | Capability::PostsSocial
                    | Capability::Schedules
            )
        })
    }

    /// Names of array-typed properties in the declared result schema, in
    /// declaration order. The validator uses this to rewrite defective
    /// reply placeholders into a reference to a real list field.
    pub fn list_result_fields(&self) -> Vec<String> {
        let Some(props) = self
            .result_schema
            .get("properties")
            .and_then(|p| p.as_object())
        else {
            return Vec::new();
        };
        props
            .iter()
            .filter(|(_, schema)| schema.get("type").and_then(|t| t.as_str()) == Some("array"))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Advisory slice of the reasoning trace handed to memory-enabled tools.
///
/// Absence of the reserved parameter is always valid; tools must not
/// require it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningContext {
    pub past_attempts: u32,
    pub commitments: Vec<CommitmentTag>,
    pub trace_available: bool,
}

impl ReasoningContext {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Per-invocation context threaded into every tool call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub session_id: String,
    /// Shared cancellation signal for the interaction. Cooperative: tools
    /// that never check it run to completion and have their results
    /// dropped after DONE(cancelled).
    pub cancel: CancellationToken,
    /// Present only for memory-enabled tools.
    pub reasoning: Option<ReasoningContext>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            cancel,
            reasoning: None,
        }
    }

    pub fn with_reasoning(mut self, reasoning: ReasoningContext) -> Self {
        self.reasoning = Some(reasoning);
        self
    }
}

/// The invocation contract.
///
/// A tool must either return a result with `status = success` and a map
/// value, or `status = error` with one of the closed error kinds. Tools
/// never panic through the executor.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Declared shape of this tool.
    fn descriptor(&self) -> &ToolDescriptor;

    /// Execute with resolved parameters.
    async fn invoke(&self, params: Map<String, Value>, ctx: &ToolContext) -> StepResult;
}
