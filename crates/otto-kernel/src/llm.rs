//! Language-model backend
//!
//! The planner, verifier, and reflector all treat the LLM as a text-in /
//! structured-JSON-out RPC. The trait is deliberately small; provider
//! plumbing (HTTP, auth, model selection) lives outside the kernel.

use async_trait::async_trait;
use thiserror::Error;

/// LLM RPC errors.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM request was interrupted")]
    Interrupted,

    #[error("LLM backend exhausted: {0}")]
    Exhausted(String),
}

pub type LlmResult<T> = Result<T, LlmError>;

/// One completion call.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// Standing instructions (rules block, role).
    pub system: String,
    /// The assembled task prompt.
    pub user: String,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Canonical language-model backend trait.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Backend name, for logging.
    fn name(&self) -> &str;

    /// Run one completion and return the raw text.
    async fn complete(&self, request: CompletionRequest) -> LlmResult<String>;
}

/// Extract the first balanced JSON object or array from raw LLM output.
///
/// Models wrap JSON in code fences or lead with prose; callers parse the
/// returned slice and apply their own retry policy when even this fails.
pub fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find(['{', '['])?;
    let bytes = raw.as_bytes();
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b if !in_string && b == open => depth += 1,
            b if !in_string && b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
