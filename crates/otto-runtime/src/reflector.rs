//! Reflection / replanner
//!
//! Invoked on step failure, on a verifier `fail`, or on a post-finalization
//! commitment gap. Produces either a continuation (new steps appended after
//! the failure point, ids strictly above the existing maximum) or a full
//! replacement plan that must go back through validation. The orchestrator
//! owns the retry budget; this module never loops on its own.

use otto_kernel::llm::{CompletionRequest, LanguageModel, LlmError, extract_json};
use otto_kernel::plan::{Plan, Step, StepResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

const REFLECTOR_RULES: &str = r#"You repair a partially failed automation plan.
Reply with a JSON object in one of two shapes and nothing else:
{"mode": "continuation", "steps": [{"id": <above every existing id>, "action": "...", "parameters": {...}, "dependencies": [<existing or new ids>], "reasoning": "...", "expected_output": "..."}]}
{"mode": "replan", "plan": {"goal": "...", "steps": [...]}}

Prefer a continuation: keep what already succeeded and add only the steps
needed to finish the job. Use a full replan only when the original approach
is unsalvageable. Never reuse an existing step id in a continuation."#;

/// One failure fed to the reflector.
#[derive(Debug, Clone)]
pub struct FailureSummary {
    pub step_id: u64,
    pub action: String,
    pub message: String,
    /// Rate-limit hint from the failing tool, if any.
    pub retry_after_seconds: Option<u64>,
}

impl FailureSummary {
    /// Collect failure summaries for the given step ids.
    pub fn collect(plan: &Plan, results: &HashMap<u64, StepResult>, failed: &[u64]) -> Vec<Self> {
        failed
            .iter()
            .filter_map(|id| {
                let step = plan.step(*id)?;
                let result = results.get(id);
                Some(Self {
                    step_id: *id,
                    action: step.action.clone(),
                    message: result
                        .and_then(|r| r.error_message.clone())
                        .unwrap_or_else(|| "step failed".to_string()),
                    retry_after_seconds: result.and_then(|r| r.retry_after()),
                })
            })
            .collect()
    }
}

/// What the reflector decided.
#[derive(Debug, Clone)]
pub enum Reflection {
    /// New steps appended after the failure point.
    Continuation(Vec<Step>),
    /// A brand-new plan superseding the old one; re-validate it.
    Replan(Plan),
}

/// Reflector failure modes.
#[derive(Debug, Error)]
pub enum ReflectorError {
    #[error("reflector output unparseable: {0}")]
    Unparseable(String),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum RawReflection {
    Continuation {
        steps: Vec<Step>,
    },
    Replan {
        plan: RawPlan,
    },
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    goal: String,
    steps: Vec<Step>,
}

/// Produces a corrected plan or a short continuation after a failure.
pub struct Reflector {
    model: Arc<dyn LanguageModel>,
}

impl Reflector {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// One reflection round over the current plan and its failures.
    pub async fn reflect(
        &self,
        request: &str,
        plan: &Plan,
        failures: &[FailureSummary],
        verifier_issues: &[String],
        corrections: &[String],
    ) -> Result<Reflection, ReflectorError> {
        let plan_json = serde_json::to_string(plan).unwrap_or_default();
        let mut user = format!(
            "User request: {request}\nCurrent plan: {plan_json}\nHighest existing step id: {}\n\nFailures:\n",
            plan.max_id()
        );
        for failure in failures {
            user.push_str(&format!(
                "- step {} ({}): {}",
                failure.step_id, failure.action, failure.message
            ));
            if let Some(seconds) = failure.retry_after_seconds {
                user.push_str(&format!(" (retry after {seconds}s)"));
            }
            user.push('\n');
        }
        if !verifier_issues.is_empty() {
            user.push_str("\nVerifier issues:\n");
            for issue in verifier_issues {
                user.push_str(&format!("- {issue}\n"));
            }
        }
        if !corrections.is_empty() {
            user.push_str("\nEarlier corrections:\n");
            for correction in corrections {
                user.push_str(&format!("- {correction}\n"));
            }
        }

        let raw = self
            .model
            .complete(CompletionRequest::new(REFLECTOR_RULES, user))
            .await?;
        let reflection = parse_reflection(&raw, plan.max_id())
            .map_err(ReflectorError::Unparseable)?;
        let mode = match &reflection {
            Reflection::Continuation(steps) => format!("continuation ({} steps)", steps.len()),
            Reflection::Replan(_) => "replan".to_string(),
        };
        debug!(%mode, "reflection produced");
        Ok(reflection)
    }
}

fn parse_reflection(raw: &str, max_existing_id: u64) -> Result<Reflection, String> {
    let json = extract_json(raw).ok_or_else(|| "no JSON object found in output".to_string())?;
    let parsed: RawReflection =
        serde_json::from_str(json).map_err(|e| format!("wrong reflection shape: {e}"))?;
    match parsed {
        RawReflection::Continuation { steps } => {
            if steps.is_empty() {
                return Err("continuation has no steps".to_string());
            }
            if let Some(step) = steps.iter().find(|s| s.id <= max_existing_id) {
                return Err(format!(
                    "continuation step id {} collides with the existing plan (max id {})",
                    step.id, max_existing_id
                ));
            }
            Ok(Reflection::Continuation(steps))
        }
        RawReflection::Replan { plan } => {
            if plan.steps.is_empty() {
                return Err("replacement plan has no steps".to_string());
            }
            Ok(Reflection::Replan(Plan::new(plan.goal, plan.steps)))
        }
    }
}
