//! Step verifier
//!
//! Post-hoc check that a step's output matches its declared intent. Runs
//! fire-and-check: verification of a completed step overlaps the next
//! ready steps and is joined before finalization, so it never lengthens
//! the critical path. `warn` verdicts are recorded only; `fail` verdicts
//! reach the orchestrator and trigger the reflector.
//!
//! The email-composition check is deterministic and runs *before* the
//! terminal send: the composed message must carry everything the planner
//! committed to attaching or linking, and the executor may merge the
//! check's suggestions — additive fields only, never removals, never an
//! emptied attachments list.

use otto_kernel::llm::{CompletionRequest, LanguageModel, extract_json};
use otto_kernel::plan::{FileRef, Step, StepResult};
use otto_kernel::trace::CommitmentTag;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::warn;

const VERIFIER_RULES: &str = r#"You check whether a tool step produced what it was supposed to.
Reply with a JSON object only: {"verdict": "ok" | "warn" | "fail", "issues": ["<specific problem>"], "suggested_parameters": {"<param>": <value>}}
Use "fail" only when the output clearly does not satisfy the step's stated intent. Omit suggested_parameters unless a concrete additive fix exists."#;

/// Verifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Ok,
    Warn,
    Fail,
}

/// Result of verifying one step.
#[derive(Debug, Clone, Deserialize)]
pub struct Verification {
    pub verdict: Verdict,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggested_parameters: Option<Map<String, Value>>,
}

impl Verification {
    pub fn ok() -> Self {
        Self {
            verdict: Verdict::Ok,
            issues: Vec::new(),
            suggested_parameters: None,
        }
    }

    fn warn_only(issue: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Warn,
            issues: vec![issue.into()],
            suggested_parameters: None,
        }
    }
}

/// LLM-backed post-hoc verifier.
pub struct StepVerifier {
    model: Arc<dyn LanguageModel>,
}

impl StepVerifier {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Verify one completed step against its declared intent.
    ///
    /// Verification must not take the pipeline down: transport or parse
    /// failures degrade to a recorded `warn`.
    pub async fn verify(&self, step: &Step, result: &StepResult, request: &str) -> Verification {
        let result_json = serde_json::to_string(&result.value).unwrap_or_default();
        let user = format!(
            "User request: {request}\nStep action: {}\nExpected output: {}\nActual result (status {}): {result_json}",
            step.action, step.expected_output, result.status,
        );
        let raw = match self
            .model
            .complete(CompletionRequest::new(VERIFIER_RULES, user))
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(step_id = step.id, error = %e, "verifier call failed; recording warn");
                return Verification::warn_only(format!("verifier unavailable: {e}"));
            }
        };
        match extract_json(&raw).and_then(|json| serde_json::from_str::<Verification>(json).ok()) {
            Some(verification) => verification,
            None => {
                warn!(step_id = step.id, "verifier output unparseable; recording warn");
                Verification::warn_only("verifier output unparseable")
            }
        }
    }
}

/// Outcome of the deterministic pre-send email check.
#[derive(Debug, Clone, Default)]
pub struct EmailCheck {
    pub issues: Vec<String>,
    pub suggestions: Option<Map<String, Value>>,
}

/// Check a composed message against the trace's commitment list before the
/// send happens.
///
/// If documents were committed and the composed message attaches nothing,
/// the check suggests the attachment inventory accumulated so far.
pub fn check_email_composition(
    params: &Map<String, Value>,
    commitments: &[CommitmentTag],
    inventory: &[FileRef],
) -> EmailCheck {
    let mut check = EmailCheck::default();
    if !commitments.contains(&CommitmentTag::AttachDocuments) {
        return check;
    }

    let attachments_empty = match params.get("attachments") {
        Some(Value::Array(list)) => list.is_empty(),
        Some(_) => false,
        None => true,
    };
    if !attachments_empty {
        return check;
    }

    check
        .issues
        .push("documents were committed but the composed message attaches nothing".to_string());
    if !inventory.is_empty() {
        let paths: Vec<Value> = inventory
            .iter()
            .map(|f| Value::String(f.path.display().to_string()))
            .collect();
        let mut suggestions = Map::new();
        suggestions.insert("attachments".to_string(), Value::Array(paths));
        check.suggestions = Some(suggestions);
    }
    check
}

/// Merge suggested parameters into a resolved parameter map, additively.
///
/// `attachments` gains entries it does not already have; `body` only grows
/// (a suggested body lands as an appendix below the existing one); any
/// other suggested key is taken only when absent. Nothing is ever removed
/// or replaced, and attachments can only grow.
pub fn merge_additive(params: &mut Map<String, Value>, suggestions: &Map<String, Value>) {
    for (key, suggested) in suggestions {
        match (key.as_str(), params.get_mut(key)) {
            ("attachments", Some(Value::Array(existing))) => {
                if let Value::Array(new_items) = suggested {
                    for item in new_items {
                        if !existing.contains(item) {
                            existing.push(item.clone());
                        }
                    }
                }
            }
            ("body", Some(Value::String(existing))) => {
                if let Value::String(appendix) = suggested {
                    if !existing.contains(appendix.as_str()) {
                        existing.push_str("\n\n");
                        existing.push_str(appendix);
                    }
                }
            }
            (_, Some(_)) => {
                // Present and not an additive field: leave it alone.
            }
            (_, None) => {
                params.insert(key.clone(), suggested.clone());
            }
        }
    }
}
