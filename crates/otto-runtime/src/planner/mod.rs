//! Planner
//!
//! Turns (user request, tool catalog, trace digest) into a [`Plan`] via a
//! single LLM call. The prompt is assembled from a core rules block (always
//! included), the registry's catalog view, a budget-capped set of
//! task-matched exemplars, and a digest of the current reasoning trace.
//! Malformed output is retried a bounded number of times with the parse
//! error appended, then surfaced as `planner_unparseable`.

pub mod exemplar;

pub use exemplar::{ExemplarIndex, TaskKind, classify};

use otto_kernel::config::PlannerSection;
use otto_kernel::llm::{CompletionRequest, LanguageModel, LlmError, extract_json};
use otto_kernel::plan::{Plan, Step};
use otto_kernel::trace::CommitmentTag;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Standing rules for the planning model. Always included, never budgeted.
const CORE_RULES: &str = r#"You are the planning component of a personal automation agent.
Produce a JSON object with this exact shape and nothing else:
{"goal": "<one line>", "commitments": ["send_email", ...], "steps": [{"id": 1, "action": "<tool name>", "parameters": {...}, "dependencies": [], "reasoning": "<why>", "expected_output": "<what this step should produce>"}]}

Rules:
- Step ids are unique positive integers. Dependencies list the ids that must succeed first.
- Use only tools from the catalog below. The final step must be the reply tool, and it must come last.
- To use a prior step's output, write $step<N>.<field> (for whole values) or {$step<N>.<field>} inside a longer string. Reference only steps in your dependencies.
- commitments may only contain: send_email, attach_documents, play_music, post_social, create_document, schedule_event.
- Do not invent file paths; take them from tool results."#;

/// Planner failure modes.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// Output never conformed within the retry budget. Carries the last
    /// parse error.
    #[error("planner output unparseable: {0}")]
    Unparseable(String),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// What one planning call produces.
#[derive(Debug, Clone)]
pub struct PlannerOutput {
    pub plan: Plan,
    /// LLM-proposed commitment candidates; the orchestrator unions these
    /// with the deterministic scan.
    pub commitments: Vec<CommitmentTag>,
}

#[derive(Debug, Deserialize)]
struct RawPlanResponse {
    goal: String,
    #[serde(default)]
    commitments: Vec<serde_json::Value>,
    steps: Vec<Step>,
}

/// Pure function over (request, catalog, trace digest) → plan.
pub struct Planner {
    model: Arc<dyn LanguageModel>,
    section: PlannerSection,
    exemplars: ExemplarIndex,
}

impl Planner {
    pub fn new(model: Arc<dyn LanguageModel>, section: PlannerSection) -> Self {
        Self {
            model,
            section,
            exemplars: ExemplarIndex::builtin(),
        }
    }

    pub fn with_exemplars(mut self, exemplars: ExemplarIndex) -> Self {
        self.exemplars = exemplars;
        self
    }

    /// Produce a plan, retrying bounded times on malformed output.
    pub async fn plan(
        &self,
        request: &str,
        catalog: &str,
        trace_digest: &str,
    ) -> Result<PlannerOutput, PlannerError> {
        let kind = classify(request);
        let exemplar_block = self
            .exemplars
            .render(kind, self.section.exemplar_token_budget);
        let base_prompt = assemble_prompt(request, catalog, &exemplar_block, trace_digest);

        let mut parse_feedback: Option<String> = None;
        let mut last_error = String::new();
        for attempt in 0..=self.section.max_parse_retries {
            let user = match &parse_feedback {
                Some(error) => format!(
                    "{base_prompt}\n\nYour previous output failed to parse: {error}\nReturn only the corrected JSON object."
                ),
                None => base_prompt.clone(),
            };
            let raw = self
                .model
                .complete(CompletionRequest::new(CORE_RULES, user))
                .await?;

            match parse_plan(&raw) {
                Ok(output) => {
                    debug!(attempt, steps = output.plan.steps.len(), "plan parsed");
                    return Ok(output);
                }
                Err(error) => {
                    warn!(attempt, %error, "planner output failed to parse");
                    last_error = error.clone();
                    parse_feedback = Some(error);
                }
            }
        }
        Err(PlannerError::Unparseable(last_error))
    }
}

fn assemble_prompt(request: &str, catalog: &str, exemplars: &str, trace_digest: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("Available tools:\n");
    prompt.push_str(catalog);
    if !exemplars.is_empty() {
        prompt.push_str("\nExamples:\n");
        prompt.push_str(exemplars);
    }
    if !trace_digest.is_empty() {
        prompt.push_str("\nSession memory:\n");
        prompt.push_str(trace_digest);
    }
    prompt.push_str("\nUser request: ");
    prompt.push_str(request);
    prompt
}

fn parse_plan(raw: &str) -> Result<PlannerOutput, String> {
    let json = extract_json(raw).ok_or_else(|| "no JSON object found in output".to_string())?;
    let response: RawPlanResponse =
        serde_json::from_str(json).map_err(|e| format!("wrong plan shape: {e}"))?;
    if response.steps.is_empty() {
        return Err("plan has no steps".to_string());
    }
    // Unknown commitment strings are dropped, not errors: the closed tag
    // set is enforced here, and the deterministic scan backstops recall.
    let commitments = response
        .commitments
        .iter()
        .filter_map(|v| serde_json::from_value::<CommitmentTag>(v.clone()).ok())
        .collect();
    Ok(PlannerOutput {
        plan: Plan::new(response.goal, response.steps),
        commitments,
    })
}
