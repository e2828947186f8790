//! Step executor
//!
//! Schedules a validated plan over a dependency DAG. Steps whose
//! dependencies have all succeeded become ready; ready steps run
//! concurrently up to a configurable bound. A single dispatcher loop is
//! the sole mutator of the step-results map — parameter resolution happens
//! in the dispatcher before a worker is spawned, workers report back over
//! an mpsc mailbox, and dependents unblock only after the dispatcher has
//! published the result. Within a step: resolution → invocation → result
//! write → dependents ready, strictly in that order. Across independent
//! steps nothing is promised.
//!
//! Verification is fire-and-check: it overlaps later steps and is joined
//! before this function returns, so the critical path never waits on it.

use crate::verifier::{StepVerifier, Verification, check_email_composition, merge_additive};
use otto_kernel::error::ErrorKind;
use otto_kernel::event::{AgentEvent, EventSender};
use otto_kernel::plan::{Plan, Step, StepResult, StepStatus};
use otto_kernel::resolver;
use otto_kernel::session::SessionHandle;
use otto_kernel::tool::{
    Capability, REASONING_CONTEXT_PARAM, ReasoningContext, Tool, ToolContext, ToolRegistry,
};
use otto_kernel::trace::{EntryDraft, EntryUpdate, Outcome, Stage};
use otto_kernel::config::ExecutorSection;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Aggregate status of one execution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Per-step record kept for the finalizer and the interaction log.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub step_id: u64,
    pub action: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    /// Parameters as the tool actually saw them, post-resolution and
    /// post-merge.
    pub resolved_parameters: Map<String, Value>,
}

/// What one call to [`StepExecutor::execute`] produced.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub status: ExecutionStatus,
    pub steps: Vec<StepExecution>,
}

/// A joined verification result.
#[derive(Debug, Clone)]
pub struct VerifiedStep {
    pub step_id: u64,
    pub verification: Verification,
}

/// Everything the orchestrator needs after a run.
pub struct ExecutionOutcome {
    /// Step id → published result, including seeded prior results.
    pub results: HashMap<u64, StepResult>,
    pub record: ExecutionRecord,
    pub verifications: Vec<VerifiedStep>,
    /// Steps that failed *in this run* (seeded failures excluded).
    pub failed_steps: Vec<u64>,
    pub cancelled: bool,
}

struct WorkerReport {
    step_id: u64,
    result: StepResult,
    duration_ms: u64,
}

/// Dependency-aware scheduler with cancellation and streaming capture.
pub struct StepExecutor {
    registry: Arc<ToolRegistry>,
    section: ExecutorSection,
    verifier: Option<Arc<StepVerifier>>,
}

impl StepExecutor {
    pub fn new(registry: Arc<ToolRegistry>, section: ExecutorSection) -> Self {
        Self {
            registry,
            section,
            verifier: None,
        }
    }

    /// Attach the fire-and-check verifier.
    pub fn with_verifier(mut self, verifier: Arc<StepVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Run the plan to quiescence: no step ready and none pending.
    ///
    /// `prior` seeds results from an earlier run of the same interaction
    /// (continuation plans); seeded steps are not re-executed and do not
    /// appear in this run's record.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        plan: &Plan,
        prior: HashMap<u64, StepResult>,
        session: Arc<SessionHandle>,
        interaction_id: Uuid,
        request: &str,
        events: &EventSender,
        cancel: &CancellationToken,
        trace_enabled: bool,
    ) -> ExecutionOutcome {
        let mut results = prior;
        let mut done: HashSet<u64> = results.keys().copied().collect();
        let mut waiting: Vec<u64> = plan
            .steps
            .iter()
            .map(|s| s.id)
            .filter(|id| !done.contains(id))
            .collect();
        let mut running: HashSet<u64> = HashSet::new();
        let mut resolved_params: HashMap<u64, Map<String, Value>> = HashMap::new();

        let (report_tx, mut report_rx) = mpsc::channel::<WorkerReport>(plan.steps.len().max(1));
        let semaphore = Arc::new(Semaphore::new(self.section.max_parallel_steps.max(1)));

        let mut record_steps: Vec<StepExecution> = Vec::new();
        let mut failed_steps: Vec<u64> = Vec::new();
        let mut verify_tasks: Vec<JoinHandle<VerifiedStep>> = Vec::new();
        let mut was_cancelled = false;

        loop {
            if cancel.is_cancelled() || was_cancelled {
                was_cancelled = true;
                // Steps that have not started are cancelled outright;
                // running steps are asked to stop through the shared token.
                for id in std::mem::take(&mut waiting) {
                    let result = StepResult::cancelled();
                    self.publish(
                        plan, id, result, 0, &session, interaction_id, events,
                        &mut results, &mut done, &mut record_steps, &resolved_params,
                    )
                    .await;
                }
            }

            if !was_cancelled {
                let ready: Vec<u64> = waiting
                    .iter()
                    .copied()
                    .filter(|id| {
                        plan.step(*id)
                            .map(|s| {
                                s.dependencies.iter().all(|dep| {
                                    results.get(dep).map(|r| r.is_success()).unwrap_or(false)
                                })
                            })
                            .unwrap_or(false)
                    })
                    .collect();

                for id in ready {
                    waiting.retain(|w| *w != id);
                    let step = plan.step(id).expect("ready id comes from the plan");
                    match self.launch_step(
                        step,
                        &results,
                        &session,
                        interaction_id,
                        request,
                        events,
                        cancel,
                        trace_enabled,
                        &semaphore,
                        &report_tx,
                    ) {
                        Ok(resolved) => {
                            resolved_params.insert(id, resolved);
                            running.insert(id);
                        }
                        Err(result) => {
                            // Failed before invocation (unknown tool or
                            // unresolved reference); publish directly.
                            resolved_params.insert(id, step.parameters.clone());
                            self.publish(
                                plan, id, result, 0, &session, interaction_id, events,
                                &mut results, &mut done, &mut record_steps, &resolved_params,
                            )
                            .await;
                            failed_steps.push(id);
                            self.skip_dependents(
                                plan, id, &mut waiting, &session, interaction_id, events,
                                &mut results, &mut done, &mut record_steps, &resolved_params,
                            )
                            .await;
                        }
                    }
                }
            }

            if running.is_empty() {
                if waiting.is_empty() || was_cancelled {
                    break;
                }
                // Nothing running and nothing ready: the remainder is
                // blocked behind non-success results.
                for id in std::mem::take(&mut waiting) {
                    let result = StepResult::skipped("upstream dependency did not succeed");
                    self.publish(
                        plan, id, result, 0, &session, interaction_id, events,
                        &mut results, &mut done, &mut record_steps, &resolved_params,
                    )
                    .await;
                }
                break;
            }

            let report = tokio::select! {
                report = report_rx.recv() => report,
                _ = cancel.cancelled(), if !was_cancelled => continue,
            };
            let Some(report) = report else { break };

            running.remove(&report.step_id);
            let status = report.result.status;
            self.publish(
                plan, report.step_id, report.result.clone(), report.duration_ms,
                &session, interaction_id, events,
                &mut results, &mut done, &mut record_steps, &resolved_params,
            )
            .await;

            match status {
                StepStatus::Success => {
                    if let Some(verifier) = &self.verifier {
                        if let Some(step) = plan.step(report.step_id) {
                            let verifiable = self
                                .registry
                                .descriptor(&step.action)
                                .map(|d| d.verifiable())
                                .unwrap_or(false);
                            if verifiable {
                                verify_tasks.push(spawn_verification(
                                    verifier.clone(),
                                    step.clone(),
                                    report.result,
                                    request.to_string(),
                                ));
                            }
                        }
                    }
                }
                StepStatus::Error => {
                    failed_steps.push(report.step_id);
                    self.skip_dependents(
                        plan, report.step_id, &mut waiting, &session, interaction_id, events,
                        &mut results, &mut done, &mut record_steps, &resolved_params,
                    )
                    .await;
                }
                StepStatus::Cancelled => {
                    was_cancelled = true;
                }
                StepStatus::Skipped => {}
            }
        }

        // Join outstanding verifications before finalization can happen.
        let mut verifications = Vec::new();
        for task in verify_tasks {
            if let Ok(verified) = task.await {
                verifications.push(verified);
            }
        }

        let status = if was_cancelled {
            ExecutionStatus::Cancelled
        } else if !failed_steps.is_empty() {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };
        info!(?status, steps = record_steps.len(), "execution complete");
        events
            .emit(AgentEvent::Status {
                phase: "execution_complete".to_string(),
            })
            .await;

        ExecutionOutcome {
            results,
            record: ExecutionRecord {
                status,
                steps: record_steps,
            },
            verifications,
            failed_steps,
            cancelled: was_cancelled,
        }
    }

    /// Resolve parameters and spawn the worker for one ready step.
    ///
    /// Returns the resolved parameter map on success, or a ready-made
    /// failure result when the step cannot be invoked at all.
    #[allow(clippy::too_many_arguments)]
    fn launch_step(
        &self,
        step: &Step,
        results: &HashMap<u64, StepResult>,
        session: &Arc<SessionHandle>,
        interaction_id: Uuid,
        request: &str,
        events: &EventSender,
        cancel: &CancellationToken,
        trace_enabled: bool,
        semaphore: &Arc<Semaphore>,
        report_tx: &mpsc::Sender<WorkerReport>,
    ) -> Result<Map<String, Value>, StepResult> {
        let Some(tool) = self.registry.get(&step.action) else {
            return Err(StepResult::error(
                ErrorKind::ToolNotFound,
                format!("no tool registered for action '{}'", step.action),
            ));
        };
        let descriptor = tool.descriptor().clone();

        // Parameter resolution happens-before invocation, under the
        // dispatcher's supervision of the results map.
        let (mut resolved, report) = resolver::resolve_parameters(&step.parameters, results);
        if !report.warnings.is_empty() {
            return Err(StepResult::error(
                ErrorKind::ReferenceUnresolved,
                report.warnings.join("; "),
            ));
        }
        let mut evidence: Vec<String> = report
            .regressions
            .iter()
            .map(|r| format!("template regression: {r}"))
            .collect();

        let summary = session.trace_summary(interaction_id).unwrap_or_default();

        // Pre-send composition check for delivery tools: merge additive
        // suggestions, never remove anything.
        if descriptor.has_capability(Capability::Delivers) {
            let check = check_email_composition(
                &resolved,
                &summary.commitments,
                &summary.attachment_inventory,
            );
            if let Some(suggestions) = &check.suggestions {
                merge_additive(&mut resolved, suggestions);
                evidence.push("merged composition suggestions before send".to_string());
            }
            evidence.extend(check.issues);
        }

        let reasoning = descriptor.memory_enabled.then(|| ReasoningContext {
            past_attempts: summary.past_attempts,
            commitments: summary.commitments.clone(),
            trace_available: trace_enabled,
        });
        if let Some(context) = &reasoning {
            resolved.insert(REASONING_CONTEXT_PARAM.to_string(), context.to_value());
        }

        let entry_id = if trace_enabled {
            session
                .with_interaction(interaction_id, |i| {
                    i.trace.add(
                        EntryDraft::new(Stage::Execution, step.reasoning.clone())
                            .with_action(step.action.clone())
                            .with_parameters(resolved.clone())
                            .with_evidence(evidence.clone()),
                    )
                })
                .ok()
                .and_then(|r| r.ok())
        } else {
            None
        };

        let ctx = {
            let mut ctx = ToolContext::new(events_session_id(session), cancel.clone());
            if let Some(reasoning) = reasoning {
                ctx = ctx.with_reasoning(reasoning);
            }
            ctx
        };

        let step_id = step.id;
        let action = step.action.clone();
        let timeout = descriptor.timeout(Duration::from_secs(self.section.step_timeout_default));
        let session = session.clone();
        let events = events.clone();
        let semaphore = semaphore.clone();
        let report_tx = report_tx.clone();
        let cancel = cancel.clone();
        let params = resolved.clone();

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            events
                .emit(AgentEvent::StepStart {
                    step_id,
                    action: action.clone(),
                })
                .await;
            let started = Instant::now();

            let mut result = tokio::select! {
                invoked = tokio::time::timeout(timeout, tool.invoke(params, &ctx)) => {
                    match invoked {
                        Ok(result) => result,
                        Err(_) => StepResult::error(
                            ErrorKind::ToolTimeout,
                            format!("step deadline of {}s expired", timeout.as_secs()),
                        ),
                    }
                }
                _ = cancel.cancelled() => StepResult::cancelled(),
            };
            let duration_ms = started.elapsed().as_millis() as u64;
            let attachments = result.capture_attachments();

            if let Some(entry_id) = entry_id {
                let outcome = match result.status {
                    StepStatus::Success => Outcome::Success,
                    _ => Outcome::Failed,
                };
                let mut update = EntryUpdate::resolved(outcome).with_attachments(attachments);
                if let Some(message) = &result.error_message {
                    update = update.with_evidence(vec![message.clone()]);
                } else {
                    let keys: Vec<&str> = result.value.keys().map(|k| k.as_str()).collect();
                    update = update.with_evidence(vec![format!("result fields: {}", keys.join(", "))]);
                }
                let _ = session.with_interaction(interaction_id, |i| i.trace.update(entry_id, update));
            }

            let _ = report_tx
                .send(WorkerReport {
                    step_id,
                    result,
                    duration_ms,
                })
                .await;
        });

        Ok(resolved)
    }

    /// Publish one result: record it, store it on the interaction, and
    /// stream the completion event. A result is published exactly once
    /// per step per run.
    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &self,
        plan: &Plan,
        step_id: u64,
        result: StepResult,
        duration_ms: u64,
        session: &Arc<SessionHandle>,
        interaction_id: Uuid,
        events: &EventSender,
        results: &mut HashMap<u64, StepResult>,
        done: &mut HashSet<u64>,
        record_steps: &mut Vec<StepExecution>,
        resolved_params: &HashMap<u64, Map<String, Value>>,
    ) {
        let action = plan
            .step(step_id)
            .map(|s| s.action.clone())
            .unwrap_or_default();
        let summary = match (&result.status, &result.error_message) {
            (StepStatus::Success, _) => format!("{action} completed"),
            (_, Some(message)) => message.clone(),
            (status, None) => format!("{action} {status}"),
        };

        let _ = session.with_interaction(interaction_id, |i| {
            i.step_results.insert(step_id, result.clone());
        });
        record_steps.push(StepExecution {
            step_id,
            action,
            status: result.status,
            duration_ms,
            resolved_parameters: resolved_params.get(&step_id).cloned().unwrap_or_default(),
        });
        events
            .emit(AgentEvent::StepComplete {
                step_id,
                status: result.status,
                summary,
            })
            .await;
        debug!(step_id, status = %result.status, "step result published");
        results.insert(step_id, result);
        done.insert(step_id);
    }

    /// Mark every waiting step downstream of a failed id as skipped.
    #[allow(clippy::too_many_arguments)]
    async fn skip_dependents(
        &self,
        plan: &Plan,
        failed_id: u64,
        waiting: &mut Vec<u64>,
        session: &Arc<SessionHandle>,
        interaction_id: Uuid,
        events: &EventSender,
        results: &mut HashMap<u64, StepResult>,
        done: &mut HashSet<u64>,
        record_steps: &mut Vec<StepExecution>,
        resolved_params: &HashMap<u64, Map<String, Value>>,
    ) {
        let downstream = plan.dependents_closure(failed_id);
        let skipped: Vec<u64> = waiting
            .iter()
            .copied()
            .filter(|id| downstream.contains(id))
            .collect();
        for id in skipped {
            waiting.retain(|w| *w != id);
            warn!(step_id = id, failed_id, "skipping step: upstream failure");
            let result = StepResult::skipped(format!("dependency {failed_id} did not succeed"));
            self.publish(
                plan, id, result, 0, session, interaction_id, events,
                results, done, record_steps, resolved_params,
            )
            .await;
        }
    }
}

fn spawn_verification(
    verifier: Arc<StepVerifier>,
    step: Step,
    result: StepResult,
    request: String,
) -> JoinHandle<VerifiedStep> {
    tokio::spawn(async move {
        let verification = verifier.verify(&step, &result, &request).await;
        VerifiedStep {
            step_id: step.id,
            verification,
        }
    })
}

fn events_session_id(session: &Arc<SessionHandle>) -> String {
    session.with_session(|s| s.session_id.clone())
}
