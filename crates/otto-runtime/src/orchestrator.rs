//! Orchestrator state machine
//!
//! Drives one interaction through
//! `PLANNING → VALIDATING → EXECUTING → VERIFYING → FINALIZING → DONE`,
//! with a bounded `REPLAN` loop re-entering validation on step failure or
//! a verifier `fail`. Cancellation may be asserted in any state and is
//! idempotent; the machine transitions to DONE(cancelled) and in-flight
//! tool invocations learn about it through the shared token.
//!
//! The synchronous entry point returns through a single-slot result
//! capture: the pipeline publishes the reply the moment the finalizer has
//! it, and background work (trace persistence, verifier cleanup) continues
//! after `run` has returned. A bounded wait on the whole pipeline is the
//! only fallback when the capture never fires.

use crate::executor::{ExecutionOutcome, StepExecution, StepExecutor};
use crate::finalizer::{CommitmentCheck, Finalizer};
use crate::planner::{Planner, PlannerError};
use crate::reflector::{FailureSummary, Reflection, Reflector, ReflectorError};
use crate::verifier::{StepVerifier, Verdict};
use error_stack::Report;
use otto_kernel::config::OttoConfig;
use otto_kernel::error::{ErrorKind, KernelError, KernelResult};
use otto_kernel::event::{AgentEvent, EventEnvelope, EventSender};
use otto_kernel::llm::LanguageModel;
use otto_kernel::plan::{Plan, StepResult, StepStatus};
use otto_kernel::session::{FinalReply, InteractionStatus, SessionHandle, SessionStore};
use otto_kernel::tool::ToolRegistry;
use otto_kernel::trace::{CommitmentTag, EntryDraft, EntryUpdate, Outcome, Stage, detect_commitments};
use otto_kernel::validator::{PlanValidator, ValidationReport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// States of the orchestrator machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Planning,
    Validating,
    Executing,
    Verifying,
    Replan,
    Finalizing,
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Planning => "planning",
            Self::Validating => "validating",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Replan => "replan",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// The orchestration kernel: owns the injected collaborators and drives
/// interactions. No global singletons — everything is scoped here.
pub struct Orchestrator {
    registry: Arc<ToolRegistry>,
    model: Arc<dyn LanguageModel>,
    store: Arc<SessionStore>,
    config: OttoConfig,
    events: Mutex<Option<mpsc::Sender<EventEnvelope>>>,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        model: Arc<dyn LanguageModel>,
        store: Arc<SessionStore>,
        config: OttoConfig,
    ) -> Self {
        Self {
            registry,
            model,
            store,
            config,
            events: Mutex::new(None),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &OttoConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Subscribe to the outbound event stream. A new subscription replaces
    /// the previous one; ordering is preserved per session.
    pub fn subscribe(&self, capacity: usize) -> ReceiverStream<EventEnvelope> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.events.lock() = Some(tx);
        ReceiverStream::new(rx)
    }

    /// Cancel the live interaction of a session. Idempotent; unknown
    /// sessions are a no-op.
    pub fn cancel(&self, session_id: &str) {
        if let Some(token) = self.active.lock().get(session_id) {
            info!(session_id, "cancellation asserted");
            token.cancel();
        }
    }

    /// Synchronous entry point: run one request to a final reply.
    ///
    /// Returns when the result capture fires; trace persistence and other
    /// cleanup may still be running in the background.
    pub async fn run(&self, session_id: &str, request: &str) -> KernelResult<FinalReply> {
        let handle = self
            .store
            .session(session_id)
            .map_err(|e| Report::new(KernelError::from(e)))?;
        let interaction_id = handle
            .begin_interaction(request)
            .map_err(|e| Report::new(KernelError::from(e)))?;

        let cancel = CancellationToken::new();
        self.active
            .lock()
            .insert(session_id.to_string(), cancel.clone());

        let events = match self.events.lock().as_ref() {
            Some(tx) => EventSender::new(tx.clone(), session_id, interaction_id),
            None => EventSender::disconnected(session_id, interaction_id),
        };

        let pipeline = InteractionPipeline {
            registry: self.registry.clone(),
            model: self.model.clone(),
            config: self.config.clone(),
            handle,
            session_id: session_id.to_string(),
            interaction_id,
            request: request.to_string(),
            events,
            cancel,
            active: self.active.clone(),
        };

        let fallback = Duration::from_secs(self.config.executor.result_capture_fallback_seconds);
        let (capture_tx, capture_rx) = oneshot::channel();
        let task = tokio::spawn(pipeline.run(capture_tx));

        match capture_rx.await {
            Ok(reply) => Ok(reply),
            // The capture never fired (pipeline dropped the slot); fall
            // back to waiting for full pipeline completion, bounded.
            Err(_) => match tokio::time::timeout(fallback, task).await {
                Ok(Ok(reply)) => Ok(reply),
                Ok(Err(join_error)) => Err(Report::new(KernelError::internal(format!(
                    "pipeline task failed: {join_error}"
                )))),
                Err(_) => Err(Report::new(KernelError::internal(
                    "pipeline did not complete within the fallback window",
                ))),
            },
        }
    }
}

/// Everything one interaction needs, cloned out of the orchestrator so
/// the pipeline task is `'static`.
struct InteractionPipeline {
    registry: Arc<ToolRegistry>,
    model: Arc<dyn LanguageModel>,
    config: OttoConfig,
    handle: Arc<SessionHandle>,
    session_id: String,
    interaction_id: Uuid,
    request: String,
    events: EventSender,
    cancel: CancellationToken,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl InteractionPipeline {
    /// Drive the interaction, publish the reply to the capture, then do
    /// the remaining bookkeeping in the background.
    async fn run(self, capture: oneshot::Sender<FinalReply>) -> FinalReply {
        let reply = self.drive().await;
        let _ = capture.send(reply.clone());

        self.events.emit(AgentEvent::reply(&reply)).await;
        self.status(Phase::Done).await;
        if let Err(e) = self.handle.flush() {
            warn!(session_id = %self.session_id, error = %e, "trace persistence failed");
        }
        self.active.lock().remove(&self.session_id);
        reply
    }

    async fn drive(&self) -> FinalReply {
        // ── PLANNING ────────────────────────────────────────────────
        self.status(Phase::Planning).await;
        let catalog = self.registry.catalog();
        let digest = self
            .handle
            .with_interaction(self.interaction_id, |i| i.trace.render_digest())
            .unwrap_or_default();

        let planner = Planner::new(self.model.clone(), self.config.planner.clone());
        let planned = tokio::select! {
            result = planner.plan(&self.request, &catalog, &digest) => result,
            _ = self.cancel.cancelled() => return self.finish_cancelled().await,
        };
        let output = match planned {
            Ok(output) => output,
            Err(PlannerError::Unparseable(detail)) => {
                return self
                    .finish_error(ErrorKind::PlannerUnparseable, detail)
                    .await;
            }
            Err(PlannerError::Llm(e)) => {
                return self
                    .finish_error(ErrorKind::PlannerUnparseable, e.to_string())
                    .await;
            }
        };
        let mut plan = output.plan;

        // Union of the LLM's candidates and the deterministic scan, in
        // tag-declaration order.
        let detected = detect_commitments(&self.request);
        let commitments: Vec<CommitmentTag> = CommitmentTag::ALL
            .into_iter()
            .filter(|tag| detected.contains(tag) || output.commitments.contains(tag))
            .collect();
        self.trace_add(
            EntryDraft::new(Stage::Planning, format!("planned: {}", plan.goal))
                .with_commitments(commitments.clone())
                .with_evidence(vec![format!("{} step(s)", plan.steps.len())])
                .with_outcome(Outcome::Success),
        );

        // ── VALIDATING (+ bounded replan-on-reject) ─────────────────
        self.status(Phase::Validating).await;
        let reflector = Reflector::new(self.model.clone());
        let mut replanned_on_reject = false;
        loop {
            let report =
                PlanValidator::new(&self.registry).validate_and_repair(&mut plan, &self.request);
            self.record_validation(&report).await;
            if report.is_valid() {
                break;
            }
            if replanned_on_reject {
                return self
                    .finish_error(
                        ErrorKind::PlanStructuralInvalid,
                        report.rejection_reasons().join("; "),
                    )
                    .await;
            }
            replanned_on_reject = true;
            let reasons = report.rejection_reasons();
            self.trace_add(
                EntryDraft::new(Stage::Correction, "plan rejected by validator")
                    .with_evidence(reasons.clone())
                    .with_outcome(Outcome::Failed),
            );
            let corrections = self.corrections();
            let reflected = tokio::select! {
                result = reflector.reflect(&self.request, &plan, &[], &reasons, &corrections) => result,
                _ = self.cancel.cancelled() => return self.finish_cancelled().await,
            };
            match reflected {
                Ok(Reflection::Replan(new_plan)) => plan = new_plan,
                Ok(Reflection::Continuation(steps)) => plan.extend_with(steps),
                Err(e) => {
                    return self
                        .finish_error(ErrorKind::PlanStructuralInvalid, e.to_string())
                        .await;
                }
            }
        }
        self.store_plan(&plan);
        self.events.emit(AgentEvent::plan_ready(&plan)).await;

        // ── EXECUTING / VERIFYING / REPLAN loop ─────────────────────
        let trace_enabled = self.config.reasoning_trace.enabled;
        let executor = StepExecutor::new(self.registry.clone(), self.config.executor.clone())
            .with_verifier(Arc::new(StepVerifier::new(self.model.clone())));

        let mut results: HashMap<u64, StepResult> = HashMap::new();
        let mut executions: Vec<StepExecution> = Vec::new();
        let mut attempts: u32 = 0;
        let mut exhausted: Option<String> = None;

        loop {
            self.status(Phase::Executing).await;
            let outcome = executor
                .execute(
                    &plan,
                    std::mem::take(&mut results),
                    self.handle.clone(),
                    self.interaction_id,
                    &self.request,
                    &self.events,
                    &self.cancel,
                    trace_enabled,
                )
                .await;
            executions.extend(outcome.record.steps.iter().cloned());
            if outcome.cancelled {
                return self.finish_cancelled().await;
            }

            self.status(Phase::Verifying).await;
            let verifier_issues = self.record_verifications(&outcome).await;
            results = outcome.results;

            if outcome.failed_steps.is_empty() && verifier_issues.is_empty() {
                break;
            }
            if attempts >= self.config.reflector.max_retries {
                exhausted = Some(format!(
                    "reflection budget of {} exhausted",
                    self.config.reflector.max_retries
                ));
                break;
            }
            attempts += 1;

            self.status(Phase::Replan).await;
            let failures = FailureSummary::collect(&plan, &results, &outcome.failed_steps);
            self.trace_add(
                EntryDraft::new(
                    Stage::Correction,
                    format!("reflection round {attempts} after failure"),
                )
                .with_evidence(
                    failures
                        .iter()
                        .map(|f| format!("step {} ({}): {}", f.step_id, f.action, f.message))
                        .chain(verifier_issues.iter().cloned())
                        .collect(),
                )
                .with_outcome(Outcome::Partial),
            );

            let corrections = self.corrections();
            let reflected = tokio::select! {
                result = reflector.reflect(&self.request, &plan, &failures, &verifier_issues, &corrections) => result,
                _ = self.cancel.cancelled() => return self.finish_cancelled().await,
            };
            match reflected {
                Ok(Reflection::Continuation(steps)) => {
                    plan.extend_with(steps);
                    // Steps that were skipped behind the failure get a
                    // second chance now that the continuation exists, and
                    // the terminal reply moves back to the end.
                    results.retain(|_, r| r.status != StepStatus::Skipped);
                    let terminal_index = plan.steps.iter().position(|s| {
                        self.registry
                            .descriptor(&s.action)
                            .is_some_and(|d| d.terminal)
                    });
                    if let Some(index) = terminal_index {
                        let terminal = plan.steps.remove(index);
                        plan.steps.push(terminal);
                    }
                }
                Ok(Reflection::Replan(new_plan)) => {
                    // A full replan supersedes everything done so far.
                    plan = new_plan;
                    results.clear();
                    executions.clear();
                }
                Err(ReflectorError::Unparseable(detail)) => {
                    exhausted = Some(format!("reflection unparseable: {detail}"));
                    break;
                }
                Err(ReflectorError::Llm(e)) => {
                    exhausted = Some(format!("reflection backend failed: {e}"));
                    break;
                }
            }

            // Corrected plans re-enter validation before running.
            self.status(Phase::Validating).await;
            let report =
                PlanValidator::new(&self.registry).validate_and_repair(&mut plan, &self.request);
            self.record_validation(&report).await;
            if !report.is_valid() {
                exhausted = Some(format!(
                    "corrected plan rejected: {}",
                    report.rejection_reasons().join("; ")
                ));
                break;
            }
            self.store_plan(&plan);
            self.events.emit(AgentEvent::plan_ready(&plan)).await;
        }

        // ── FINALIZING ──────────────────────────────────────────────
        self.status(Phase::Finalizing).await;
        let (mut reply, checks) =
            Finalizer::new(self.registry.clone()).finalize(&plan, &results, &executions, &commitments);
        self.record_commitment_checks(&checks);

        if let Some(detail) = exhausted {
            reply.status = if executions.iter().any(|e| e.status.is_success()) {
                InteractionStatus::PartialSuccess
            } else {
                InteractionStatus::Error
            };
            reply.error_kind = Some(ErrorKind::Unrecoverable);
            reply.message.push_str(&format!(
                "\n\nI could not fully recover: {detail}. This is the best available partial result."
            ));
            self.events
                .emit(AgentEvent::Error {
                    kind: ErrorKind::Unrecoverable,
                    message: detail,
                })
                .await;
        }

        if let Err(e) =
            self.handle
                .finalize_interaction(self.interaction_id, reply.status, reply.clone())
        {
            warn!(error = %e, "failed to finalize interaction");
        }
        reply
    }

    /// Record repairs and warnings from a validation pass; optionally
    /// announce that a repair changed the plan.
    async fn record_validation(&self, report: &ValidationReport) {
        if !report.repairs.is_empty() || report.warnings().next().is_some() {
            if let Some(entry_id) = self.trace_add(
                EntryDraft::new(Stage::Planning, "plan validation")
                    .with_outcome(Outcome::Success),
            ) {
                let corrections: Vec<String> = report
                    .repairs
                    .iter()
                    .cloned()
                    .chain(report.warnings().map(|w| w.message.clone()))
                    .collect();
                let _ = self.handle.with_interaction(self.interaction_id, |i| {
                    i.trace
                        .update(entry_id, EntryUpdate::default().with_corrections(corrections))
                });
            }
        }
        if self.config.validator.announce_repairs && !report.repairs.is_empty() {
            self.events
                .emit(AgentEvent::Status {
                    phase: "plan_repaired".to_string(),
                })
                .await;
        }
    }

    /// Record verifier verdicts; returns the issues behind `fail`s.
    async fn record_verifications(&self, outcome: &ExecutionOutcome) -> Vec<String> {
        let mut fail_issues = Vec::new();
        for verified in &outcome.verifications {
            let verification = &verified.verification;
            if verification.verdict == Verdict::Ok {
                continue;
            }
            let outcome_tag = match verification.verdict {
                Verdict::Fail => Outcome::Failed,
                _ => Outcome::Partial,
            };
            self.trace_add(
                EntryDraft::new(
                    Stage::Verification,
                    format!("step {} verification: {:?}", verified.step_id, verification.verdict),
                )
                .with_evidence(verification.issues.clone())
                .with_outcome(outcome_tag),
            );
            if verification.verdict == Verdict::Fail {
                fail_issues.extend(verification.issues.iter().cloned());
                if verification.issues.is_empty() {
                    fail_issues.push(format!("step {} failed verification", verified.step_id));
                }
            }
        }
        fail_issues
    }

    /// Record commitment outcomes; unfulfilled ones leave corrective
    /// guidance for future interactions.
    fn record_commitment_checks(&self, checks: &[CommitmentCheck]) {
        for check in checks {
            let outcome = if check.fulfilled {
                Outcome::Success
            } else {
                Outcome::Partial
            };
            if let Some(entry_id) = self.trace_add(
                EntryDraft::new(
                    Stage::Finalization,
                    format!("commitment {}: {}", check.tag, check.detail),
                )
                .with_commitments(vec![check.tag])
                .with_outcome(outcome),
            ) {
                if !check.fulfilled {
                    let _ = self.handle.with_interaction(self.interaction_id, |i| {
                        i.trace.update(
                            entry_id,
                            EntryUpdate::default().with_corrections(vec![format!(
                                "commitment {} unfulfilled: {}",
                                check.tag, check.detail
                            )]),
                        )
                    });
                }
            }
        }
    }

    fn store_plan(&self, plan: &Plan) {
        let _ = self.handle.with_interaction(self.interaction_id, |i| {
            i.plan = Some(plan.clone());
        });
    }

    fn corrections(&self) -> Vec<String> {
        self.handle
            .with_interaction(self.interaction_id, |i| i.trace.corrections())
            .unwrap_or_default()
    }

    fn trace_add(&self, draft: EntryDraft) -> Option<Uuid> {
        if !self.config.reasoning_trace.enabled {
            return None;
        }
        self.handle
            .with_interaction(self.interaction_id, |i| i.trace.add(draft))
            .ok()
            .and_then(|r| r.ok())
    }

    async fn status(&self, phase: Phase) {
        self.events
            .emit(AgentEvent::Status {
                phase: phase.to_string(),
            })
            .await;
    }

    async fn finish_error(&self, kind: ErrorKind, detail: String) -> FinalReply {
        warn!(session_id = %self.session_id, %kind, detail = %detail, "interaction failed");
        self.events
            .emit(AgentEvent::Error {
                kind,
                message: detail.clone(),
            })
            .await;
        self.trace_add(
            EntryDraft::new(Stage::Finalization, format!("failed: {kind}"))
                .with_evidence(vec![detail])
                .with_outcome(Outcome::Failed),
        );
        let reply = FinalReply::failed(
            kind,
            format!("I could not complete this request: {}.", kind.user_facing()),
        );
        if let Err(e) =
            self.handle
                .finalize_interaction(self.interaction_id, reply.status, reply.clone())
        {
            warn!(error = %e, "failed to finalize errored interaction");
        }
        reply
    }

    async fn finish_cancelled(&self) -> FinalReply {
        info!(session_id = %self.session_id, "interaction cancelled");
        self.trace_add(
            EntryDraft::new(Stage::Finalization, "cancelled by user")
                .with_outcome(Outcome::Partial),
        );
        let reply = FinalReply::failed(ErrorKind::Cancelled, "Cancelled. Nothing further was run.");
        if let Err(e) = self.handle.finalize_interaction(
            self.interaction_id,
            InteractionStatus::Cancelled,
            reply.clone(),
        ) {
            warn!(error = %e, "failed to finalize cancelled interaction");
        }
        reply
    }
}
