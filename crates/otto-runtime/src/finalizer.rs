//! Finalizer
//!
//! Assembles the user-facing reply from the terminal step's result and
//! runs commitment verification: every tag recorded during planning must
//! be provably fulfilled by a successful step, or the interaction is
//! stamped `partial_success` and the reply says so truthfully. The
//! orchestrator reports what happened; nothing is rolled back.

use crate::executor::StepExecution;
use otto_kernel::error::ErrorKind;
use otto_kernel::plan::{FileRef, Plan, StepResult, StepStatus};
use otto_kernel::session::{FinalReply, InteractionStatus};
use otto_kernel::tool::{Capability, ToolRegistry};
use otto_kernel::trace::CommitmentTag;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One declarative fulfillment check.
#[derive(Debug, Clone)]
pub struct CommitmentCheck {
    pub tag: CommitmentTag,
    pub fulfilled: bool,
    pub detail: String,
}

/// Composes the reply and verifies commitments.
pub struct Finalizer {
    registry: Arc<ToolRegistry>,
}

impl Finalizer {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Build the final reply for a completed execution.
    pub fn finalize(
        &self,
        plan: &Plan,
        results: &HashMap<u64, StepResult>,
        executions: &[StepExecution],
        commitments: &[CommitmentTag],
    ) -> (FinalReply, Vec<CommitmentCheck>) {
        let checks: Vec<CommitmentCheck> = commitments
            .iter()
            .map(|tag| self.check(*tag, results, executions))
            .collect();
        let unfulfilled: Vec<&CommitmentCheck> = checks.iter().filter(|c| !c.fulfilled).collect();

        let (mut message, details, mut attachments) = self.read_terminal(plan, results, executions);

        let mut error_kind = None;
        let status = if unfulfilled.is_empty() {
            InteractionStatus::Success
        } else {
            // Report truthfully: say what was promised and not delivered.
            message.push_str("\n\nNote: ");
            let notes: Vec<String> = unfulfilled
                .iter()
                .map(|c| format!("{} was not completed ({})", c.tag, c.detail))
                .collect();
            message.push_str(&notes.join("; "));
            error_kind = Some(ErrorKind::CommitmentUnfulfilled);
            InteractionStatus::PartialSuccess
        };

        if attachments.is_empty() {
            attachments = collect_all_attachments(results);
        }

        info!(%status, checks = checks.len(), "interaction finalized");
        let mut reply = FinalReply::success(message)
            .with_attachments(attachments)
            .with_status(status);
        reply.error_kind = error_kind;
        if let Some(details) = details {
            reply = reply.with_details(details);
        }
        (reply, checks)
    }

    /// Read message, details, and attachments off the terminal step.
    fn read_terminal(
        &self,
        plan: &Plan,
        results: &HashMap<u64, StepResult>,
        executions: &[StepExecution],
    ) -> (String, Option<Value>, Vec<FileRef>) {
        let terminal = plan.steps.iter().rev().find(|s| {
            self.registry
                .descriptor(&s.action)
                .is_some_and(|d| d.terminal)
        });
        let Some(terminal) = terminal else {
            return ("Done.".to_string(), None, Vec::new());
        };

        let result = results.get(&terminal.id);
        let resolved = executions
            .iter()
            .rev()
            .find(|e| e.step_id == terminal.id)
            .map(|e| &e.resolved_parameters);

        let message = read_string_field(result, resolved, "message")
            .unwrap_or_else(|| format!("Completed: {}", plan.goal));
        let details = read_field(result, resolved, "details");
        let attachments = result.map(|r| r.attachments.clone()).unwrap_or_default();
        (message, details, attachments)
    }

    /// Declarative fulfillment check for one tag.
    fn check(
        &self,
        tag: CommitmentTag,
        results: &HashMap<u64, StepResult>,
        executions: &[StepExecution],
    ) -> CommitmentCheck {
        let successful_with = |capability: Capability| -> Option<&StepExecution> {
            executions.iter().find(|e| {
                e.status == StepStatus::Success
                    && self
                        .registry
                        .descriptor(&e.action)
                        .is_some_and(|d| d.has_capability(capability))
            })
        };

        let (fulfilled, detail) = match tag {
            CommitmentTag::SendEmail => match successful_with(Capability::Delivers) {
                Some(send) if is_truthy(send.resolved_parameters.get("send")) => {
                    (true, format!("step {} sent the message", send.step_id))
                }
                Some(send) => (
                    false,
                    format!("step {} composed a message but did not send it", send.step_id),
                ),
                None => (false, "no successful send step".to_string()),
            },
            CommitmentTag::AttachDocuments => match successful_with(Capability::Delivers) {
                Some(send) => check_attachments(send),
                None => (false, "no successful send step".to_string()),
            },
            CommitmentTag::PlayMusic => match successful_with(Capability::PlaysMedia) {
                Some(play) => (true, format!("step {} started playback", play.step_id)),
                None => (false, "no successful playback step".to_string()),
            },
            CommitmentTag::PostSocial => match successful_with(Capability::PostsSocial) {
                Some(post) => (true, format!("step {} published the post", post.step_id)),
                None => (false, "no successful social post step".to_string()),
            },
            CommitmentTag::CreateDocument => match successful_with(Capability::ProducesFile) {
                Some(producer) => {
                    let produced = results
                        .get(&producer.step_id)
                        .map(|r| !r.attachments.is_empty())
                        .unwrap_or(false);
                    if produced {
                        (true, format!("step {} produced the document", producer.step_id))
                    } else {
                        (
                            false,
                            format!("step {} succeeded but returned no file path", producer.step_id),
                        )
                    }
                }
                None => (false, "no successful document step".to_string()),
            },
            CommitmentTag::ScheduleEvent => match successful_with(Capability::Schedules) {
                Some(event) => (true, format!("step {} created the event", event.step_id)),
                None => (false, "no successful calendar step".to_string()),
            },
        };

        CommitmentCheck {
            tag,
            fulfilled,
            detail,
        }
    }
}

/// Attachments list non-empty and every path present on disk.
fn check_attachments(send: &StepExecution) -> (bool, String) {
    let Some(Value::Array(list)) = send.resolved_parameters.get("attachments") else {
        return (false, "send step has no attachments".to_string());
    };
    if list.is_empty() {
        return (false, "send step attachments list is empty".to_string());
    }
    let missing: Vec<String> = list
        .iter()
        .filter_map(|v| v.as_str())
        .filter(|path| !FileRef::new(*path).exists())
        .map(String::from)
        .collect();
    if missing.is_empty() {
        (true, format!("{} attachment(s) delivered", list.len()))
    } else {
        (false, format!("attachment(s) missing on disk: {}", missing.join(", ")))
    }
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn read_string_field(
    result: Option<&StepResult>,
    resolved: Option<&Map<String, Value>>,
    field: &str,
) -> Option<String> {
    read_field(result, resolved, field).and_then(|v| v.as_str().map(String::from))
}

/// Prefer the tool's result value; fall back to the resolved parameter.
fn read_field(
    result: Option<&StepResult>,
    resolved: Option<&Map<String, Value>>,
    field: &str,
) -> Option<Value> {
    result
        .and_then(|r| r.value.get(field).cloned())
        .or_else(|| resolved.and_then(|p| p.get(field).cloned()))
}

fn collect_all_attachments(results: &HashMap<u64, StepResult>) -> Vec<FileRef> {
    let mut all = Vec::new();
    let mut ids: Vec<&u64> = results.keys().collect();
    ids.sort();
    for id in ids {
        for file in &results[id].attachments {
            if !all.contains(file) {
                all.push(file.clone());
            }
        }
    }
    all
}
