//! Plan validator / repairer
//!
//! Runs once between planner and executor, and again after any replanner
//! output. Structural defects are fatal and cause a replan with the
//! reasons as feedback; a small enumerated set of defects is auto-repaired
//! in place instead.
//!
//! Auto-repair runs a single pass and only modifies values — it never adds
//! steps with new ids, except the terminal-step insertion which appends a
//! single final id. The plan therefore stays acyclic and bounded, and a
//! second pass finds nothing left to repair.

use crate::plan::{Plan, Step};
use crate::resolver;
use crate::tool::{Capability, ToolRegistry};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

lazy_static! {
    /// Report/summary intent words in the user request.
    static ref REPORT_INTENT: Regex =
        Regex::new(r"(?i)\b(report|summary|summarize|digest|analysis)\b").unwrap();
}

/// Validation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A specific issue found in the plan.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub step_id: Option<u64>,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(step_id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            step_id,
            message: message.into(),
        }
    }

    pub fn warning(step_id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            step_id,
            message: message.into(),
        }
    }
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub issues: Vec<ValidationIssue>,
    /// Human-readable descriptions of repairs applied in place.
    pub repairs: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    /// Rejection reasons to feed back into a replan prompt.
    pub fn rejection_reasons(&self) -> Vec<String> {
        self.errors()
            .map(|i| match i.step_id {
                Some(id) => format!("step {}: {}", id, i.message),
                None => i.message.clone(),
            })
            .collect()
    }
}

/// Structural and semantic checks over a plan, with in-place auto-repair.
pub struct PlanValidator<'a> {
    registry: &'a ToolRegistry,
}

impl<'a> PlanValidator<'a> {
    pub fn new(registry: &'a ToolRegistry) -> Self {
        Self { registry }
    }

    /// Validate `plan`, repairing the enumerated defects in place.
    ///
    /// If the returned report carries errors the plan must not execute;
    /// feed [`ValidationReport::rejection_reasons`] to the replanner.
    pub fn validate_and_repair(&self, plan: &mut Plan, request: &str) -> ValidationReport {
        let mut report = ValidationReport::default();

        self.check_ids(plan, &mut report);
        self.check_actions(plan, &mut report);
        self.check_dependencies(plan, &mut report);
        if !report.is_valid() {
            return report;
        }
        self.check_acyclic(plan, &mut report);
        if !report.is_valid() {
            return report;
        }

        self.ensure_terminal_step(plan, &mut report);
        if !report.is_valid() {
            return report;
        }

        self.repair_reply_placeholders(plan, &mut report);
        self.repair_missing_attachments(plan, &mut report);

        self.check_reference_closure(plan, &mut report);
        if !report.is_valid() {
            return report;
        }

        self.warn_missing_writer(plan, request, &mut report);
        report
    }

    fn check_ids(&self, plan: &Plan, report: &mut ValidationReport) {
        let mut seen = HashSet::new();
        for step in &plan.steps {
            if step.id == 0 {
                report
                    .issues
                    .push(ValidationIssue::error(Some(step.id), "step id must be positive"));
            }
            if !seen.insert(step.id) {
                report
                    .issues
                    .push(ValidationIssue::error(Some(step.id), "duplicate step id"));
            }
        }
    }

    fn check_actions(&self, plan: &Plan, report: &mut ValidationReport) {
        for step in &plan.steps {
            if !self.registry.contains(&step.action) {
                report.issues.push(ValidationIssue::error(
                    Some(step.id),
                    format!("unknown action '{}'", step.action),
                ));
            }
        }
    }

    fn check_dependencies(&self, plan: &Plan, report: &mut ValidationReport) {
        let ids: HashSet<u64> = plan.steps.iter().map(|s| s.id).collect();
        for step in &plan.steps {
            for dep in &step.dependencies {
                if *dep == step.id {
                    report.issues.push(ValidationIssue::error(
                        Some(step.id),
                        "step depends on itself",
                    ));
                } else if !ids.contains(dep) {
                    report.issues.push(ValidationIssue::error(
                        Some(step.id),
                        format!("dependency on nonexistent step {dep}"),
                    ));
                }
            }
        }
    }

    /// Kahn's algorithm; failure to drain every step means a cycle.
    fn check_acyclic(&self, plan: &Plan, report: &mut ValidationReport) {
        let mut in_degree: HashMap<u64, usize> = plan
            .steps
            .iter()
            .map(|s| (s.id, s.dependencies.len()))
            .collect();
        let mut dependents: HashMap<u64, Vec<u64>> = HashMap::new();
        for step in &plan.steps {
            for dep in &step.dependencies {
                dependents.entry(*dep).or_default().push(step.id);
            }
        }

        let mut queue: VecDeque<u64> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut drained = 0usize;
        while let Some(id) = queue.pop_front() {
            drained += 1;
            for dependent in dependents.get(&id).cloned().unwrap_or_default() {
                let degree = in_degree.get_mut(&dependent).expect("known id");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if drained != plan.steps.len() {
            let stuck: Vec<String> = in_degree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            report.issues.push(ValidationIssue::error(
                None,
                format!("dependency cycle involving steps {{{}}}", stuck.join(", ")),
            ));
        }
    }

    /// Exactly one terminal step, last in the list. Zero terminal steps is
    /// repairable: append a reply that summarizes the goal.
    fn ensure_terminal_step(&self, plan: &mut Plan, report: &mut ValidationReport) {
        let terminal_name = match self.registry.terminal_descriptor() {
            Ok(descriptor) => descriptor.name.clone(),
            Err(e) => {
                report.issues.push(ValidationIssue::error(None, e.to_string()));
                return;
            }
        };

        let terminal_ids: Vec<u64> = plan
            .steps
            .iter()
            .filter(|s| {
                self.registry
                    .descriptor(&s.action)
                    .is_some_and(|d| d.terminal)
            })
            .map(|s| s.id)
            .collect();

        match terminal_ids.len() {
            0 => {
                let id = plan.max_id() + 1;
                let sinks: Vec<u64> = plan
                    .steps
                    .iter()
                    .filter(|s| !plan.steps.iter().any(|o| o.dependencies.contains(&s.id)))
                    .map(|s| s.id)
                    .collect();
                let goal = plan.goal.clone();
                plan.steps.push(
                    Step::new(id, terminal_name)
                        .with_parameter("message", Value::String(format!("Completed: {goal}")))
                        .with_dependencies(sinks)
                        .with_reasoning("terminal reply inserted by validator"),
                );
                report
                    .repairs
                    .push(format!("inserted missing terminal reply step {id}"));
            }
            1 => {
                let last = plan.steps.last().map(|s| s.id);
                if last != Some(terminal_ids[0]) {
                    report.issues.push(ValidationIssue::error(
                        Some(terminal_ids[0]),
                        "terminal reply step must be the last step",
                    ));
                }
            }
            _ => {
                report.issues.push(ValidationIssue::error(
                    None,
                    format!("plan has {} terminal reply steps", terminal_ids.len()),
                ));
            }
        }
    }

    /// Every reference must name an id in the declaring step's transitive
    /// dependency closure.
    fn check_reference_closure(&self, plan: &Plan, report: &mut ValidationReport) {
        for step in &plan.steps {
            let closure = plan.dependency_closure(step.id);
            for referenced in resolver::referenced_step_ids(&step.parameters) {
                if !closure.contains(&referenced) {
                    report.issues.push(ValidationIssue::error(
                        Some(step.id),
                        format!(
                            "parameter references step {referenced}, which is not in the dependency closure"
                        ),
                    ));
                }
            }
        }
    }

    /// Repair 1: invalid placeholder shapes like `{file1.name}` in the
    /// reply step are rewritten to a bare reference to the most recent
    /// upstream result that declares a list field.
    fn repair_reply_placeholders(&self, plan: &mut Plan, report: &mut ValidationReport) {
        let Some(terminal_index) = self.terminal_index(plan) else {
            return;
        };

        // Most recent prior step whose result schema declares an array
        // property, searched backwards from the reply step.
        let source = plan.steps[..terminal_index]
            .iter()
            .rev()
            .find_map(|step| {
                let descriptor = self.registry.descriptor(&step.action)?;
                let mut fields = descriptor.list_result_fields();
                if fields.is_empty() {
                    return None;
                }
                // Prefer the conventional names when the schema has them.
                let preferred = ["duplicates", "items"]
                    .iter()
                    .find(|f| fields.iter().any(|have| have == *f))
                    .map(|f| f.to_string());
                Some((step.id, preferred.unwrap_or_else(|| fields.remove(0))))
            });

        let terminal_id = plan.steps[terminal_index].id;
        let mut repaired: Vec<(String, String, String)> = Vec::new();
        {
            let step = &mut plan.steps[terminal_index];
            for (key, value) in step.parameters.iter_mut() {
                let Value::String(text) = value else { continue };
                let bad = resolver::invalid_placeholders(text);
                if bad.is_empty() {
                    continue;
                }
                let Some((source_id, field)) = source.as_ref() else {
                    report.issues.push(ValidationIssue::warning(
                        Some(terminal_id),
                        format!(
                            "invalid placeholder(s) {} with no upstream list result to substitute",
                            bad.join(", ")
                        ),
                    ));
                    continue;
                };
                let replacement = format!("$step{source_id}.{field}");
                repaired.push((key.clone(), text.clone(), replacement.clone()));
                *value = Value::String(replacement);
            }
        }

        for (key, original, replacement) in repaired {
            if let Some((source_id, _)) = source.as_ref() {
                let step = &mut plan.steps[terminal_index];
                if !step.dependencies.contains(source_id) {
                    step.dependencies.push(*source_id);
                }
            }
            report.repairs.push(format!(
                "rewrote invalid placeholder(s) in reply parameter '{key}' ({original:?} -> {replacement})"
            ));
        }
    }

    /// Repair 2: a file-producing step followed by a delivery step with no
    /// attachment referencing it gets wired in — the producer's
    /// `file_path` result lands in the sender's `attachments` list and the
    /// producer joins the sender's dependencies.
    fn repair_missing_attachments(&self, plan: &mut Plan, report: &mut ValidationReport) {
        let producers: Vec<(usize, u64)> = plan
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                self.registry
                    .descriptor(&s.action)
                    .is_some_and(|d| d.has_capability(Capability::ProducesFile))
            })
            .map(|(i, s)| (i, s.id))
            .collect();

        for (producer_index, producer_id) in producers {
            let Some(sender_index) = plan
                .steps
                .iter()
                .enumerate()
                .skip(producer_index + 1)
                .find(|(_, s)| {
                    self.registry
                        .descriptor(&s.action)
                        .is_some_and(|d| d.has_capability(Capability::Delivers))
                })
                .map(|(i, _)| i)
            else {
                continue;
            };

            let sender = &mut plan.steps[sender_index];
            let reference = format!("$step{producer_id}.file_path");
            let needle = format!("$step{producer_id}.");

            let attachments = sender
                .parameters
                .entry("attachments".to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            let Value::Array(list) = attachments else {
                continue;
            };
            let already_referenced = list.iter().any(|v| {
                v.as_str().map(|s| s.contains(&needle)).unwrap_or(false)
            });
            if already_referenced {
                continue;
            }

            list.push(Value::String(reference.clone()));
            if !sender.dependencies.contains(&producer_id) {
                sender.dependencies.push(producer_id);
            }
            let sender_id = sender.id;
            report.repairs.push(format!(
                "attached {reference} from producer step {producer_id} to sender step {sender_id}"
            ));
        }
    }

    /// Repair 3 (warn only): a report/summary request whose plan chains a
    /// fetch tool straight into a delivery tool with nothing in between to
    /// write the prose. Inserting a step would renumber the plan, so this
    /// only annotates — the correction hint reaches the replanner later.
    fn warn_missing_writer(&self, plan: &mut Plan, request: &str, report: &mut ValidationReport) {
        if !REPORT_INTENT.is_match(request) {
            return;
        }
        let has_writer = plan.steps.iter().any(|s| {
            self.registry
                .descriptor(&s.action)
                .is_some_and(|d| d.has_capability(Capability::Synthesizes))
        });
        if has_writer {
            return;
        }

        let fetch_ids: HashSet<u64> = plan
            .steps
            .iter()
            .filter(|s| {
                self.registry
                    .descriptor(&s.action)
                    .is_some_and(|d| d.has_capability(Capability::Fetches))
            })
            .map(|s| s.id)
            .collect();
        if fetch_ids.is_empty() {
            return;
        }

        let delivery_fed_by_fetch = plan.steps.iter().find(|s| {
            let descriptor = self.registry.descriptor(&s.action);
            let delivers = descriptor.is_some_and(|d| d.has_capability(Capability::Delivers) || d.terminal);
            delivers && s.dependencies.iter().any(|d| fetch_ids.contains(d))
        });

        if let Some(delivery) = delivery_fed_by_fetch {
            let delivery_id = delivery.id;
            report.issues.push(ValidationIssue::warning(
                Some(delivery_id),
                "report/summary requested but raw fetched data feeds the delivery step directly; consider a writer step",
            ));
            if let Some(step) = plan.step_mut(delivery_id) {
                if !step.reasoning.contains("no writer step") {
                    if !step.reasoning.is_empty() {
                        step.reasoning.push_str("; ");
                    }
                    step.reasoning
                        .push_str("no writer step between fetched data and delivery");
                }
            }
        }
    }

    fn terminal_index(&self, plan: &Plan) -> Option<usize> {
        plan.steps.iter().position(|s| {
            self.registry
                .descriptor(&s.action)
                .is_some_and(|d| d.terminal)
        })
    }
}
