//! Template resolver
//!
//! Substitutes cross-step references inside parameter trees. Two syntaxes
//! are accepted inside string values:
//!
//! - braced: `{$step3.files.0.name}`
//! - bare:   `$step3.files.0.name`
//!
//! Braced forms are consumed first (so the surrounding braces go away),
//! then bare forms. When a whole parameter value is exactly one bare
//! reference, the underlying value object is returned instead of its
//! string form, preserving lists and nested maps for downstream tools.
//!
//! Resolution is a single pass over the tree: substituted text is never
//! re-scanned, so termination is trivial. Every executor path goes through
//! this module; ad-hoc substitution elsewhere is what used to leave
//! orphaned braces behind.

use crate::plan::StepResult;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

lazy_static! {
    /// `{$step<N>.<path>}` — braces consumed on substitution.
    static ref BRACED_REF: Regex =
        Regex::new(r"\{\$step(\d+)\.([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\}").unwrap();
    /// `$step<N>.<path>` without braces.
    static ref BARE_REF: Regex =
        Regex::new(r"\$step(\d+)\.([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)").unwrap();
    /// A parameter value that is exactly one bare reference.
    static ref WHOLE_BARE_REF: Regex =
        Regex::new(r"^\$step(\d+)\.([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)$").unwrap();
    /// Placeholder-shaped text that does not start with `$step`, e.g.
    /// `{file1.name}`. Indicates the planner copied a bad example.
    static ref INVALID_PLACEHOLDER: Regex =
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)+)\}").unwrap();
    /// Any brace pair without nesting, for orphan detection.
    static ref BRACE_PAIR: Regex = Regex::new(r"\{[^{}]*\}").unwrap();
}

/// What the resolver observed while substituting one parameter tree.
///
/// Warnings are recoverable (a reference was left in place); regressions
/// indicate a malformed template that should be logged against the trace.
#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    /// Missing-path references that were left unchanged.
    pub warnings: Vec<String>,
    /// Defective placeholder shapes and orphaned braces found after
    /// substitution. The string is still sent as-is.
    pub regressions: Vec<String>,
}

impl ResolutionReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.regressions.is_empty()
    }

    fn merge(&mut self, other: ResolutionReport) {
        self.warnings.extend(other.warnings);
        self.regressions.extend(other.regressions);
    }
}

/// Resolve every reference in a parameter map against prior step results.
pub fn resolve_parameters(
    parameters: &Map<String, Value>,
    results: &HashMap<u64, StepResult>,
) -> (Map<String, Value>, ResolutionReport) {
    let mut report = ResolutionReport::default();
    let mut resolved = Map::new();
    for (key, value) in parameters {
        resolved.insert(key.clone(), resolve_value(value, results, &mut report));
    }
    (resolved, report)
}

/// Resolve a single value, recursing into lists and maps.
pub fn resolve_value(
    value: &Value,
    results: &HashMap<u64, StepResult>,
    report: &mut ResolutionReport,
) -> Value {
    match value {
        Value::String(text) => resolve_string(text, results, report),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, results, report))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, results, report));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn resolve_string(
    text: &str,
    results: &HashMap<u64, StepResult>,
    report: &mut ResolutionReport,
) -> Value {
    // Whole-value bare reference: hand back the underlying object so lists
    // and maps survive intact.
    if let Some(caps) = WHOLE_BARE_REF.captures(text) {
        match lookup(&caps, results) {
            Some(value) => return value.clone(),
            None => {
                report
                    .warnings
                    .push(format!("unresolved reference left in place: {text}"));
                return Value::String(text.to_string());
            }
        }
    }

    // Braced first (consumes the braces), then bare.
    let after_braced = substitute(&BRACED_REF, text, results, report);
    let resolved = substitute(&BARE_REF, &after_braced, results, report);
    scan_for_regressions(text, &resolved, report);
    Value::String(resolved.into_owned())
}

fn substitute<'t>(
    pattern: &Regex,
    text: &'t str,
    results: &HashMap<u64, StepResult>,
    report: &mut ResolutionReport,
) -> std::borrow::Cow<'t, str> {
    pattern.replace_all(text, |caps: &Captures| match lookup(caps, results) {
        Some(value) => interpolate(value),
        None => {
            report
                .warnings
                .push(format!("unresolved reference left in place: {}", &caps[0]));
            caps[0].to_string()
        }
    })
}

fn lookup<'a>(caps: &Captures, results: &'a HashMap<u64, StepResult>) -> Option<&'a Value> {
    let id: u64 = caps[1].parse().ok()?;
    let path = &caps[2];
    let result = results.get(&id)?;
    navigate(&result.value, path)
}

/// Navigate a dot-separated path of map keys and non-negative list indices.
pub fn navigate<'a>(root: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = root.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Stringify a value for interpolation into a larger string. Scalars render
/// as JSON scalars; strings render without quotes; compound values render
/// as compact JSON.
fn interpolate(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Post-substitution scan for brace-pair defects.
///
/// Orphaned braces (`{42}` where a bare reference was substituted inside a
/// brace pair) and invalid placeholder shapes (`{file1.name}`) are recorded
/// as regressions; the string is still sent as-is.
fn scan_for_regressions(original: &str, resolved: &str, report: &mut ResolutionReport) {
    for m in INVALID_PLACEHOLDER.find_iter(resolved) {
        report.regressions.push(format!(
            "invalid placeholder shape (not a $step reference): {}",
            m.as_str()
        ));
    }
    for m in BRACE_PAIR.find_iter(resolved) {
        let pair = m.as_str();
        if pair.contains("$step") || INVALID_PLACEHOLDER.is_match(pair) {
            continue;
        }
        if !original.contains(pair) {
            report
                .regressions
                .push(format!("orphaned brace pair after substitution: {pair}"));
        }
    }
}

/// Every step id referenced anywhere in a parameter tree, braced or bare.
///
/// The validator uses this to enforce that references stay inside the
/// declaring step's dependency closure.
pub fn referenced_step_ids(parameters: &Map<String, Value>) -> HashSet<u64> {
    let mut ids = HashSet::new();
    collect_ids(&Value::Object(parameters.clone()), &mut ids);
    ids
}

fn collect_ids(value: &Value, ids: &mut HashSet<u64>) {
    match value {
        Value::String(text) => {
            for caps in BARE_REF.captures_iter(text) {
                if let Ok(id) = caps[1].parse::<u64>() {
                    ids.insert(id);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_ids(v, ids)),
        Value::Object(map) => map.values().for_each(|v| collect_ids(v, ids)),
        _ => {}
    }
}

/// Invalid placeholder shapes present in a raw (pre-execution) string.
///
/// The validator runs this over reply-step parameters to decide whether the
/// auto-repair for copied bad examples applies.
pub fn invalid_placeholders(text: &str) -> Vec<String> {
    INVALID_PLACEHOLDER
        .find_iter(text)
        .map(|m| m.as_str().to_string())
        .collect()
}
