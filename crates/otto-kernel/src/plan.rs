//! Plan data model
//!
//! A [`Plan`] is an ordered sequence of [`Step`]s plus a top-level goal
//! string. Steps reference each other through integer ids; the dependency
//! relation must be acyclic and the final step must be the terminal reply
//! action. Execution produces one [`StepResult`] per step, published exactly
//! once per run.

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Result-map fields the kernel recognises as file attachments.
///
/// Tools that write files return absolute paths in one of these, or in a
/// `file_list` array of objects with a `path` field.
pub const ATTACHMENT_FIELDS: &[&str] = &["file_path", "keynote_path", "pages_path", "report_path"];

/// Field holding a list of `{ path: ... }` objects.
pub const ATTACHMENT_LIST_FIELD: &str = "file_list";

/// Error field the kernel honours as a rate-limit hint.
pub const RETRY_AFTER_FIELD: &str = "retry_after_seconds";

/// One tool invocation with parameters, dependencies, and intent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Unique positive integer within the plan.
    pub id: u64,
    /// Tool name; must exist in the registry.
    pub action: String,
    /// Parameter tree. String values may contain `$step<N>.<path>`
    /// references, resolved against prior results at execution time.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Step ids that must complete with status `success` first.
    #[serde(default)]
    pub dependencies: Vec<u64>,
    /// Free-text justification, opaque to the kernel.
    #[serde(default)]
    pub reasoning: String,
    /// What this step should produce; fed to the verifier.
    #[serde(default)]
    pub expected_output: String,
}

impl Step {
    pub fn new(id: u64, action: impl Into<String>) -> Self {
        Self {
            id,
            action: action.into(),
            parameters: Map::new(),
            dependencies: Vec::new(),
            reasoning: String::new(),
            expected_output: String::new(),
        }
    }

    /// Builder: set a parameter value.
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Builder: declare dependencies.
    pub fn with_dependencies(mut self, deps: Vec<u64>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Builder: record the planner's justification.
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// Builder: describe the expected output.
    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = expected.into();
        self
    }
}

/// An ordered list of steps with a goal string.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    /// Declared top-level goal.
    pub goal: String,
    /// Steps in plan order. The terminal reply step appears last.
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            goal: goal.into(),
            steps,
        }
    }

    /// Look up a step by id.
    pub fn step(&self, id: u64) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: u64) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Largest step id in the plan, or 0 for an empty plan.
    pub fn max_id(&self) -> u64 {
        self.steps.iter().map(|s| s.id).max().unwrap_or(0)
    }

    /// Transitive dependency closure of the given step id.
    ///
    /// Unknown ids in a `dependencies` list are ignored here; the validator
    /// rejects them before execution.
    pub fn dependency_closure(&self, id: u64) -> HashSet<u64> {
        let by_id: HashMap<u64, &Step> = self.steps.iter().map(|s| (s.id, s)).collect();
        let mut closure = HashSet::new();
        let mut stack: Vec<u64> = by_id.get(&id).map(|s| s.dependencies.clone()).unwrap_or_default();
        while let Some(dep) = stack.pop() {
            if closure.insert(dep) {
                if let Some(step) = by_id.get(&dep) {
                    stack.extend(step.dependencies.iter().copied());
                }
            }
        }
        closure
    }

    /// Step ids that transitively depend on the given id.
    pub fn dependents_closure(&self, id: u64) -> HashSet<u64> {
        self.steps
            .iter()
            .filter(|s| self.dependency_closure(s.id).contains(&id))
            .map(|s| s.id)
            .collect()
    }

    /// Append continuation steps produced by the reflector.
    pub fn extend_with(&mut self, steps: Vec<Step>) {
        self.steps.extend(steps);
    }
}

/// Execution status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Coarse kind of a produced file, inferred from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Document,
    Presentation,
    Spreadsheet,
    Image,
    Audio,
    Text,
    Other,
}

/// An absolute path plus inferred kind. Commitment verification checks
/// these against the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub path: PathBuf,
    pub kind: FileKind,
}

impl FileRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let kind = FileKind::from_path(&path);
        Self { path, kind }
    }

    /// Whether the referenced file exists on disk right now.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}

impl FileKind {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("pdf" | "doc" | "docx" | "pages" | "rtf") => Self::Document,
            Some("key" | "keynote" | "ppt" | "pptx") => Self::Presentation,
            Some("numbers" | "xls" | "xlsx" | "csv") => Self::Spreadsheet,
            Some("png" | "jpg" | "jpeg" | "gif" | "heic" | "webp") => Self::Image,
            Some("mp3" | "m4a" | "wav" | "aiff" | "flac") => Self::Audio,
            Some("txt" | "md" | "html" | "json") => Self::Text,
            _ => Self::Other,
        }
    }
}

/// The structured outcome of a step's execution.
///
/// Failure is data, not unwinding: a tool reports an error by returning a
/// result with `status = Error` and an [`ErrorKind`]; the state machine,
/// not the tool, decides whether to retry or give up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    /// What references resolve against.
    #[serde(default)]
    pub value: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Files extracted by the kernel from the documented result fields.
    #[serde(default)]
    pub attachments: Vec<FileRef>,
}

impl StepResult {
    pub fn success(value: Map<String, Value>) -> Self {
        Self {
            status: StepStatus::Success,
            value,
            error_kind: None,
            error_message: None,
            attachments: Vec::new(),
        }
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Error,
            value: Map::new(),
            error_kind: Some(kind),
            error_message: Some(message.into()),
            attachments: Vec::new(),
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            value: Map::new(),
            error_kind: Some(ErrorKind::DependencyFailed),
            error_message: Some(message.into()),
            attachments: Vec::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: StepStatus::Cancelled,
            value: Map::new(),
            error_kind: Some(ErrorKind::Cancelled),
            error_message: None,
            attachments: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Rate-limit hint reported by a tool alongside an error.
    pub fn retry_after(&self) -> Option<u64> {
        self.value.get(RETRY_AFTER_FIELD).and_then(|v| v.as_u64())
    }

    /// Pull [`FileRef`]s out of the documented result fields and record
    /// them on the result. Returns the refs that were found.
    pub fn capture_attachments(&mut self) -> Vec<FileRef> {
        let found = extract_attachments(&self.value);
        for file in &found {
            if !self.attachments.contains(file) {
                self.attachments.push(file.clone());
            }
        }
        found
    }
}

/// Scan a result value map for the documented attachment fields.
pub fn extract_attachments(value: &Map<String, Value>) -> Vec<FileRef> {
    let mut refs = Vec::new();
    for field in ATTACHMENT_FIELDS {
        if let Some(Value::String(path)) = value.get(*field) {
            if !path.is_empty() {
                refs.push(FileRef::new(path));
            }
        }
    }
    if let Some(Value::Array(entries)) = value.get(ATTACHMENT_LIST_FIELD) {
        for entry in entries {
            if let Some(Value::String(path)) = entry.get("path") {
                if !path.is_empty() {
                    refs.push(FileRef::new(path));
                }
            }
        }
    }
    refs
}
