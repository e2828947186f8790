//! Stub tools for integration tests
//!
//! Each stub implements the kernel's invocation contract with scripted
//! results and a call history, so tests can assert exactly what the
//! executor passed in and how often a tool ran.

use async_trait::async_trait;
use otto_kernel::error::ErrorKind;
use otto_kernel::plan::StepResult;
use otto_kernel::tool::{Capability, Tool, ToolContext, ToolDescriptor};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A stub tool with queued results and an input log.
///
/// Results are consumed front-to-back; when the queue runs dry the last
/// configured result repeats. With no configured results the stub returns
/// an empty success.
#[derive(Clone)]
pub struct StubTool {
    descriptor: ToolDescriptor,
    queued: Arc<Mutex<VecDeque<StepResult>>>,
    repeat: Arc<Mutex<Option<StepResult>>>,
    /// Every parameter map this tool was invoked with.
    pub call_history: Arc<Mutex<Vec<Map<String, Value>>>>,
    /// Artificial latency before returning, for cancellation tests.
    delay: Option<Duration>,
}

impl StubTool {
    pub fn new(descriptor: ToolDescriptor) -> Self {
        Self {
            descriptor,
            queued: Arc::new(Mutex::new(VecDeque::new())),
            repeat: Arc::new(Mutex::new(None)),
            call_history: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// Queue one result; the last queued result repeats once drained.
    pub fn push_result(&self, result: StepResult) {
        *self.repeat.lock() = Some(result.clone());
        self.queued.lock().push_back(result);
    }

    pub fn with_result(self, result: StepResult) -> Self {
        self.push_result(result);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_history.lock().len()
    }

    pub fn history(&self) -> Vec<Map<String, Value>> {
        self.call_history.lock().clone()
    }
}

#[async_trait]
impl Tool for StubTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, params: Map<String, Value>, ctx: &ToolContext) -> StepResult {
        self.call_history.lock().push(params);
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => return StepResult::cancelled(),
            }
        }
        let queued = self.queued.lock().pop_front();
        queued
            .or_else(|| self.repeat.lock().clone())
            .unwrap_or_else(|| StepResult::success(Map::new()))
    }
}

fn value_map(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// `folder_find_duplicates`: two duplicate groups, 0.38 MB wasted.
pub fn duplicate_finder() -> StubTool {
    let descriptor = ToolDescriptor::new("folder_find_duplicates", "Find duplicate files in a folder")
        .with_parameter_schema(json!({
            "type": "object",
            "properties": { "folder_path": { "type": ["string", "null"] } }
        }))
        .with_result_schema(json!({
            "type": "object",
            "properties": {
                "total_duplicate_groups": { "type": "integer" },
                "wasted_space_mb": { "type": "number" },
                "duplicates": { "type": "array" }
            }
        }));
    StubTool::new(descriptor).with_result(StepResult::success(value_map(json!({
        "total_duplicate_groups": 2,
        "wasted_space_mb": 0.38,
        "duplicates": [
            { "name": "photo.jpg", "copies": ["/tmp/a/photo.jpg", "/tmp/b/photo.jpg"] },
            { "name": "notes.txt", "copies": ["/tmp/a/notes.txt", "/tmp/c/notes.txt"] }
        ]
    }))))
}

/// `create_keynote`: writes a real file under `dir` and returns its path.
pub fn keynote_producer(dir: &Path) -> StubTool {
    let path = dir.join("deck.key");
    std::fs::write(&path, b"slides").expect("fixture file");
    let descriptor = ToolDescriptor::new("create_keynote", "Create a slideshow on a topic")
        .with_capability(Capability::ProducesFile)
        .with_result_schema(json!({
            "type": "object",
            "properties": { "file_path": { "type": "string" }, "slide_count": { "type": "integer" } }
        }));
    StubTool::new(descriptor).with_result(StepResult::success(value_map(json!({
        "file_path": path.to_str().unwrap(),
        "slide_count": 8
    }))))
}

/// `create_detailed_report`: writes a real report file under `dir`.
pub fn report_writer(dir: &Path) -> StubTool {
    let path = dir.join("report.pdf");
    std::fs::write(&path, b"report").expect("fixture file");
    let descriptor = ToolDescriptor::new("create_detailed_report", "Write a detailed report document")
        .with_capability(Capability::ProducesFile)
        .with_result_schema(json!({
            "type": "object",
            "properties": { "file_path": { "type": "string" } }
        }));
    StubTool::new(descriptor).with_result(StepResult::success(value_map(json!({
        "file_path": path.to_str().unwrap()
    }))))
}

/// `compose_email`: delivery tool; echoes what it sent.
pub fn email_composer() -> StubTool {
    let descriptor = ToolDescriptor::new("compose_email", "Compose and optionally send an email")
        .with_capability(Capability::Delivers)
        .with_parameter_schema(json!({
            "type": "object",
            "properties": {
                "subject": { "type": "string" },
                "body": { "type": "string" },
                "attachments": { "type": "array" },
                "send": { "type": "boolean" }
            }
        }));
    StubTool::new(descriptor).with_result(StepResult::success(value_map(json!({ "sent": true }))))
}

/// `read_latest_emails`: fetch tool returning three messages.
pub fn email_reader() -> StubTool {
    let descriptor = ToolDescriptor::new("read_latest_emails", "Read the most recent emails")
        .with_capability(Capability::Fetches)
        .with_result_schema(json!({
            "type": "object",
            "properties": { "emails": { "type": "array" } }
        }));
    StubTool::new(descriptor).with_result(StepResult::success(value_map(json!({
        "emails": [
            { "from": "ana@example.com", "subject": "Q3 numbers" },
            { "from": "bo@example.com", "subject": "Offsite" },
            { "from": "cy@example.com", "subject": "Invoice" }
        ]
    }))))
}

/// `summarize_emails`: writer tool.
pub fn email_summarizer() -> StubTool {
    let descriptor = ToolDescriptor::new("summarize_emails", "Summarize a list of emails")
        .with_capability(Capability::Synthesizes)
        .with_result_schema(json!({
            "type": "object",
            "properties": { "summary": { "type": "string" } }
        }));
    StubTool::new(descriptor).with_result(StepResult::success(value_map(json!({
        "summary": "Three emails: Q3 numbers, the offsite, and an invoice."
    }))))
}

/// `web_search`: fetch tool with an `items` list.
pub fn web_search() -> StubTool {
    let descriptor = ToolDescriptor::new("web_search", "Search the web")
        .with_capability(Capability::Fetches)
        .with_result_schema(json!({
            "type": "object",
            "properties": { "items": { "type": "array" } }
        }));
    StubTool::new(descriptor).with_result(StepResult::success(value_map(json!({
        "items": [{ "title": "result", "url": "https://example.com" }]
    }))))
}

/// `play_music`: media tool.
pub fn music_player() -> StubTool {
    let descriptor = ToolDescriptor::new("play_music", "Play music matching a query")
        .with_capability(Capability::PlaysMedia)
        .with_result_schema(json!({
            "type": "object",
            "properties": { "now_playing": { "type": "string" } }
        }));
    StubTool::new(descriptor).with_result(StepResult::success(value_map(json!({
        "now_playing": "Blue in Green"
    }))))
}

/// `reply_to_user`: the terminal reply action; echoes its parameters as
/// its result so the finalizer can read them back.
pub struct ReplyTool {
    descriptor: ToolDescriptor,
}

impl ReplyTool {
    pub fn new() -> Self {
        Self {
            descriptor: ToolDescriptor::new("reply_to_user", "Reply to the user")
                .with_terminal()
                .with_parameter_schema(json!({
                    "type": "object",
                    "properties": {
                        "message": { "type": "string" },
                        "details": {}
                    }
                })),
        }
    }
}

impl Default for ReplyTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for ReplyTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, params: Map<String, Value>, _ctx: &ToolContext) -> StepResult {
        let mut value = Map::new();
        if let Some(message) = params.get("message") {
            value.insert("message".to_string(), message.clone());
        }
        if let Some(details) = params.get("details") {
            value.insert("details".to_string(), details.clone());
        }
        StepResult::success(value)
    }
}

/// A tool that always fails with the given kind.
pub fn failing_tool(name: &str, kind: ErrorKind, message: &str) -> StubTool {
    let descriptor = ToolDescriptor::new(name, "Always fails, for tests");
    StubTool::new(descriptor).with_result(StepResult::error(kind, message))
}

#[macro_export]
macro_rules! assert_tool_called {
    ($tool:expr, $expected_count:expr) => {
        let count = $tool.call_count();
        assert_eq!(
            count,
            $expected_count,
            "expected tool to be called {} times, but it was called {} times",
            $expected_count,
            count
        );
    };
}
