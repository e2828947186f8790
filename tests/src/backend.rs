//! Scripted language-model backend
//!
//! Routes each completion by the system prompt it carries: planning calls
//! pop from the plan queue, reflection calls from the reflection queue,
//! and verifier calls get a fixed verdict. This keeps scripts stable even
//! though verifications run concurrently with execution.

use async_trait::async_trait;
use otto_kernel::llm::{CompletionRequest, LanguageModel, LlmError, LlmResult};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default verifier verdict: everything is fine.
const VERDICT_OK: &str = r#"{"verdict":"ok","issues":[]}"#;

pub struct ScriptedBackend {
    plans: Mutex<VecDeque<String>>,
    reflections: Mutex<VecDeque<String>>,
    verifier_response: Mutex<String>,
    /// Every request seen, in arrival order.
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            plans: Mutex::new(VecDeque::new()),
            reflections: Mutex::new(VecDeque::new()),
            verifier_response: Mutex::new(VERDICT_OK.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a planning response.
    pub fn push_plan(&self, raw: impl Into<String>) {
        self.plans.lock().push_back(raw.into());
    }

    /// Queue a reflection response.
    pub fn push_reflection(&self, raw: impl Into<String>) {
        self.reflections.lock().push_back(raw.into());
    }

    /// Replace the fixed verifier verdict.
    pub fn set_verifier_response(&self, raw: impl Into<String>) {
        *self.verifier_response.lock() = raw.into();
    }

    pub fn planning_calls(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.system.contains("planning component"))
            .count()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> LlmResult<String> {
        let system = request.system.clone();
        self.requests.lock().push(request);

        if system.contains("planning component") {
            return self
                .plans
                .lock()
                .pop_front()
                .ok_or_else(|| LlmError::Exhausted("no scripted plan left".into()));
        }
        if system.contains("repair a partially failed") {
            return self
                .reflections
                .lock()
                .pop_front()
                .ok_or_else(|| LlmError::Exhausted("no scripted reflection left".into()));
        }
        // Verifier and anything else: fixed verdict.
        Ok(self.verifier_response.lock().clone())
    }
}
