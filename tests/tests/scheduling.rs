//! Executor-level scheduling properties: randomized DAGs must respect the
//! dependency order, and the per-step deadline must turn into a
//! `tool_timeout` result instead of hanging the run.

use async_trait::async_trait;
use otto_kernel::config::ExecutorSection;
use otto_kernel::error::ErrorKind;
use otto_kernel::event::EventSender;
use otto_kernel::plan::{Plan, Step, StepResult, StepStatus};
use otto_kernel::session::SessionStore;
use otto_kernel::tool::{Tool, ToolContext, ToolDescriptor, ToolRegistry};
use otto_runtime::executor::StepExecutor;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Records the order in which steps actually ran.
struct RecordingTool {
    descriptor: ToolDescriptor,
    order: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl Tool for RecordingTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, params: Map<String, Value>, _ctx: &ToolContext) -> StepResult {
        let step = params.get("step").and_then(|v| v.as_u64()).unwrap_or(0);
        let delay = params.get("delay").and_then(|v| v.as_u64()).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.order.lock().push(step);
        StepResult::success(json!({ "step": step }).as_object().unwrap().clone())
    }
}

struct SleepyTool {
    descriptor: ToolDescriptor,
}

#[async_trait]
impl Tool for SleepyTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, _params: Map<String, Value>, _ctx: &ToolContext) -> StepResult {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        StepResult::success(Map::new())
    }
}

fn random_plan(rng: &mut StdRng) -> Plan {
    let count = rng.gen_range(4..12u64);
    let steps = (1..=count)
        .map(|id| {
            let deps: Vec<u64> = (1..id).filter(|_| rng.gen_bool(0.35)).collect();
            Step::new(id, "task")
                .with_parameter("step", json!(id))
                .with_parameter("delay", json!(rng.gen_range(0..5u64)))
                .with_dependencies(deps)
        })
        .collect();
    Plan::new("random dag", steps)
}

async fn run_plan(plan: &Plan, order: Arc<Mutex<Vec<u64>>>) -> HashMap<u64, StepResult> {
    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(RecordingTool {
            descriptor: ToolDescriptor::new("task", "records execution order"),
            order,
        }))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path()).unwrap();
    let handle = store.session("dag").unwrap();
    let interaction_id = handle.begin_interaction("dag run").unwrap();

    let executor = StepExecutor::new(Arc::new(registry), ExecutorSection::default());
    let events = EventSender::disconnected("dag", Uuid::nil());
    let cancel = CancellationToken::new();
    let outcome = executor
        .execute(
            plan,
            HashMap::new(),
            handle,
            interaction_id,
            "dag run",
            &events,
            &cancel,
            true,
        )
        .await;
    outcome.results
}

#[tokio::test]
async fn random_dags_respect_dependency_order() {
    for seed in 0..15u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let plan = random_plan(&mut rng);
        let order = Arc::new(Mutex::new(Vec::new()));
        let results = run_plan(&plan, order.clone()).await;

        let order = order.lock();
        for step in &plan.steps {
            assert_eq!(
                results.get(&step.id).map(|r| r.status),
                Some(StepStatus::Success),
                "seed {seed}: step {} did not succeed",
                step.id
            );
            let position = order.iter().position(|id| *id == step.id).unwrap();
            for dep in plan.dependency_closure(step.id) {
                let dep_position = order.iter().position(|id| *id == dep).unwrap();
                assert!(
                    dep_position < position,
                    "seed {seed}: step {} ran before its dependency {}",
                    step.id,
                    dep
                );
            }
        }
    }
}

#[tokio::test(start_paused = true)]
async fn per_step_deadline_yields_tool_timeout() {
    let mut registry = ToolRegistry::new();
    registry
        .register(Arc::new(SleepyTool {
            descriptor: ToolDescriptor::new("slow_op", "sleeps forever").with_timeout_secs(5),
        }))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::new(dir.path()).unwrap();
    let handle = store.session("s").unwrap();
    let interaction_id = handle.begin_interaction("timeout run").unwrap();

    let plan = Plan::new(
        "timeout",
        vec![
            Step::new(1, "slow_op"),
            Step::new(2, "slow_op").with_dependencies(vec![1]),
        ],
    );

    let executor = StepExecutor::new(Arc::new(registry), ExecutorSection::default());
    let events = EventSender::disconnected("s", Uuid::nil());
    let cancel = CancellationToken::new();
    let outcome = executor
        .execute(
            &plan,
            HashMap::new(),
            handle,
            interaction_id,
            "timeout run",
            &events,
            &cancel,
            true,
        )
        .await;

    let first = outcome.results.get(&1).unwrap();
    assert_eq!(first.status, StepStatus::Error);
    assert_eq!(first.error_kind, Some(ErrorKind::ToolTimeout));
    // The dependent never ran; it was skipped with dependency_failed.
    let second = outcome.results.get(&2).unwrap();
    assert_eq!(second.status, StepStatus::Skipped);
    assert_eq!(second.error_kind, Some(ErrorKind::DependencyFailed));
    assert_eq!(outcome.failed_steps, vec![1]);
}
