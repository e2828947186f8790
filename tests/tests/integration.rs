//! End-to-end pipeline tests: scripted planner, stub tools, real
//! orchestrator. Each scenario drives `Orchestrator::run` and asserts on
//! the reply, the tool call history, and the persisted session state.

use otto_kernel::config::OttoConfig;
use otto_kernel::error::ErrorKind;
use otto_kernel::event::{AgentEvent, InboundMessage};
use otto_kernel::session::{InteractionStatus, SessionStore};
use otto_kernel::tool::{Tool, ToolRegistry};
use otto_runtime::orchestrator::Orchestrator;
use otto_testing::tools::{
    self, ReplyTool, duplicate_finder, email_composer, email_reader, email_summarizer,
    keynote_producer, music_player, report_writer, web_search,
};
use otto_testing::{ScriptedBackend, assert_tool_called};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

struct Harness {
    orchestrator: Arc<Orchestrator>,
    backend: Arc<ScriptedBackend>,
    store: Arc<SessionStore>,
    dir: tempfile::TempDir,
}

fn harness(tools: Vec<Arc<dyn Tool>>) -> Harness {
    harness_with_config(tools, OttoConfig::default())
}

fn harness_with_config(tools: Vec<Arc<dyn Tool>>, config: OttoConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReplyTool::new())).unwrap();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    let backend = Arc::new(ScriptedBackend::new());
    let store = Arc::new(SessionStore::new(dir.path().join("sessions")).unwrap());
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(registry),
        backend.clone(),
        store.clone(),
        config,
    ));
    Harness {
        orchestrator,
        backend,
        store,
        dir,
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Scenario 1: find duplicate files and list them
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_files_reply_resolves_all_references() {
    let finder = duplicate_finder();
    let h = harness(vec![Arc::new(finder.clone())]);
    h.backend.push_plan(
        r#"{"goal":"list duplicate files","commitments":[],"steps":[
            {"id":1,"action":"folder_find_duplicates","parameters":{"folder_path":null},"dependencies":[],"reasoning":"scan for duplicates","expected_output":"duplicate groups"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"Found {$step1.total_duplicate_groups} group(s) of duplicate files, wasting {$step1.wasted_space_mb} MB","details":"$step1.duplicates"},"dependencies":[1],"reasoning":"report","expected_output":"summary"}]}"#,
    );

    let reply = h
        .orchestrator
        .run("s1", "what files are duplicated?")
        .await
        .unwrap();

    assert_eq!(
        reply.message,
        "Found 2 group(s) of duplicate files, wasting 0.38 MB"
    );
    // Whole-value bare reference hands over the list itself, not a string.
    let details = reply.details.expect("details present");
    assert!(details.is_array());
    assert_eq!(details.as_array().unwrap().len(), 2);
    assert!(!reply.message.contains("{$step"));
    assert!(!reply.message.contains('{'));
    assert_eq!(reply.status, InteractionStatus::Success);
    assert_tool_called!(finder, 1);
}

// ─────────────────────────────────────────────────────────────────────────
// Scenario 2: create slideshow and email it (attachment auto-repair)
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn validator_injects_missing_attachment_and_commitments_hold() {
    let fixture_dir = tempfile::tempdir().unwrap();
    let producer = keynote_producer(fixture_dir.path());
    let composer = email_composer();
    let h = harness(vec![Arc::new(producer), Arc::new(composer.clone())]);
    h.backend.push_plan(
        r#"{"goal":"create and email the slideshow","commitments":["send_email","attach_documents","create_document"],"steps":[
            {"id":1,"action":"create_keynote","parameters":{"topic":"volcanoes"},"dependencies":[],"reasoning":"build the deck","expected_output":"a keynote file"},
            {"id":2,"action":"compose_email","parameters":{"subject":"Slideshow","body":"Here you go.","send":true},"dependencies":[1],"reasoning":"send it","expected_output":"email sent"},
            {"id":3,"action":"reply_to_user","parameters":{"message":"Created the slideshow and emailed it to you."},"dependencies":[2],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
    );

    let reply = h
        .orchestrator
        .run("s1", "create a slideshow on volcanoes and email it to me")
        .await
        .unwrap();

    assert_eq!(reply.status, InteractionStatus::Success);
    // The validator wired the producer's file into the send step.
    let sent = composer.history();
    assert_eq!(sent.len(), 1);
    let attachments = sent[0].get("attachments").unwrap().as_array().unwrap();
    assert_eq!(attachments.len(), 1);
    let path = attachments[0].as_str().unwrap();
    assert!(path.ends_with("deck.key"));
    assert!(std::path::Path::new(path).is_file());

    // The repair is recorded against the trace.
    let handle = h.store.session("s1").unwrap();
    let corrections = handle.with_session(|s| s.interactions[0].trace.corrections());
    assert!(corrections.iter().any(|c| c.contains("attached")));
}

// ─────────────────────────────────────────────────────────────────────────
// Scenario 3: summarize then email with writer step present
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn email_summary_flow_fulfills_send_and_attach() {
    let dir = tempfile::tempdir().unwrap();
    let reader = email_reader();
    let summarizer = email_summarizer();
    let writer = report_writer(dir.path());
    let composer = email_composer();
    let h = harness(vec![
        Arc::new(reader),
        Arc::new(summarizer.clone()),
        Arc::new(writer),
        Arc::new(composer.clone()),
    ]);
    h.backend.push_plan(
        r#"{"goal":"summarize recent email and send the report","commitments":["send_email","attach_documents"],"steps":[
            {"id":1,"action":"read_latest_emails","parameters":{"count":3},"dependencies":[],"reasoning":"fetch","expected_output":"three messages"},
            {"id":2,"action":"summarize_emails","parameters":{"emails":"$step1.emails"},"dependencies":[1],"reasoning":"condense","expected_output":"summary"},
            {"id":3,"action":"create_detailed_report","parameters":{"content":"$step2.summary"},"dependencies":[2],"reasoning":"write the report","expected_output":"report file"},
            {"id":4,"action":"compose_email","parameters":{"subject":"Email summary","body":"$step2.summary","attachments":["$step3.file_path"],"send":true},"dependencies":[2,3],"reasoning":"deliver","expected_output":"sent"},
            {"id":5,"action":"reply_to_user","parameters":{"message":"Sent you a report summarizing your last 3 emails."},"dependencies":[4],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
    );

    let reply = h
        .orchestrator
        .run("s1", "summarize my last 3 emails and email the report")
        .await
        .unwrap();

    assert_eq!(reply.status, InteractionStatus::Success);
    // Whole-value reference delivered the email list as a list.
    let summarizer_input = &summarizer.history()[0];
    assert!(summarizer_input.get("emails").unwrap().is_array());
    assert_eq!(
        summarizer_input.get("emails").unwrap().as_array().unwrap().len(),
        3
    );
    // The send step got the real report path.
    let sent = &composer.history()[0];
    let attachments = sent.get("attachments").unwrap().as_array().unwrap();
    assert!(attachments[0].as_str().unwrap().ends_with("report.pdf"));
    assert!(sent.get("body").unwrap().as_str().unwrap().contains("Three emails"));
}

// ─────────────────────────────────────────────────────────────────────────
// Scenario 4: commitment unfulfilled is reported truthfully
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_attachments_stamp_partial_success() {
    let composer = email_composer();
    let h = harness(vec![Arc::new(composer.clone())]);
    h.backend.push_plan(
        r#"{"goal":"send trip links","commitments":["send_email","attach_documents"],"steps":[
            {"id":1,"action":"compose_email","parameters":{"subject":"Trip links","body":"Links below.","attachments":[],"send":true},"dependencies":[],"reasoning":"send","expected_output":"sent"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"Sent the trip links to your email."},"dependencies":[1],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
    );

    let reply = h
        .orchestrator
        .run("s1", "send the trip links to my email")
        .await
        .unwrap();

    assert_eq!(reply.status, InteractionStatus::PartialSuccess);
    assert_eq!(reply.error_kind, Some(ErrorKind::CommitmentUnfulfilled));
    assert!(reply.message.contains("attach_documents was not completed"));
    // The gap is recorded for future interactions.
    let handle = h.store.session("s1").unwrap();
    let corrections = handle.with_session(|s| s.interactions[0].trace.corrections());
    assert!(
        corrections
            .iter()
            .any(|c| c.contains("commitment attach_documents unfulfilled"))
    );
}

// ─────────────────────────────────────────────────────────────────────────
// Scenario 5: cancellation mid-step
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn cancellation_publishes_done_and_session_survives() {
    let slow = web_search().with_delay(Duration::from_secs(30));
    let finder = duplicate_finder();
    let h = harness(vec![Arc::new(slow), Arc::new(finder)]);
    h.backend.push_plan(
        r#"{"goal":"slow search","commitments":[],"steps":[
            {"id":1,"action":"web_search","parameters":{"query":"x"},"dependencies":[],"reasoning":"search","expected_output":"results"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"done"},"dependencies":[1],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
    );

    let orchestrator = h.orchestrator.clone();
    let run = tokio::spawn(async move { orchestrator.run("s1", "search for something slow").await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.orchestrator.cancel("s1");
    h.orchestrator.cancel("s1"); // idempotent

    let reply = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancellation must complete promptly")
        .unwrap()
        .unwrap();
    assert_eq!(reply.status, InteractionStatus::Cancelled);
    assert_eq!(reply.error_kind, Some(ErrorKind::Cancelled));

    // The trace was persisted and the session keeps working.
    let handle = h.store.session("s1").unwrap();
    handle.with_session(|s| {
        assert_eq!(s.interactions.len(), 1);
        assert_eq!(s.interactions[0].status, InteractionStatus::Cancelled);
        assert!(s.interactions[0].trace.is_frozen());
    });

    h.backend.push_plan(
        r#"{"goal":"list duplicate files","commitments":[],"steps":[
            {"id":1,"action":"folder_find_duplicates","parameters":{},"dependencies":[],"reasoning":"scan","expected_output":"groups"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"Found {$step1.total_duplicate_groups} group(s)"},"dependencies":[1],"reasoning":"report","expected_output":"summary"}]}"#,
    );
    let reply = h.orchestrator.run("s1", "what files are duplicated?").await.unwrap();
    assert_eq!(reply.message, "Found 2 group(s)");
}

// ─────────────────────────────────────────────────────────────────────────
// Scenario 6: regression detection and placeholder repair
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_placeholders_are_repaired_and_logged() {
    let finder = duplicate_finder();
    let h = harness(vec![Arc::new(finder)]);
    h.backend.push_plan(
        r#"{"goal":"list duplicate files","commitments":[],"steps":[
            {"id":1,"action":"folder_find_duplicates","parameters":{},"dependencies":[],"reasoning":"scan","expected_output":"groups"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"Here are the duplicates","details":"- {file1.name}\n- {file2.name}"},"dependencies":[1],"reasoning":"report","expected_output":"list"}]}"#,
    );

    let reply = h
        .orchestrator
        .run("s1", "what files are duplicated?")
        .await
        .unwrap();

    // The defective pattern was rewritten to a real list reference.
    let details = reply.details.expect("details present");
    assert!(details.is_array());
    assert_eq!(details.as_array().unwrap().len(), 2);

    let handle = h.store.session("s1").unwrap();
    let corrections = handle.with_session(|s| s.interactions[0].trace.corrections());
    assert!(
        corrections
            .iter()
            .any(|c| c.contains("rewrote invalid placeholder"))
    );
}

// ─────────────────────────────────────────────────────────────────────────
// Failure, reflection, and the retry budget
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn continuation_retries_a_failed_step() {
    let flaky = tools::failing_tool("flaky_fetch", ErrorKind::ToolInvocationError, "upstream 500");
    flaky.push_result(otto_kernel::plan::StepResult::success(
        json!({ "items": [1, 2, 3] }).as_object().unwrap().clone(),
    ));
    // Queue order: first call fails, second call succeeds.
    let h = harness(vec![Arc::new(flaky.clone())]);
    h.backend.push_plan(
        r#"{"goal":"fetch items","commitments":[],"steps":[
            {"id":1,"action":"flaky_fetch","parameters":{},"dependencies":[],"reasoning":"fetch","expected_output":"items"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"done"},"dependencies":[],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
    );
    h.backend.push_reflection(
        r#"{"mode":"continuation","steps":[
            {"id":3,"action":"flaky_fetch","parameters":{},"dependencies":[],"reasoning":"retry the fetch","expected_output":"items"}]}"#,
    );

    let reply = h.orchestrator.run("s1", "fetch the items").await.unwrap();
    assert_eq!(reply.status, InteractionStatus::Success);
    assert_tool_called!(flaky, 2);
    assert_eq!(h.backend.planning_calls(), 1);
}

#[tokio::test]
async fn full_replan_supersedes_the_old_plan() {
    let flaky = tools::failing_tool("flaky_fetch", ErrorKind::ToolInvocationError, "upstream 500");
    let finder = duplicate_finder();
    let h = harness(vec![Arc::new(flaky.clone()), Arc::new(finder.clone())]);
    h.backend.push_plan(
        r#"{"goal":"fetch items","commitments":[],"steps":[
            {"id":1,"action":"flaky_fetch","parameters":{},"dependencies":[],"reasoning":"fetch","expected_output":"items"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"done"},"dependencies":[1],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
    );
    h.backend.push_reflection(
        r#"{"mode":"replan","plan":{"goal":"different approach","steps":[
            {"id":1,"action":"folder_find_duplicates","parameters":{},"dependencies":[],"reasoning":"scan instead","expected_output":"groups"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"Found {$step1.total_duplicate_groups} group(s)"},"dependencies":[1],"reasoning":"report","expected_output":"summary"}]}}"#,
    );

    let reply = h.orchestrator.run("s1", "fetch the items").await.unwrap();
    assert_eq!(reply.status, InteractionStatus::Success);
    assert_eq!(reply.message, "Found 2 group(s)");
    assert_tool_called!(finder, 1);
}

#[tokio::test]
async fn exhausted_retry_budget_surfaces_unrecoverable() {
    let flaky = tools::failing_tool("flaky_fetch", ErrorKind::ToolInvocationError, "upstream 500");
    let mut config = OttoConfig::default();
    config.reflector.max_retries = 0;
    let h = harness_with_config(vec![Arc::new(flaky)], config);
    h.backend.push_plan(
        r#"{"goal":"fetch items","commitments":[],"steps":[
            {"id":1,"action":"flaky_fetch","parameters":{},"dependencies":[],"reasoning":"fetch","expected_output":"items"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"done"},"dependencies":[],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
    );

    let reply = h.orchestrator.run("s1", "fetch the items").await.unwrap();
    assert_eq!(reply.error_kind, Some(ErrorKind::Unrecoverable));
    // The reply step itself succeeded, so this is a partial result.
    assert_eq!(reply.status, InteractionStatus::PartialSuccess);
    assert!(reply.message.contains("best available partial result"));
}

#[tokio::test]
async fn downstream_of_failure_is_skipped() {
    let flaky = tools::failing_tool("flaky_fetch", ErrorKind::ToolInvocationError, "boom");
    let finder = duplicate_finder();
    let mut config = OttoConfig::default();
    config.reflector.max_retries = 0;
    let h = harness_with_config(vec![Arc::new(flaky), Arc::new(finder.clone())], config);
    h.backend.push_plan(
        r#"{"goal":"two branches","commitments":[],"steps":[
            {"id":1,"action":"flaky_fetch","parameters":{},"dependencies":[],"reasoning":"fetch","expected_output":"items"},
            {"id":2,"action":"folder_find_duplicates","parameters":{},"dependencies":[],"reasoning":"independent branch","expected_output":"groups"},
            {"id":3,"action":"reply_to_user","parameters":{"message":"done"},"dependencies":[1],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
    );

    let _reply = h.orchestrator.run("s1", "do two things").await.unwrap();
    // The independent branch still ran.
    assert_tool_called!(finder, 1);
    let handle = h.store.session("s1").unwrap();
    handle.with_session(|s| {
        let results = &s.interactions[0].step_results;
        assert_eq!(results.get(&1).unwrap().status, otto_kernel::plan::StepStatus::Error);
        assert_eq!(results.get(&3).unwrap().status, otto_kernel::plan::StepStatus::Skipped);
        assert_eq!(
            results.get(&3).unwrap().error_kind,
            Some(ErrorKind::DependencyFailed)
        );
    });
}

// ─────────────────────────────────────────────────────────────────────────
// Planner and validator error surfaces
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unparseable_planner_output_fails_after_bounded_retries() {
    let h = harness(vec![]);
    h.backend.push_plan("I would rather chat about the weather.");
    h.backend.push_plan("still not json");
    h.backend.push_plan("{\"goal\": \"missing steps\"}");

    let reply = h.orchestrator.run("s1", "do something").await.unwrap();
    assert_eq!(reply.status, InteractionStatus::Error);
    assert_eq!(reply.error_kind, Some(ErrorKind::PlannerUnparseable));
    assert_eq!(h.backend.planning_calls(), 3);
}

#[tokio::test]
async fn structural_reject_replans_once_with_reasons() {
    let finder = duplicate_finder();
    let h = harness(vec![Arc::new(finder)]);
    // Self-dependent step: hard reject.
    h.backend.push_plan(
        r#"{"goal":"broken","commitments":[],"steps":[
            {"id":1,"action":"folder_find_duplicates","parameters":{},"dependencies":[1],"reasoning":"loop","expected_output":"never"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"done"},"dependencies":[1],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
    );
    h.backend.push_reflection(
        r#"{"mode":"replan","plan":{"goal":"fixed","steps":[
            {"id":1,"action":"folder_find_duplicates","parameters":{},"dependencies":[],"reasoning":"scan","expected_output":"groups"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"Found {$step1.total_duplicate_groups} group(s)"},"dependencies":[1],"reasoning":"report","expected_output":"summary"}]}}"#,
    );

    let reply = h.orchestrator.run("s1", "what files are duplicated?").await.unwrap();
    assert_eq!(reply.status, InteractionStatus::Success);
    assert_eq!(reply.message, "Found 2 group(s)");
    // The reflector saw the validator's reasons.
    let requests = h.backend.requests.lock();
    let reflection_prompt = requests
        .iter()
        .find(|r| r.system.contains("repair a partially failed"))
        .unwrap();
    assert!(reflection_prompt.user.contains("depends on itself"));
}

#[tokio::test]
async fn missing_terminal_step_is_inserted_and_plan_runs() {
    let finder = duplicate_finder();
    let h = harness(vec![Arc::new(finder.clone())]);
    h.backend.push_plan(
        r#"{"goal":"scan for duplicates","commitments":[],"steps":[
            {"id":1,"action":"folder_find_duplicates","parameters":{},"dependencies":[],"reasoning":"scan","expected_output":"groups"}]}"#,
    );

    let reply = h.orchestrator.run("s1", "what files are duplicated?").await.unwrap();
    assert_eq!(reply.status, InteractionStatus::Success);
    assert_eq!(reply.message, "Completed: scan for duplicates");
    assert_tool_called!(finder, 1);
}

#[tokio::test]
async fn zero_work_steps_finalizes_with_no_commitments() {
    let h = harness(vec![]);
    h.backend.push_plan(
        r#"{"goal":"greet","commitments":[],"steps":[
            {"id":1,"action":"reply_to_user","parameters":{"message":"Hello there."},"dependencies":[],"reasoning":"greet","expected_output":"greeting"}]}"#,
    );

    let reply = h.orchestrator.run("s1", "hello").await.unwrap();
    assert_eq!(reply.status, InteractionStatus::Success);
    assert_eq!(reply.message, "Hello there.");
}

// ─────────────────────────────────────────────────────────────────────────
// Verifier fail feeds the reflector
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn verifier_fail_triggers_reflection() {
    let player = music_player();
    let mut config = OttoConfig::default();
    config.reflector.max_retries = 0;
    let h = harness_with_config(vec![Arc::new(player)], config);
    h.backend.set_verifier_response(r#"{"verdict":"fail","issues":["wrong playlist started"]}"#);
    h.backend.push_plan(
        r#"{"goal":"play focus music","commitments":["play_music"],"steps":[
            {"id":1,"action":"play_music","parameters":{"query":"focus"},"dependencies":[],"reasoning":"start playback","expected_output":"music playing"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"Playing."},"dependencies":[1],"reasoning":"confirm","expected_output":"confirmation"}]}"#,
    );

    let reply = h.orchestrator.run("s1", "play some focus music").await.unwrap();
    // Budget of zero: the verifier failure surfaces as unrecoverable.
    assert_eq!(reply.error_kind, Some(ErrorKind::Unrecoverable));
    let handle = h.store.session("s1").unwrap();
    let has_verification_entry = handle.with_session(|s| {
        s.interactions[0]
            .trace
            .entries()
            .iter()
            .any(|e| e.evidence.iter().any(|ev| ev.contains("wrong playlist")))
    });
    assert!(has_verification_entry);
}

// ─────────────────────────────────────────────────────────────────────────
// Event stream and the inbound gateway
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn event_stream_is_ordered_per_session() {
    let finder = duplicate_finder();
    let h = harness(vec![Arc::new(finder)]);
    let mut events = h.orchestrator.subscribe(256);
    h.backend.push_plan(
        r#"{"goal":"list duplicate files","commitments":[],"steps":[
            {"id":1,"action":"folder_find_duplicates","parameters":{},"dependencies":[],"reasoning":"scan","expected_output":"groups"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"Found {$step1.total_duplicate_groups} group(s)"},"dependencies":[1],"reasoning":"report","expected_output":"summary"}]}"#,
    );

    h.orchestrator.run("s1", "what files are duplicated?").await.unwrap();

    let mut saw_plan_ready_at = None;
    let mut first_step_event_at = None;
    let mut reply_at = None;
    let mut index = 0usize;
    while let Ok(Some(envelope)) =
        tokio::time::timeout(Duration::from_millis(500), events.next()).await
    {
        assert_eq!(envelope.session_id, "s1");
        match envelope.event {
            AgentEvent::PlanReady { .. } => saw_plan_ready_at = Some(index),
            AgentEvent::StepStart { .. } if first_step_event_at.is_none() => {
                first_step_event_at = Some(index)
            }
            AgentEvent::Reply { .. } => {
                reply_at = Some(index);
                break;
            }
            _ => {}
        }
        index += 1;
    }
    let plan_ready = saw_plan_ready_at.expect("plan_ready emitted");
    let first_step = first_step_event_at.expect("step events emitted");
    let reply = reply_at.expect("reply emitted");
    assert!(plan_ready < first_step);
    assert!(first_step < reply);
}

#[tokio::test]
async fn inbound_channel_drives_requests() {
    let finder = duplicate_finder();
    let h = harness(vec![Arc::new(finder)]);
    let mut events = h.orchestrator.subscribe(256);
    h.backend.push_plan(
        r#"{"goal":"list duplicate files","commitments":[],"steps":[
            {"id":1,"action":"folder_find_duplicates","parameters":{},"dependencies":[],"reasoning":"scan","expected_output":"groups"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"Found {$step1.total_duplicate_groups} group(s)"},"dependencies":[1],"reasoning":"report","expected_output":"summary"}]}"#,
    );

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(otto_runtime::gateway::serve_inbound(h.orchestrator.clone(), rx));
    tx.send(InboundMessage::UserRequest {
        session_id: "s1".to_string(),
        text: "what files are duplicated?".to_string(),
        attachments: None,
    })
    .await
    .unwrap();

    let reply = loop {
        let envelope = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("event stream stayed live")
            .expect("stream open");
        if let AgentEvent::Reply { message, .. } = envelope.event {
            break message;
        }
    };
    assert_eq!(reply, "Found 2 group(s)");
}

// ─────────────────────────────────────────────────────────────────────────
// Persistence across restart
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn finished_interactions_survive_a_restart() {
    let finder = duplicate_finder();
    let h = harness(vec![Arc::new(finder)]);
    h.backend.push_plan(
        r#"{"goal":"list duplicate files","commitments":[],"steps":[
            {"id":1,"action":"folder_find_duplicates","parameters":{},"dependencies":[],"reasoning":"scan","expected_output":"groups"},
            {"id":2,"action":"reply_to_user","parameters":{"message":"Found {$step1.total_duplicate_groups} group(s)"},"dependencies":[1],"reasoning":"report","expected_output":"summary"}]}"#,
    );
    h.orchestrator.run("s1", "what files are duplicated?").await.unwrap();

    // Give the background flush a moment, then reload from disk.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let reloaded = SessionStore::new(h.dir.path().join("sessions")).unwrap();
    let handle = reloaded.session("s1").unwrap();
    handle.with_session(|s| {
        assert_eq!(s.interactions.len(), 1);
        let interaction = &s.interactions[0];
        assert_eq!(interaction.status, InteractionStatus::Success);
        assert_eq!(interaction.request, "what files are duplicated?");
        assert!(interaction.plan.is_some());
        assert_eq!(interaction.step_results.len(), 2);
        assert!(interaction.trace.is_frozen());
        assert_eq!(
            interaction.reply.as_ref().unwrap().message,
            "Found 2 group(s)"
        );
    });
}
