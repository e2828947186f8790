//! Chat transport events
//!
//! JSON message types carried over the bidirectional channel to the shell
//! or UI, plus the per-session ordered sender the pipeline emits through.
//! Ordering is preserved per session: one writer per session, one mpsc
//! channel underneath.

use crate::error::ErrorKind;
use crate::plan::{FileRef, Plan, StepStatus};
use crate::session::FinalReply;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// Messages arriving from the shell/UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    UserRequest {
        session_id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<String>>,
    },
    Cancel {
        session_id: String,
    },
}

/// One plan step as shown to the user when a plan is ready.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStepSummary {
    pub id: u64,
    pub action: String,
    #[serde(default)]
    pub reasoning: String,
}

/// Events published to the shell/UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    PlanReady {
        goal: String,
        steps: Vec<PlanStepSummary>,
    },
    StepStart {
        step_id: u64,
        action: String,
    },
    StepComplete {
        step_id: u64,
        status: StepStatus,
        summary: String,
    },
    Reply {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        #[serde(default)]
        attachments: Vec<FileRef>,
    },
    Status {
        phase: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl AgentEvent {
    pub fn plan_ready(plan: &Plan) -> Self {
        Self::PlanReady {
            goal: plan.goal.clone(),
            steps: plan
                .steps
                .iter()
                .map(|s| PlanStepSummary {
                    id: s.id,
                    action: s.action.clone(),
                    reasoning: s.reasoning.clone(),
                })
                .collect(),
        }
    }

    pub fn reply(reply: &FinalReply) -> Self {
        Self::Reply {
            message: reply.message.clone(),
            details: reply.details.clone(),
            attachments: reply.attachments.clone(),
        }
    }
}

/// An event stamped with its session and interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub session_id: String,
    pub interaction_id: Uuid,
    #[serde(flatten)]
    pub event: AgentEvent,
}

/// Single writer for one interaction's events.
///
/// Emission is best-effort: a closed or full channel drops the event
/// rather than stalling the pipeline.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EventEnvelope>,
    session_id: String,
    interaction_id: Uuid,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<EventEnvelope>, session_id: impl Into<String>, interaction_id: Uuid) -> Self {
        Self {
            tx,
            session_id: session_id.into(),
            interaction_id,
        }
    }

    /// A sender wired to nothing, for callers that do not stream.
    pub fn disconnected(session_id: impl Into<String>, interaction_id: Uuid) -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self::new(tx, session_id, interaction_id)
    }

    pub async fn emit(&self, event: AgentEvent) {
        let envelope = EventEnvelope {
            session_id: self.session_id.clone(),
            interaction_id: self.interaction_id,
            event,
        };
        let _ = self.tx.send(envelope).await;
    }
}

/// Build an event channel with a stream-wrapped receiver for subscribers.
pub fn event_channel(capacity: usize) -> (mpsc::Sender<EventEnvelope>, ReceiverStream<EventEnvelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, ReceiverStream::new(rx))
}
