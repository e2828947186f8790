//! Chat gateway
//!
//! Two peer surfaces over the same orchestrator: a channel-based transport
//! draining inbound `user_request` / `cancel` messages from the shell, and
//! an optional synchronous `POST /chat` RPC that returns when the result
//! capture fires. The process is long-running; errors surface as events
//! or as the RPC's error body, never as exits.

use crate::orchestrator::Orchestrator;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use otto_kernel::event::InboundMessage;
use otto_kernel::session::FinalReply;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Initialise structured logging for the process. Honors `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();
}

/// `POST /chat` request body.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

/// `POST /chat` response body.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub attachments: Vec<String>,
    pub status: String,
}

impl From<FinalReply> for ChatResponse {
    fn from(reply: FinalReply) -> Self {
        Self {
            message: reply.message,
            details: reply.details,
            attachments: reply
                .attachments
                .iter()
                .map(|f| f.path.display().to_string())
                .collect(),
            status: reply.status.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatError {
    error: String,
}

/// Build the synchronous RPC router.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .with_state(orchestrator)
}

async fn chat(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, (StatusCode, Json<ChatError>)> {
    match orchestrator.run(&request.session_id, &request.message).await {
        Ok(reply) => Ok(Json(reply.into())),
        Err(report) => {
            error!(session_id = %request.session_id, ?report, "chat request failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ChatError {
                    error: report.to_string(),
                }),
            ))
        }
    }
}

/// Drain the inbound message channel from the shell until it closes.
///
/// Requests run as detached tasks (replies travel over the event stream);
/// cancels hit the orchestrator directly so they work mid-request.
pub async fn serve_inbound(orchestrator: Arc<Orchestrator>, mut rx: mpsc::Receiver<InboundMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            InboundMessage::UserRequest { session_id, text, .. } => {
                info!(session_id = %session_id, "inbound request");
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    if let Err(report) = orchestrator.run(&session_id, &text).await {
                        error!(session_id = %session_id, ?report, "request pipeline failed");
                    }
                });
            }
            InboundMessage::Cancel { session_id } => {
                orchestrator.cancel(&session_id);
            }
        }
    }
}
