//! Session state & persistence
//!
//! A session is a stable id, a creation timestamp, and an ordered list of
//! interactions; each interaction carries its request, plan, step results,
//! reply, and reasoning trace, and is immutable once finalized.
//!
//! Persistence is one JSONL file per session: a header line followed by
//! one line per finalized interaction. Writes are behind a flusher task
//! (write-behind ≤ the configured interval, and on shutdown); a full
//! rewrite goes through a temp file and an atomic rename. On reload,
//! partial or corrupt trailing records are discarded, not repaired.
//!
//! A single lock per session guards the interaction list and the active
//! trace. All mutating operations are short and never block on I/O.

use crate::error::ErrorKind;
use crate::plan::{FileRef, Plan, StepResult};
use crate::trace::{ReasoningTrace, TraceSummary};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Session-store errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session file has no header line: {0}")]
    MissingHeader(PathBuf),

    #[error("An interaction is already in progress for session {0}")]
    InteractionInProgress(String),

    #[error("Unknown interaction: {0}")]
    UnknownInteraction(Uuid),
}

/// Terminal status of an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    InProgress,
    Success,
    PartialSuccess,
    Error,
    Cancelled,
}

impl std::fmt::Display for InteractionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The user-facing reply assembled by the finalizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReply {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default)]
    pub attachments: Vec<FileRef>,
    pub status: InteractionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl FinalReply {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
            attachments: Vec::new(),
            status: InteractionStatus::Success,
            error_kind: None,
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        let status = match kind {
            ErrorKind::Cancelled => InteractionStatus::Cancelled,
            _ => InteractionStatus::Error,
        };
        Self {
            message: message.into(),
            details: None,
            attachments: Vec::new(),
            status,
            error_kind: Some(kind),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<FileRef>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_status(mut self, status: InteractionStatus) -> Self {
        self.status = status;
        self
    }
}

/// One user request and everything it produced. Immutable once finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: Uuid,
    pub request: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    #[serde(default)]
    pub step_results: BTreeMap<u64, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<FinalReply>,
    pub trace: ReasoningTrace,
    pub status: InteractionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Interaction {
    fn new(request: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            request: request.into(),
            plan: None,
            step_results: BTreeMap::new(),
            reply: None,
            trace: ReasoningTrace::new(id),
            status: InteractionStatus::InProgress,
            started_at: Utc::now(),
            finalized_at: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status != InteractionStatus::InProgress
    }
}

/// Full session state as serialized to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub interactions: Vec<Interaction>,
}

impl Session {
    fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            created_at: Utc::now(),
            interactions: Vec::new(),
        }
    }

    pub fn active_interaction(&self) -> Option<&Interaction> {
        self.interactions.iter().find(|i| !i.is_finalized())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum PersistedRecord {
    Header {
        session_id: String,
        created_at: DateTime<Utc>,
    },
    Interaction(Box<Interaction>),
}

struct SessionState {
    session: Session,
    /// Finalized interactions already on disk.
    persisted: usize,
}

/// In-memory handle for one session; the single per-session lock.
pub struct SessionHandle {
    path: PathBuf,
    state: Mutex<SessionState>,
}

impl SessionHandle {
    /// Begin a new interaction. At most one may be live per session.
    pub fn begin_interaction(&self, request: &str) -> Result<Uuid, SessionError> {
        let mut state = self.state.lock();
        if state.session.active_interaction().is_some() {
            return Err(SessionError::InteractionInProgress(
                state.session.session_id.clone(),
            ));
        }
        let interaction = Interaction::new(request);
        let id = interaction.id;
        state.session.interactions.push(interaction);
        Ok(id)
    }

    /// Mutate the session under its lock. Keep the closure short; no I/O.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut state = self.state.lock();
        f(&mut state.session)
    }

    /// Mutate one interaction under the session lock.
    pub fn with_interaction<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Interaction) -> R,
    ) -> Result<R, SessionError> {
        let mut state = self.state.lock();
        let interaction = state
            .session
            .interactions
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(SessionError::UnknownInteraction(id))?;
        Ok(f(interaction))
    }

    /// Cheap snapshot for tools: summary of the active trace.
    pub fn trace_summary(&self, id: Uuid) -> Result<TraceSummary, SessionError> {
        self.with_interaction(id, |i| i.trace.summary())
    }

    /// Stamp the interaction finalized, freeze its trace, and store the
    /// reply.
    pub fn finalize_interaction(
        &self,
        id: Uuid,
        status: InteractionStatus,
        reply: FinalReply,
    ) -> Result<(), SessionError> {
        self.with_interaction(id, |interaction| {
            interaction.status = status;
            interaction.reply = Some(reply);
            interaction.finalized_at = Some(Utc::now());
            interaction.trace.freeze();
        })
    }

    /// Write out anything not yet on disk. Appends finalized interactions
    /// past the persisted watermark; writes header + backlog through an
    /// atomic rename when the file does not exist yet.
    pub fn flush(&self) -> Result<(), SessionError> {
        // Serialize under the lock, write after releasing it.
        let (header_needed, lines, new_persisted) = {
            let state = self.state.lock();
            let finalized: Vec<&Interaction> = state
                .session
                .interactions
                .iter()
                .filter(|i| i.is_finalized())
                .collect();
            if finalized.len() <= state.persisted && self.path.exists() {
                return Ok(());
            }
            let header_needed = !self.path.exists();
            let start = if header_needed { 0 } else { state.persisted };
            let mut lines = Vec::new();
            if header_needed {
                lines.push(serde_json::to_string(&PersistedRecord::Header {
                    session_id: state.session.session_id.clone(),
                    created_at: state.session.created_at,
                })?);
            }
            for interaction in finalized.iter().skip(start) {
                lines.push(serde_json::to_string(&PersistedRecord::Interaction(
                    Box::new((*interaction).clone()),
                ))?);
            }
            (header_needed, lines, finalized.len())
        };

        if header_needed {
            // Full rewrite through a temp file + atomic rename.
            let tmp = self.path.with_extension("jsonl.tmp");
            {
                let mut file = std::fs::File::create(&tmp)?;
                for line in &lines {
                    writeln!(file, "{line}")?;
                }
                file.sync_all()?;
            }
            std::fs::rename(&tmp, &self.path)?;
        } else if !lines.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
            for line in &lines {
                writeln!(file, "{line}")?;
            }
        }

        self.state.lock().persisted = new_persisted;
        debug!(path = %self.path.display(), "session flushed");
        Ok(())
    }
}

/// Durable store: one handle (and one file) per session id.
pub struct SessionStore {
    root: PathBuf,
    handles: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            handles: Mutex::new(HashMap::new()),
        })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        // Session ids are opaque; keep them filesystem-safe.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.jsonl"))
    }

    /// Get (or create, reloading from disk when a file exists) the handle
    /// for a session id.
    pub fn session(&self, session_id: &str) -> Result<Arc<SessionHandle>, SessionError> {
        if let Some(handle) = self.handles.lock().get(session_id) {
            return Ok(handle.clone());
        }
        let path = self.session_path(session_id);
        let session = if path.exists() {
            load_session(&path)?
        } else {
            Session::new(session_id)
        };
        let persisted = session.interactions.iter().filter(|i| i.is_finalized()).count();
        let handle = Arc::new(SessionHandle {
            path,
            state: Mutex::new(SessionState { session, persisted }),
        });
        self.handles
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| handle.clone());
        Ok(handle)
    }

    /// Flush every known session.
    pub fn flush_all(&self) -> Result<(), SessionError> {
        let handles: Vec<Arc<SessionHandle>> = self.handles.lock().values().cloned().collect();
        for handle in handles {
            handle.flush()?;
        }
        Ok(())
    }

    /// Flush everything and stop. Call on clean shutdown.
    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.flush_all()
    }

    /// Spawn the write-behind flusher. Flushes every `interval` and once
    /// more when `shutdown` fires.
    pub fn spawn_flusher(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.flush_all() {
                            warn!(error = %e, "write-behind flush failed");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        if let Err(e) = store.flush_all() {
                            warn!(error = %e, "shutdown flush failed");
                        }
                        break;
                    }
                }
            }
        })
    }
}

/// Rebuild a session from its file. Corrupt or partial trailing records
/// are discarded; everything before them is kept.
fn load_session(path: &Path) -> Result<Session, SessionError> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines();

    let header_line = lines
        .next()
        .ok_or_else(|| SessionError::MissingHeader(path.to_path_buf()))?;
    let (session_id, created_at) = match serde_json::from_str(header_line) {
        Ok(PersistedRecord::Header {
            session_id,
            created_at,
        }) => (session_id, created_at),
        _ => return Err(SessionError::MissingHeader(path.to_path_buf())),
    };

    let mut interactions = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(PersistedRecord::Interaction(interaction)) => interactions.push(*interaction),
            _ => {
                warn!(
                    path = %path.display(),
                    kept = interactions.len(),
                    "corrupt trailing session record; discarding it and the rest"
                );
                break;
            }
        }
    }

    Ok(Session {
        session_id,
        created_at,
        interactions,
    })
}
