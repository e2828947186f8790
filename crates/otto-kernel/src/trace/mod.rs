//! Reasoning trace & session memory
//!
//! A per-interaction append-only log of decisions, commitments, evidence,
//! and corrections. Entries may be updated only to resolve
//! `pending → success|partial|failed` and to attach late evidence or
//! attachments. Once the interaction finalizes the trace is frozen and any
//! further mutation is an error.
//!
//! The planner consumes a [`TraceSummary`], not raw strings, so memory
//! quality is testable as a unit.

mod commitments;

pub use commitments::detect_commitments;

use crate::plan::FileRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// How many corrections a summary keeps.
const RECENT_CORRECTIONS: usize = 5;

/// Pipeline stage an entry was recorded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Execution,
    Verification,
    Correction,
    Finalization,
}

/// Outcome of the work an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Success,
    Partial,
    Failed,
}

/// A declared promise to perform an observable side effect.
///
/// Fixed closed set: commitments are safety-relevant, so new tags require a
/// code change, never data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentTag {
    SendEmail,
    AttachDocuments,
    PlayMusic,
    PostSocial,
    CreateDocument,
    ScheduleEvent,
}

impl CommitmentTag {
    /// All tags in declaration order. Detection and verification iterate
    /// this so output order is deterministic.
    pub const ALL: [CommitmentTag; 6] = [
        Self::SendEmail,
        Self::AttachDocuments,
        Self::PlayMusic,
        Self::PostSocial,
        Self::CreateDocument,
        Self::ScheduleEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendEmail => "send_email",
            Self::AttachDocuments => "attach_documents",
            Self::PlayMusic => "play_music",
            Self::PostSocial => "post_social",
            Self::CreateDocument => "create_document",
            Self::ScheduleEvent => "schedule_event",
        }
    }
}

impl std::fmt::Display for CommitmentTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record in the trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningEntry {
    pub id: Uuid,
    pub interaction_id: Uuid,
    pub stage: Stage,
    pub thought: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
    pub outcome: Outcome,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub commitments: Vec<CommitmentTag>,
    #[serde(default)]
    pub corrections: Vec<String>,
    #[serde(default)]
    pub attachments: Vec<FileRef>,
    pub timestamp: DateTime<Utc>,
}

/// What `add` needs to create an entry. Outcome starts `Pending` unless
/// overridden (finalization entries are born resolved).
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub stage: Stage,
    pub thought: String,
    pub action: Option<String>,
    pub parameters: Option<Map<String, Value>>,
    pub commitments: Vec<CommitmentTag>,
    pub evidence: Vec<String>,
    pub outcome: Outcome,
}

impl EntryDraft {
    pub fn new(stage: Stage, thought: impl Into<String>) -> Self {
        Self {
            stage,
            thought: thought.into(),
            action: None,
            parameters: None,
            commitments: Vec::new(),
            evidence: Vec::new(),
            outcome: Outcome::Pending,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_commitments(mut self, commitments: Vec<CommitmentTag>) -> Self {
        self.commitments = commitments;
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Late material attached when an entry resolves.
#[derive(Debug, Clone, Default)]
pub struct EntryUpdate {
    pub outcome: Option<Outcome>,
    pub evidence: Vec<String>,
    pub corrections: Vec<String>,
    pub attachments: Vec<FileRef>,
}

impl EntryUpdate {
    pub fn resolved(outcome: Outcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Default::default()
        }
    }

    pub fn with_evidence(mut self, evidence: Vec<String>) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_corrections(mut self, corrections: Vec<String>) -> Self {
        self.corrections = corrections;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<FileRef>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Trace mutation errors.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("Trace is frozen; interaction already finalized")]
    Frozen,

    #[error("Unknown trace entry: {0}")]
    UnknownEntry(Uuid),

    #[error("Entry {0} already resolved; outcome cannot change again")]
    AlreadyResolved(Uuid),
}

/// The digest the planner and memory-enabled tools consume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Union of recorded commitment tags, first-seen order.
    pub commitments: Vec<CommitmentTag>,
    /// Entries that resolved `failed` — how often this interaction has
    /// already gone wrong.
    pub past_attempts: u32,
    /// Most recent correction hints, oldest first.
    pub recent_corrections: Vec<String>,
    /// Every attachment seen so far, deduplicated by path.
    pub attachment_inventory: Vec<FileRef>,
}

/// Append-only reasoning log scoped to one interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningTrace {
    pub interaction_id: Uuid,
    entries: Vec<ReasoningEntry>,
    frozen: bool,
}

impl ReasoningTrace {
    pub fn new(interaction_id: Uuid) -> Self {
        Self {
            interaction_id,
            entries: Vec::new(),
            frozen: false,
        }
    }

    pub fn entries(&self) -> &[ReasoningEntry] {
        &self.entries
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Append a new entry and return its id.
    pub fn add(&mut self, draft: EntryDraft) -> Result<Uuid, TraceError> {
        if self.frozen {
            return Err(TraceError::Frozen);
        }
        let id = Uuid::new_v4();
        self.entries.push(ReasoningEntry {
            id,
            interaction_id: self.interaction_id,
            stage: draft.stage,
            thought: draft.thought,
            action: draft.action,
            parameters: draft.parameters,
            outcome: draft.outcome,
            evidence: draft.evidence,
            commitments: draft.commitments,
            corrections: Vec::new(),
            attachments: Vec::new(),
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    /// Resolve an entry and/or attach late material.
    ///
    /// Outcome transitions are restricted to `Pending → {Success, Partial,
    /// Failed}`; evidence, corrections, and attachments may be appended at
    /// any time before the trace freezes.
    pub fn update(&mut self, entry_id: Uuid, update: EntryUpdate) -> Result<(), TraceError> {
        if self.frozen {
            return Err(TraceError::Frozen);
        }
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or(TraceError::UnknownEntry(entry_id))?;
        if let Some(outcome) = update.outcome {
            if entry.outcome != Outcome::Pending {
                return Err(TraceError::AlreadyResolved(entry_id));
            }
            entry.outcome = outcome;
        }
        entry.evidence.extend(update.evidence);
        entry.corrections.extend(update.corrections);
        for file in update.attachments {
            if !entry.attachments.contains(&file) {
                entry.attachments.push(file);
            }
        }
        Ok(())
    }

    /// Freeze the trace. Idempotent; called when the interaction finalizes.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Union of commitment tags, first-seen order.
    pub fn commitments(&self) -> Vec<CommitmentTag> {
        let mut seen = Vec::new();
        for entry in &self.entries {
            for tag in &entry.commitments {
                if !seen.contains(tag) {
                    seen.push(*tag);
                }
            }
        }
        seen
    }

    /// All corrections recorded so far, in order.
    pub fn corrections(&self) -> Vec<String> {
        self.entries
            .iter()
            .flat_map(|e| e.corrections.iter().cloned())
            .collect()
    }

    /// The digest handed to the planner and to memory-enabled tools.
    pub fn summary(&self) -> TraceSummary {
        let corrections = self.corrections();
        let recent_corrections = corrections
            .iter()
            .rev()
            .take(RECENT_CORRECTIONS)
            .rev()
            .cloned()
            .collect();

        let mut attachment_inventory: Vec<FileRef> = Vec::new();
        for entry in &self.entries {
            for file in &entry.attachments {
                if !attachment_inventory.iter().any(|f| f.path == file.path) {
                    attachment_inventory.push(file.clone());
                }
            }
        }

        TraceSummary {
            commitments: self.commitments(),
            past_attempts: self
                .entries
                .iter()
                .filter(|e| e.outcome == Outcome::Failed)
                .count() as u32,
            recent_corrections,
            attachment_inventory,
        }
    }

    /// Short text digest for the planner prompt.
    pub fn render_digest(&self) -> String {
        let summary = self.summary();
        let mut digest = String::new();
        if !summary.commitments.is_empty() {
            let tags: Vec<_> = summary.commitments.iter().map(|t| t.as_str()).collect();
            digest.push_str(&format!("Active commitments: {}\n", tags.join(", ")));
        }
        if summary.past_attempts > 0 {
            digest.push_str(&format!("Failed attempts so far: {}\n", summary.past_attempts));
        }
        for correction in &summary.recent_corrections {
            digest.push_str(&format!("Correction: {correction}\n"));
        }
        if !summary.attachment_inventory.is_empty() {
            let paths: Vec<_> = summary
                .attachment_inventory
                .iter()
                .map(|f| f.path.display().to_string())
                .collect();
            digest.push_str(&format!("Files produced: {}\n", paths.join(", ")));
        }
        digest
    }
}
