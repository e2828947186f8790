//! Otto Kernel
//!
//! Data model and leaf components of the orchestration pipeline: the plan
//! and step-result types, the shared template resolver, the tool registry,
//! the per-interaction reasoning trace, the plan validator/repairer, the
//! session store, and the contracts for the language-model backend and the
//! chat transport.

// error module
pub mod error;
pub use error::{ErrorKind, KernelError, KernelResult};

// plan data model
pub mod plan;
pub use plan::{FileKind, FileRef, Plan, Step, StepResult, StepStatus};

// template resolver
pub mod resolver;
pub use resolver::{ResolutionReport, resolve_parameters};

// tool dispatch surface
pub mod tool;
pub use tool::{Capability, Tool, ToolContext, ToolDescriptor, ToolRegistry};

// reasoning trace & session memory
pub mod trace;
pub use trace::{CommitmentTag, ReasoningTrace, Stage, TraceSummary, detect_commitments};

// session state & persistence
pub mod session;
pub use session::{FinalReply, Interaction, InteractionStatus, Session, SessionStore};

// plan validator/repairer
pub mod validator;
pub use validator::{PlanValidator, ValidationReport};

// configuration
pub mod config;
pub use config::OttoConfig;

// language-model backend contract
pub mod llm;
pub use llm::{CompletionRequest, LanguageModel, LlmError};

// chat transport events
pub mod event;
pub use event::{AgentEvent, EventEnvelope, EventSender, InboundMessage};
