//! Configuration
//!
//! A single structured file drives the kernel. Format is auto-detected
//! from the extension (TOML, YAML, JSON), `${VAR}` references are expanded
//! from the environment before parsing, and every key has a serde default
//! so a partial file is always valid. Environment variables prefixed
//! `OTTO__` override file values (`OTTO__EXECUTOR__MAX_PARALLEL_STEPS=8`).

use config::{Config as Cfg, Environment, File, FileFormat};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

fn default_true() -> bool {
    true
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_step_timeout() -> u64 {
    60
}

fn default_capture_fallback() -> u64 {
    300
}

fn default_exemplar_budget() -> usize {
    2_000
}

fn default_parse_retries() -> u32 {
    2
}

fn default_reflector_retries() -> u32 {
    2
}

fn default_write_behind() -> u64 {
    30
}

fn default_session_dir() -> String {
    "./sessions".to_string()
}

/// `reasoning_trace.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TraceSection {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// `executor.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Upper bound on concurrently running steps.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    /// Per-step deadline in seconds when the descriptor declares none.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_default: u64,
    /// How long the synchronous entry point waits for full pipeline
    /// completion when the result capture never fires.
    #[serde(default = "default_capture_fallback")]
    pub result_capture_fallback_seconds: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            step_timeout_default: default_step_timeout(),
            result_capture_fallback_seconds: default_capture_fallback(),
        }
    }
}

/// `planner.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSection {
    /// Token ceiling for few-shot exemplars in the planning prompt.
    #[serde(default = "default_exemplar_budget")]
    pub exemplar_token_budget: usize,
    /// Bounded retries when the LLM output does not parse.
    #[serde(default = "default_parse_retries")]
    pub max_parse_retries: u32,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            exemplar_token_budget: default_exemplar_budget(),
            max_parse_retries: default_parse_retries(),
        }
    }
}

/// `reflector.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectorSection {
    /// Reflections allowed per interaction before giving up.
    #[serde(default = "default_reflector_retries")]
    pub max_retries: u32,
}

impl Default for ReflectorSection {
    fn default() -> Self {
        Self {
            max_retries: default_reflector_retries(),
        }
    }
}

/// `memory.*`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_write_behind")]
    pub write_behind_interval_seconds: u64,
    /// Directory holding one JSONL file per session.
    #[serde(default = "default_session_dir")]
    pub session_dir: String,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            write_behind_interval_seconds: default_write_behind(),
            session_dir: default_session_dir(),
        }
    }
}

/// `validator.*`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorSection {
    /// Surface a user-visible status event when an auto-repair changes
    /// the plan's meaning. The trace records repairs regardless.
    #[serde(default)]
    pub announce_repairs: bool,
}

/// Root configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OttoConfig {
    #[serde(default)]
    pub reasoning_trace: TraceSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub planner: PlannerSection,
    #[serde(default)]
    pub reflector: ReflectorSection,
    #[serde(default)]
    pub memory: MemorySection,
    #[serde(default)]
    pub validator: ValidatorSection,
}

impl OttoConfig {
    /// Load from a file, expanding `${VAR}` and applying `OTTO__*`
    /// environment overrides.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        let raw = std::fs::read_to_string(path)?;
        let expanded = substitute_env_vars(&raw);

        let cfg = Cfg::builder()
            .add_source(File::from_str(&expanded, format))
            .add_source(Environment::with_prefix("OTTO").separator("__"))
            .build()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Detect configuration format from file extension.
fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "toml" => Ok(FileFormat::Toml),
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "json" => Ok(FileFormat::Json),
        other => Err(ConfigError::UnsupportedFormat(other.to_string())),
    }
}

/// Expand `${VAR}` from the process environment; unknown variables are
/// left untouched.
fn substitute_env_vars(raw: &str) -> String {
    ENV_VAR
        .replace_all(raw, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
