//! Tool registry
//!
//! Name → invocable with O(1) lookup. Registration is static per process:
//! everything is registered at startup and the registry is read-only
//! afterwards. The registry also renders the catalog view the planner
//! prompt embeds; the rendered string is cached and keyed by a content
//! hash so it is reused across requests until a registration changes it.

use super::{Tool, ToolDescriptor};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Registry operation errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    Duplicate(String),

    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("No terminal reply tool registered")]
    NoTerminalTool,

    #[error("More than one terminal reply tool registered: {0} and {1}")]
    MultipleTerminalTools(String, String),
}

/// Name → invocable, with a cached catalog view.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    catalog_cache: Mutex<Option<(String, String)>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            catalog_cache: Mutex::new(None),
        }
    }

    /// Register a tool. Returns [`RegistryError::Duplicate`] if the name is
    /// taken, [`RegistryError::MultipleTerminalTools`] if a second terminal
    /// tool is offered.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.descriptor().name.clone();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        if tool.descriptor().terminal {
            if let Some(existing) = self.terminal_descriptor_opt() {
                return Err(RegistryError::MultipleTerminalTools(
                    existing.name.clone(),
                    name,
                ));
            }
        }
        self.tools.insert(name, tool);
        *self.catalog_cache.lock() = None;
        Ok(())
    }

    /// Look up an invocable by action name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Look up a descriptor by action name.
    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name).map(|t| t.descriptor())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All descriptors, sorted by name for deterministic iteration.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut all: Vec<_> = self.tools.values().map(|t| t.descriptor()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    fn terminal_descriptor_opt(&self) -> Option<&ToolDescriptor> {
        self.tools
            .values()
            .map(|t| t.descriptor())
            .find(|d| d.terminal)
    }

    /// The descriptor of the terminal reply action.
    pub fn terminal_descriptor(&self) -> Result<&ToolDescriptor, RegistryError> {
        self.terminal_descriptor_opt()
            .ok_or(RegistryError::NoTerminalTool)
    }

    /// Content hash of the catalog, stable across processes for the same
    /// registrations.
    pub fn catalog_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for descriptor in self.descriptors() {
            hasher.update(descriptor.name.as_bytes());
            hasher.update(descriptor.description.as_bytes());
            hasher.update(descriptor.parameter_schema.to_string().as_bytes());
        }
        let digest = hasher.finalize();
        format!("{digest:x}")
    }

    /// Rendered catalog view for the planner prompt: one entry per tool
    /// with its one-line description and declared parameter schema.
    /// Reused from cache until the content hash changes.
    pub fn catalog(&self) -> String {
        let hash = self.catalog_hash();
        {
            let cache = self.catalog_cache.lock();
            if let Some((cached_hash, rendered)) = cache.as_ref() {
                if *cached_hash == hash {
                    return rendered.clone();
                }
            }
        }
        let mut rendered = String::new();
        for descriptor in self.descriptors() {
            rendered.push_str(&format!(
                "- {} — {}\n  parameters: {}\n",
                descriptor.name, descriptor.description, descriptor.parameter_schema
            ));
        }
        *self.catalog_cache.lock() = Some((hash, rendered.clone()));
        rendered
    }
}
