// SPDX-License-Identifier: MIT OR Apache-2.0
//! Prompt registry with content-hashed entries.

use crate::error::EngineError;
use crate::identity;
use std::collections::BTreeMap;

/// A registered prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptEntry {
    /// Registry id.
    pub id: String,
    /// Version tag.
    pub version: String,
    /// Template text.
    pub template: String,
    /// Content hash of the template text (`prompt_<hex>`).
    pub content_hash: String,
}

/// Explicit registry of prompt templates, keyed by `(id, version)`.
#[derive(Debug, Clone, Default)]
pub struct PromptRegistry {
    entries: BTreeMap<(String, String), PromptEntry>,
}

impl PromptRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template, replacing any previous entry for the same
    /// `(id, version)`. Returns the content hash.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        version: impl Into<String>,
        template: impl Into<String>,
    ) -> String {
        let id = id.into();
        let version = version.into();
        let template = template.into();
        let content_hash = identity::prompt_hash(&template);
        self.entries.insert(
            (id.clone(), version.clone()),
            PromptEntry {
                id,
                version,
                template,
                content_hash: content_hash.clone(),
            },
        );
        content_hash
    }

    /// Look up an entry.
    pub fn get(&self, id: &str, version: &str) -> Option<&PromptEntry> {
        self.entries.get(&(id.to_string(), version.to_string()))
    }

    /// Resolve an entry a step references.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the reference is unknown.
    pub fn resolve(&self, id: &str, version: &str) -> Result<&PromptEntry, EngineError> {
        self.get(id, version).ok_or_else(|| {
            EngineError::Config(format!("unknown prompt reference: {id}#{version}"))
        })
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
