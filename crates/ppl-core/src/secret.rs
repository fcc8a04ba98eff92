// SPDX-License-Identifier: MIT OR Apache-2.0
//! Secret cache and log redaction.
//!
//! Secrets are resolved eagerly at startup and cached by logical name. They
//! are injected into provider adapters only; the template scope never sees
//! them, and the [`Redactor`] strips their values from anything the engine
//! writes or logs.

use crate::contract::SecretSource;
use crate::error::EngineError;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// SecretCache
// ---------------------------------------------------------------------------

/// In-memory cache of resolved secrets, keyed by logical name.
#[derive(Default)]
pub struct SecretCache {
    values: BTreeMap<String, String>,
}

impl std::fmt::Debug for SecretCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Values are intentionally absent from the debug form.
        f.debug_struct("SecretCache")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretCache {
    /// Resolve every logical name once through the source and cache the
    /// results.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Secret`] for the first name that fails to
    /// resolve.
    pub async fn resolve_all(
        source: &dyn SecretSource,
        names: &[String],
    ) -> Result<Self, EngineError> {
        let mut values = BTreeMap::new();
        for name in names {
            if values.contains_key(name) {
                continue;
            }
            let value = source.resolve(name).await?;
            values.insert(name.clone(), value);
        }
        Ok(Self { values })
    }

    /// Look up a cached secret by logical name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Number of cached secrets.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Build a [`Redactor`] over every cached value.
    pub fn redactor(&self) -> Redactor {
        Redactor {
            values: self.values.values().cloned().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Redactor
// ---------------------------------------------------------------------------

/// Mask substituted for secret values in logs and artefacts.
pub const REDACTION_MASK: &str = "****";

/// Substring-replaces registered secret values with [`REDACTION_MASK`].
#[derive(Clone, Default)]
pub struct Redactor {
    values: Vec<String>,
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("registered", &self.values.len())
            .finish()
    }
}

impl Redactor {
    /// An empty redactor that passes text through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an additional secret value. Empty values are ignored.
    pub fn register(&mut self, value: impl Into<String>) {
        let value = value.into();
        if !value.is_empty() {
            self.values.push(value);
        }
    }

    /// Replace every occurrence of every registered value with the mask.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), REDACTION_MASK);
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
