// SPDX-License-Identifier: MIT OR Apache-2.0
//! External-collaborator traits.
//!
//! The engine consumes connectors, providers, secret sources, and retrieval
//! pipelines, and exposes the export sink contract. Implementations live
//! outside this workspace (the in-memory doubles in `ppl-mock` exist for
//! tests); everything here is interface.

use crate::error::EngineError;
use crate::{Blob, CallParams, Completion, Message, Resource, TokenChunk};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// A typed source of resources.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Enumerate resources matching the given glob selectors.
    ///
    /// Include/exclude semantics are caller-controlled; the connector only
    /// matches.
    async fn list(&self, selectors: &[String]) -> Result<Vec<Resource>, EngineError>;

    /// Open a resource for reading.
    ///
    /// The returned reader owns its underlying handle; dropping it releases
    /// the acquisition on every exit path.
    async fn open(
        &self,
        resource: &Resource,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, EngineError>;

    /// Refresh a resource descriptor (`etag_or_hash`, `size_bytes`).
    async fn info(&self, resource: &Resource) -> Result<Resource, EngineError> {
        Ok(resource.clone())
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// A provider adapter wrapping one LLM endpoint behind a uniform contract.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider name, used in telemetry labels and error messages.
    fn name(&self) -> &str;

    /// Whether [`stream`](Provider::stream) is usable.
    fn supports_streaming(&self) -> bool;

    /// One regular completion call.
    async fn complete(
        &self,
        messages: &[Message],
        params: &CallParams,
    ) -> Result<Completion, EngineError>;

    /// One streaming call. The channel yields deltas in arrival order and
    /// ends with a terminal [`TokenChunk`] carrying the final [`Completion`].
    ///
    /// Mid-stream failures arrive as `Err` items; the channel closes after
    /// the terminal chunk or the first error.
    async fn stream(
        &self,
        messages: &[Message],
        params: &CallParams,
    ) -> Result<mpsc::Receiver<Result<TokenChunk, EngineError>>, EngineError>;
}

// ---------------------------------------------------------------------------
// Secrets
// ---------------------------------------------------------------------------

/// Resolves logical credential names to values at startup.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Resolve one logical name. Called once per name per run; results are
    /// cached by the engine.
    async fn resolve(&self, logical_name: &str) -> Result<String, EngineError>;
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// Item limits for one retrieval call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    /// Maximum text items to return.
    pub top_k_text: u32,
    /// Maximum image items to return.
    pub top_k_images: u32,
}

/// One ranked retrieval result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedItem {
    /// Provenance identifier of the item.
    pub id: String,
    /// Text payload, for text items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Image payload, for image items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<Blob>,
    /// Relevance score, if the pipeline reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// The result of one retrieval call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// Ranked text items.
    pub text_items: Vec<RetrievedItem>,
    /// Ranked image items.
    pub image_items: Vec<RetrievedItem>,
}

/// A prebuilt retrieval pipeline. Called at most once per step per unit.
#[async_trait]
pub trait RetrievalPipeline: Send + Sync {
    /// Stable pipeline name, used for the retrieval log path.
    fn name(&self) -> &str;

    /// Retrieve ranked context items for a rendered query.
    async fn retrieve(
        &self,
        query: &str,
        request: &RetrievalRequest,
    ) -> Result<RetrievalResult, EngineError>;
}

// ---------------------------------------------------------------------------
// Export sinks
// ---------------------------------------------------------------------------

/// How records land in the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Append to existing data (default).
    #[default]
    Append,
    /// Replace existing data. Must be staged atomically by the sink
    /// (stage, verify, swap).
    Overwrite,
    /// Merge on `key_fields`. Atomicity across records is sink-defined;
    /// only per-call atomicity is guaranteed by the contract.
    Upsert,
}

/// Options for one sink write call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Optional schema hint for typed sinks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    /// Landing semantics.
    #[serde(default)]
    pub write_mode: WriteMode,
    /// Merge keys; required for [`WriteMode::Upsert`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_fields: Vec<String>,
}

impl ExportOptions {
    /// Check mode/key consistency.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when upsert is requested without
    /// `key_fields`.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.write_mode == WriteMode::Upsert && self.key_fields.is_empty() {
            return Err(EngineError::Config(
                "upsert write mode requires key_fields".into(),
            ));
        }
        Ok(())
    }
}

/// Payload handed to a sink: structured records or pre-serialised bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportPayload {
    /// Structured records for typed sinks.
    Records(Vec<serde_json::Value>),
    /// Serialised bytes for byte-oriented sinks.
    Bytes(Vec<u8>),
}

/// Outcome of one sink write call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    /// Records accepted in this call.
    pub records_written: u64,
    /// Bytes accepted in this call.
    pub bytes_written: u64,
}

/// A typed destination for serialised records.
#[async_trait]
pub trait ExportSink: Send + Sync {
    /// Write a payload.
    async fn write(
        &self,
        payload: ExportPayload,
        options: &ExportOptions,
    ) -> Result<ExportResult, EngineError>;

    /// Flush and commit any buffered state.
    async fn finalize(&self) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
