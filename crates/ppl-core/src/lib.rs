// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ppl-core
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Cancellation primitives shared by the dispatcher and the executor.
pub mod cancel;
/// Declarative pipeline configuration surface.
pub mod config;
/// External-collaborator traits: connectors, providers, secrets, retrieval, sinks.
pub mod contract;
/// Unified error taxonomy with stable machine-readable kinds.
pub mod error;
/// Deterministic content-hash identity.
pub mod identity;
/// Prompt registry with content-hashed entries.
pub mod prompts;
/// Secret cache and log redaction.
pub mod secret;
/// Text canonicalisation, token estimation, canonical stringification.
pub mod text;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use config::{InferMode, Pipeline, Step};
pub use error::{EngineError, ErrorKind, ErrorRecord};

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// A logical addressable source produced by a [`Connector`](contract::Connector).
///
/// Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    /// Globally unique source address.
    pub uri: String,
    /// Normalised MIME type (e.g. `text/plain`, `text/csv`, `image/png`).
    pub mime: String,
    /// Payload size in bytes, if the connector knows it.
    pub size_bytes: u64,
    /// Opaque change tag or content hash reported by the connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag_or_hash: Option<String>,
    /// Last-modified timestamp reported by the connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

/// A normalised resource: canonical text and/or binary blobs plus metadata.
///
/// Documents exist only for the duration of a run; chunks and blobs refer to
/// their document by id, never by reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Content-derived id (`doc_<hex>`).
    pub id: String,
    /// URI of the resource this document was normalised from.
    pub source_uri: String,
    /// Canonical UTF-8 text (NFC, LF line endings), when the source is textual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Ordered non-text payloads (images and other binary parts).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blobs: Vec<Blob>,
    /// Scalar metadata (filename, etag, connector-specific keys).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A non-text payload attached to a document.
///
/// Bytes are held in memory for the duration of the run but are never
/// serialised into artefacts; the manifest records blob ids instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Blob {
    /// Content-derived id (`blob_<hex>`).
    pub id: String,
    /// MIME type of the payload.
    pub mime: String,
    /// Raw bytes. Not serialised.
    #[serde(skip)]
    pub bytes: Vec<u8>,
    /// Scalar metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Execution units
// ---------------------------------------------------------------------------

/// A text slice of a document. Order within a document is stable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// Content-derived id (`chunk_<hex>`, covers doc id, offset, and text).
    pub id: String,
    /// Id of the owning document.
    pub doc_id: String,
    /// Chunk text.
    pub text: String,
    /// Approximate token count (whitespace words x configured multiplier).
    pub tokens_estimate: u32,
    /// Byte offset of the chunk within the canonical document text.
    pub offset: u64,
    /// Scalar metadata inherited from the document.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A single table record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Row {
    /// Content-derived id (`row_<hex>`).
    pub id: String,
    /// 0-based position after the header row. Stable across runs.
    pub row_index: u64,
    /// Pass-through column values in source column order.
    pub values: serde_json::Map<String, serde_json::Value>,
    /// URI of the table resource.
    pub source_uri: String,
    /// Filename component of the source, for template convenience.
    pub filename: String,
    /// Text derived from the configured text column(s). May be empty.
    pub text: String,
}

/// An ordered set of blobs bound together for one multimodal call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageGroup {
    /// Stable group id derived from the member blob ids (`grp_<hex>`).
    pub id: String,
    /// Id of the owning document.
    pub doc_id: String,
    /// Member blobs in document order.
    pub blobs: Vec<Blob>,
    /// Optional textual caption for the group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

impl ImageGroup {
    /// Ids of the member blobs, in order.
    pub fn blob_ids(&self) -> Vec<String> {
        self.blobs.iter().map(|b| b.id.clone()).collect()
    }
}

/// A single, indivisible input to a model call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionUnit {
    /// A text chunk.
    Chunk(Chunk),
    /// A table row.
    Row(Row),
    /// An image group.
    Images(ImageGroup),
}

impl ExecutionUnit {
    /// The unit's deterministic id.
    pub fn id(&self) -> &str {
        match self {
            Self::Chunk(c) => &c.id,
            Self::Row(r) => &r.id,
            Self::Images(g) => &g.id,
        }
    }

    /// The owning document id, when the unit derives from a document.
    pub fn doc_id(&self) -> Option<&str> {
        match self {
            Self::Chunk(c) => Some(&c.doc_id),
            Self::Images(g) => Some(&g.doc_id),
            Self::Row(_) => None,
        }
    }

    /// The unit's primary text, when it has one.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Chunk(c) => Some(&c.text),
            Self::Row(r) => Some(&r.text),
            Self::Images(g) => g.caption.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider messages
// ---------------------------------------------------------------------------

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System instruction.
    System,
    /// End-user turn.
    User,
    /// Model turn.
    Assistant,
    /// Tool result turn.
    Tool,
}

/// Message content: plain text or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    /// Plain text content.
    Text(String),
    /// Multimodal content parts.
    Parts(Vec<ContentPart>),
}

/// A single content part inside a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// A text fragment.
    Text {
        /// The fragment.
        text: String,
    },
    /// Inline image bytes. Bytes are not serialised into artefacts.
    ImageBytes {
        /// Image MIME type.
        mime: String,
        /// Raw bytes, held in memory only.
        #[serde(skip)]
        bytes: Vec<u8>,
    },
    /// An image referenced by URI.
    ImageUri {
        /// The image location.
        uri: String,
    },
}

/// An ordered chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who is speaking.
    pub role: Role,
    /// What is said.
    pub content: Content,
}

impl Message {
    /// A system message with plain text content.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Content::Text(text.into()),
        }
    }

    /// A user message with plain text content.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::Text(text.into()),
        }
    }

    /// A user message with multimodal parts.
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: Content::Parts(parts),
        }
    }

    /// An assistant message with plain text content.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Content::Text(text.into()),
        }
    }
}

/// Provider call parameters. `extra` carries provider-opaque knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CallParams {
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Completion token budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Provider-opaque extras, passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Completions and streaming
// ---------------------------------------------------------------------------

/// The atom returned by a provider for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    /// Full completion text.
    pub text: String,
    /// Provider finish reason, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Prompt token count, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_prompt: Option<u64>,
    /// Completion token count, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_completion: Option<u64>,
    /// Raw provider payload for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_parts: Option<serde_json::Value>,
}

/// A streaming atom. The terminal chunk carries the final [`Completion`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenChunk {
    /// Incremental text delta. Empty on the terminal chunk.
    pub delta: String,
    /// Provider-assigned chunk index, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    /// Final completion metadata; present only on the terminal chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion: Option<Completion>,
}

impl TokenChunk {
    /// A plain delta chunk.
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            index: None,
            completion: None,
        }
    }

    /// The terminal chunk carrying final completion metadata.
    pub fn terminal(completion: Completion) -> Self {
        Self {
            delta: String::new(),
            index: None,
            completion: Some(completion),
        }
    }

    /// Whether this chunk ends the stream.
    pub fn is_terminal(&self) -> bool {
        self.completion.is_some()
    }
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

/// Per-call measurement record, returned by value from the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceTelemetry {
    /// Whether tokens were actually streamed.
    pub streaming: bool,
    /// The mode the dispatcher resolved to.
    pub selected_mode: InferMode,
    /// Why the dispatcher fell back to a regular call, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// Milliseconds from dispatch to first token (streaming) or to the
    /// completion return (regular, equal to `latency_ms`).
    pub ttfb_ms: u64,
    /// Total call latency in milliseconds.
    pub latency_ms: u64,
    /// Number of streamed chunks (0 for regular calls).
    pub chunk_count: u64,
    /// Output tokens: provider-reported when present, otherwise a fast
    /// estimate. Partial tokens from an abandoned stream are never counted.
    pub tokens_out: u64,
    /// Retry/rate-controller attempts beyond the first.
    pub retries: u64,
}

/// Serialisable per-step aggregate, embedded in the [`RunRecord`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepTelemetrySnapshot {
    /// Total provider calls made for the step (including repairs).
    pub calls: u64,
    /// Calls that actually streamed.
    pub streamed: u64,
    /// Last fallback reason observed, if any call fell back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    /// Calls that recorded a fallback.
    pub fallbacks: u64,
    /// Whether any call in this step streamed tokens.
    pub streaming: bool,
    /// Sum of time-to-first-byte across calls, in milliseconds.
    pub ttfb_ms_total: u64,
    /// Sum of latencies across calls, in milliseconds.
    pub latency_ms_total: u64,
    /// Maximum single-call latency, in milliseconds.
    pub latency_ms_max: u64,
    /// Total streamed chunks.
    pub chunk_count: u64,
    /// Total output tokens.
    pub tokens_out: u64,
    /// Total retries beyond first attempts.
    pub retries: u64,
    /// Units whose JSON output could not be enforced.
    pub json_parse_failures: u64,
}

// ---------------------------------------------------------------------------
// Run records and manifests
// ---------------------------------------------------------------------------

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every unit reached its terminal state without error.
    Completed,
    /// At least one unit failed under `continue_on_error`.
    CompletedWithErrors,
    /// The run was cancelled before completion.
    Cancelled,
    /// The run halted on the first error.
    Failed,
}

impl RunStatus {
    /// Stable string form, as written into `run.yaml`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

/// A prompt referenced during a run, with its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptUse {
    /// Registry id, or `"inline"` for inline templates.
    pub id: String,
    /// Registry version, or the step id for inline templates.
    pub version: String,
    /// Content hash of the template text.
    pub content_hash: String,
}

/// Whole-run counter totals embedded in the [`RunRecord`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTotals {
    /// Units produced by the unit iterator.
    pub units_total: u64,
    /// Units that reached `EMITTED`.
    pub units_emitted: u64,
    /// Units that reached `FAILED`.
    pub units_failed: u64,
    /// Provider calls across all steps.
    pub calls: u64,
    /// Retries beyond first attempts across all steps.
    pub retries: u64,
    /// Calls that fell back from streaming to regular.
    pub fallbacks: u64,
    /// Units whose JSON output could not be enforced.
    pub json_parse_failures: u64,
    /// Total output tokens.
    pub tokens_out: u64,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
}

/// Audit artefact written exactly once at run end (`run.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run identifier (`YYYYMMDDTHHMMSSZ[-<random>]`).
    pub run_id: String,
    /// Terminal status.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Content hash of the pipeline description.
    pub config_hash: String,
    /// Every prompt used, with content hashes.
    pub prompts_used: Vec<PromptUse>,
    /// Whole-run counter totals.
    pub metrics: RunTotals,
    /// Per-step telemetry aggregates, keyed by step id.
    pub step_telemetry: BTreeMap<String, StepTelemetrySnapshot>,
    /// Every artefact written during the run, relative to the run directory.
    pub artefact_paths: Vec<String>,
}

/// Per-document membership entry in the [`Manifest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Chunk ids in document order.
    pub chunk_ids: Vec<String>,
    /// Blob ids in document order.
    pub blob_ids: Vec<String>,
}

/// Authoritative mapping of document ids to chunk/blob ids for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Document id to member ids.
    pub docs: BTreeMap<String, ManifestEntry>,
    /// Row counts per table source URI.
    pub row_counts: BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Serialisation discipline --

    #[test]
    fn blob_bytes_are_not_serialised() {
        let blob = Blob {
            id: "blob_0000000000000000".into(),
            mime: "image/png".into(),
            bytes: vec![1, 2, 3],
            metadata: BTreeMap::new(),
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert!(!json.contains("bytes"));
        let back: Blob = serde_json::from_str(&json).unwrap();
        assert!(back.bytes.is_empty());
        assert_eq!(back.mime, "image/png");
    }

    #[test]
    fn execution_unit_tagging() {
        let unit = ExecutionUnit::Row(Row {
            id: "row_0000000000000001".into(),
            row_index: 3,
            values: serde_json::Map::new(),
            source_uri: "mem://t.csv".into(),
            filename: "t.csv".into(),
            text: "hello".into(),
        });
        let json = serde_json::to_value(&unit).unwrap();
        assert_eq!(json["kind"], "row");
        assert_eq!(unit.id(), "row_0000000000000001");
        assert_eq!(unit.text(), Some("hello"));
        assert!(unit.doc_id().is_none());
    }

    #[test]
    fn content_untagged_roundtrip() {
        let plain = Message::user("hi");
        let json = serde_json::to_string(&plain).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plain);

        let parts = Message::user_parts(vec![
            ContentPart::Text { text: "see".into() },
            ContentPart::ImageUri {
                uri: "mem://a.png".into(),
            },
        ]);
        let json = serde_json::to_string(&parts).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, parts);
    }

    #[test]
    fn token_chunk_terminality() {
        assert!(!TokenChunk::delta("a").is_terminal());
        assert!(TokenChunk::terminal(Completion::default()).is_terminal());
    }

    #[test]
    fn run_status_strings() {
        assert_eq!(RunStatus::Completed.as_str(), "completed");
        assert_eq!(
            RunStatus::CompletedWithErrors.as_str(),
            "completed_with_errors"
        );
        assert_eq!(RunStatus::Cancelled.as_str(), "cancelled");
        assert_eq!(RunStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn run_record_yaml_roundtrip() {
        let record = RunRecord {
            run_id: "20260101T000000Z".into(),
            status: RunStatus::Completed,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            config_hash: "cfg_0000000000000000".into(),
            prompts_used: vec![PromptUse {
                id: "inline".into(),
                version: "echo".into(),
                content_hash: "prompt_0000000000000000".into(),
            }],
            metrics: RunTotals::default(),
            step_telemetry: BTreeMap::new(),
            artefact_paths: vec!["outputs.jsonl".into()],
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn manifest_ordering_is_deterministic() {
        let mut manifest = Manifest::default();
        manifest.docs.insert("doc_b".into(), ManifestEntry::default());
        manifest.docs.insert("doc_a".into(), ManifestEntry::default());
        let json = serde_json::to_string(&manifest).unwrap();
        let a = json.find("doc_a").unwrap();
        let b = json.find("doc_b").unwrap();
        assert!(a < b, "manifest keys must serialise sorted");
    }
}
