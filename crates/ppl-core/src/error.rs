// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy with stable machine-readable kinds.
//!
//! Every engine failure is an [`EngineError`]. Each variant maps onto a
//! stable [`ErrorKind`] tag used in artefacts and counters, and onto a
//! deterministic process exit class.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable, stable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid or missing configuration.
    Config,
    /// Source I/O, authorization, or missing resource.
    Connector,
    /// Unit iteration, interpolation, or parsing failure.
    Processing,
    /// Provider I/O, streaming failure, deadline exceeded, cancelled.
    Inference,
    /// Provider capability contract violation.
    Provider,
    /// Sink write failure.
    Export,
    /// Secret resolution failure.
    Secret,
}

impl ErrorKind {
    /// Stable string tag (e.g. `"processing"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Connector => "connector",
            Self::Processing => "processing",
            Self::Inference => "inference",
            Self::Provider => "provider",
            Self::Export => "export",
            Self::Secret => "secret",
        }
    }

    /// Deterministic exit class for run-level failures of this kind.
    pub fn exit_class(&self) -> i32 {
        match self {
            Self::Config => 2,
            Self::Connector => 3,
            Self::Processing => 4,
            Self::Inference => 5,
            Self::Provider => 6,
            Self::Export => 7,
            Self::Secret => 8,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Connector sub-kinds
// ---------------------------------------------------------------------------

/// Failure classes reported by connectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorErrorKind {
    /// The resource does not exist.
    NotFound,
    /// The caller is not authorised to read the resource.
    Permission,
    /// A retryable transport failure.
    Transient,
    /// A selector pattern could not be compiled.
    InvalidSelector,
}

impl fmt::Display for ConnectorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Permission => "permission",
            Self::Transient => "transient",
            Self::InvalidSelector => "invalid_selector",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Unified engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or missing configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Source connector failure.
    #[error("connector failure ({kind}): {message}")]
    Connector {
        /// Connector failure class.
        kind: ConnectorErrorKind,
        /// Human-readable detail.
        message: String,
    },

    /// Unit iteration, interpolation, or output parsing failure.
    #[error("processing failed: {message}")]
    Processing {
        /// Human-readable detail.
        message: String,
        /// Unit the failure is attributed to, when known.
        unit_id: Option<String>,
    },

    /// Provider I/O, streaming failure, deadline exceeded, or cancellation.
    #[error("inference failed: {message}")]
    Inference {
        /// Human-readable detail.
        message: String,
        /// Whether the retry controller may re-attempt the call.
        transient: bool,
    },

    /// Provider capability contract violation (never retried).
    #[error("provider error: {0}")]
    Provider(String),

    /// Export sink failure.
    #[error("export failed: {0}")]
    Export(String),

    /// Secret resolution failure.
    #[error("secret resolution failed: {0}")]
    Secret(String),
}

impl EngineError {
    /// A non-transient inference failure.
    pub fn inference(message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
            transient: false,
        }
    }

    /// A transient inference failure (429/5xx/throttle/connection).
    pub fn inference_transient(message: impl Into<String>) -> Self {
        Self::Inference {
            message: message.into(),
            transient: true,
        }
    }

    /// A processing failure without unit attribution.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
            unit_id: None,
        }
    }

    /// The fixed error raised when a retry deadline expires.
    pub fn deadline_exceeded() -> Self {
        Self::inference("deadline_exceeded")
    }

    /// The fixed error raised when execution is cancelled.
    pub fn cancelled() -> Self {
        Self::inference("cancelled")
    }

    /// The stable [`ErrorKind`] for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Connector { .. } => ErrorKind::Connector,
            Self::Processing { .. } => ErrorKind::Processing,
            Self::Inference { .. } => ErrorKind::Inference,
            Self::Provider(_) => ErrorKind::Provider,
            Self::Export(_) => ErrorKind::Export,
            Self::Secret(_) => ErrorKind::Secret,
        }
    }

    /// Whether the retry controller may re-attempt the failed call.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Inference { transient, .. } => *transient,
            Self::Connector { kind, .. } => matches!(kind, ConnectorErrorKind::Transient),
            _ => false,
        }
    }

    /// Whether this error is the cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Inference { message, .. } if message == "cancelled")
    }

    /// Build the serialisable record for artefacts and counters.
    pub fn record(&self, unit_id: Option<&str>, step_id: Option<&str>) -> ErrorRecord {
        let unit = match self {
            Self::Processing { unit_id: u, .. } => u.clone().or_else(|| unit_id.map(String::from)),
            _ => unit_id.map(String::from),
        };
        ErrorRecord {
            kind: self.kind(),
            message: self.to_string(),
            unit_id: unit,
            step_id: step_id.map(String::from),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorRecord
// ---------------------------------------------------------------------------

/// Serialisable error snapshot attributed to a unit and step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stable error kind.
    pub kind: ErrorKind,
    /// Sanitised human-readable message.
    pub message: String,
    /// Unit the failure is attributed to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    /// Step the failure is attributed to, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
