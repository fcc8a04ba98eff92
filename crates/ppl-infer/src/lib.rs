// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ppl-infer
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Runtime context: the once-read environment mode override.
pub mod context;
/// The `invoke_with_mode` dispatcher.
pub mod dispatch;
/// JSON enforcement with bounded repair.
pub mod enforce;
/// Retrieval attachment.
pub mod retrieval;

pub use context::{MODE_OVERRIDE_ENV, RuntimeContext};
pub use dispatch::Dispatcher;
pub use enforce::{JsonOutcome, enforce_json};
pub use retrieval::{Attachment, RetrievalLogEntry, attach};
