// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ppl-runtime
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Deterministic artefact writing under a run directory.
pub mod artefacts;
/// Bounded-concurrency fan-out over execution units.
pub mod executor;
/// Run orchestration and the run record.
pub mod run;
/// Output serialisation: JSONL, CSV, columnar, compression.
pub mod serialize;

pub use artefacts::ArtifactWriter;
pub use executor::{ExecutionReport, Executor, UnitRecord};
pub use run::{RunSummary, Runner};
pub use serialize::{ColumnarEncoder, serialize_records};
