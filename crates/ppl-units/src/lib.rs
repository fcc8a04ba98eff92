// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ppl-units
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Text chunking.
pub mod chunk;
/// Image grouping.
pub mod image;
/// Document loading from connectors.
pub mod loader;
/// Table row parsing.
pub mod table;

pub use chunk::{ChunkOptions, chunk_document};
pub use image::group_blobs;
pub use loader::load_documents;
pub use table::rows_from_document;

use ppl_core::config::UnitSpec;
use ppl_core::{Document, EngineError, ExecutionUnit, Manifest, ManifestEntry};

/// Turn a document set into execution units per the unit specification.
///
/// Unit order is deterministic: documents in load order, members in document
/// order.
///
/// # Errors
///
/// Returns [`EngineError::Processing`] for unreadable tables (including the
/// source URI) unless `continue_on_error` attributes the failure to single
/// rows.
pub fn units_for(
    docs: &[Document],
    spec: &UnitSpec,
    continue_on_error: bool,
) -> Result<Vec<ExecutionUnit>, EngineError> {
    let mut units = Vec::new();
    for doc in docs {
        match spec {
            UnitSpec::Text {
                splitter,
                max_tokens,
                overlap,
            } => {
                let opts = ChunkOptions {
                    splitter: *splitter,
                    max_tokens: *max_tokens,
                    overlap: *overlap,
                    ..ChunkOptions::default()
                };
                for chunk in chunk_document(doc, &opts) {
                    units.push(ExecutionUnit::Chunk(chunk));
                }
            }
            UnitSpec::Table {
                text_column,
                pass_through,
                header_row,
            } => {
                let rows = rows_from_document(
                    doc,
                    text_column,
                    pass_through,
                    *header_row,
                    continue_on_error,
                )?;
                for row in rows {
                    units.push(ExecutionUnit::Row(row));
                }
            }
            UnitSpec::Images { group_size } => {
                for group in group_blobs(doc, *group_size) {
                    units.push(ExecutionUnit::Images(group));
                }
            }
        }
    }
    Ok(units)
}

/// Build the run manifest from the loaded documents and produced units.
pub fn build_manifest(docs: &[Document], units: &[ExecutionUnit]) -> Manifest {
    let mut manifest = Manifest::default();
    for doc in docs {
        let entry = manifest.docs.entry(doc.id.clone()).or_default();
        entry.blob_ids = doc.blobs.iter().map(|b| b.id.clone()).collect();
    }
    for unit in units {
        match unit {
            ExecutionUnit::Chunk(chunk) => {
                manifest
                    .docs
                    .entry(chunk.doc_id.clone())
                    .or_insert_with(ManifestEntry::default)
                    .chunk_ids
                    .push(chunk.id.clone());
            }
            ExecutionUnit::Row(row) => {
                *manifest.row_counts.entry(row.source_uri.clone()).or_insert(0) += 1;
            }
            ExecutionUnit::Images(_) => {}
        }
    }
    manifest
}
