// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retrieval attachment: bind ranked context into a step's scope.
//!
//! Runs strictly before dispatch, so a retrieval failure can never mask a
//! model result. Called at most once per step per unit.

use ppl_core::config::RetrievalBinding;
use ppl_core::contract::{RetrievalPipeline, RetrievalRequest};
use ppl_core::{Blob, EngineError};
use ppl_template::Scope;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One line of the per-run retrieval log (`rag/<pipeline>.jsonl`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalLogEntry {
    /// Unit the retrieval ran for.
    pub unit_id: String,
    /// Step the retrieval ran for.
    pub step_id: String,
    /// The rendered query.
    pub query: String,
    /// Provenance ids of every returned item, text first.
    pub item_ids: Vec<String>,
}

/// The bound result of one retrieval call.
#[derive(Debug)]
pub struct Attachment {
    /// Scope variable receiving the joined text context.
    pub text_var: String,
    /// Newline-joined text items, truncated to the binding's character cap.
    pub text: String,
    /// Scope variable naming the attached images.
    pub image_var: String,
    /// Image blobs to attach to the step's multimodal request.
    pub blobs: Vec<Blob>,
    /// Log entry for the run's retrieval trail.
    pub log: RetrievalLogEntry,
}

/// Render the binding's query against the unit scope, invoke the pipeline,
/// and bind the results.
///
/// # Errors
///
/// Propagates template errors from the query and failures from the
/// retrieval pipeline; the caller decides whether `continue_on_error`
/// attributes them to the unit.
pub async fn attach(
    pipeline: &dyn RetrievalPipeline,
    binding: &RetrievalBinding,
    scope: &Scope,
    unit_id: &str,
    step_id: &str,
) -> Result<Attachment, EngineError> {
    let query = ppl_template::render(&binding.query, scope)?;
    let request = RetrievalRequest {
        top_k_text: binding.top_k_text,
        top_k_images: binding.top_k_images,
    };
    let result = pipeline.retrieve(&query, &request).await?;

    let mut item_ids: Vec<String> = Vec::new();
    let mut lines: Vec<&str> = Vec::new();
    for item in &result.text_items {
        item_ids.push(item.id.clone());
        if let Some(text) = &item.text {
            lines.push(text);
        }
    }
    let mut text = lines.join("\n");
    if text.chars().count() > binding.max_chars {
        text = text.chars().take(binding.max_chars).collect();
    }

    let mut blobs = Vec::new();
    for item in &result.image_items {
        item_ids.push(item.id.clone());
        if let Some(blob) = &item.blob {
            blobs.push(blob.clone());
        }
    }

    debug!(
        target: "ppl.infer",
        pipeline = pipeline.name(),
        unit = unit_id,
        step = step_id,
        text_items = result.text_items.len(),
        image_items = result.image_items.len(),
        "retrieval attached"
    );

    Ok(Attachment {
        text_var: binding.text_var.clone(),
        text,
        image_var: binding.image_var.clone(),
        blobs,
        log: RetrievalLogEntry {
            unit_id: unit_id.to_string(),
            step_id: step_id.to_string(),
            query,
            item_ids,
        },
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
