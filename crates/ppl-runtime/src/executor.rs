// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded-concurrency fan-out over execution units.
//!
//! The engine is a linear chain of steps over a fixed unit set. Within a
//! step, units run in parallel under a semaphore; across steps there is a
//! barrier, and `all.<output>` lists become visible to later steps only
//! after the producing step has fully drained. Completed outputs are
//! collected in unit order regardless of completion order.

use ppl_core::cancel::CancelToken;
use ppl_core::config::{OutputExpectation, StepMode};
use ppl_core::contract::RetrievalPipeline;
use ppl_core::secret::Redactor;
use ppl_core::{
    ContentPart, Document, EngineError, ErrorRecord, ExecutionUnit, InferenceTelemetry, Message,
    Pipeline, Step, StepTelemetrySnapshot,
};
use ppl_infer::retrieval::RetrievalLogEntry;
use ppl_infer::{Dispatcher, JsonOutcome, enforce_json};
use ppl_telemetry::StepTelemetry;
use ppl_template::Scope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One line of `outputs.jsonl`: everything a unit produced across the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    /// The unit's deterministic id.
    pub unit_id: String,
    /// Output values keyed by step `output_name`, in step order.
    pub step_outputs: serde_json::Map<String, Value>,
    /// Failure attribution, when the unit failed under `continue_on_error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

/// What the executor hands back to the runner.
#[derive(Debug)]
pub struct ExecutionReport {
    /// Per-unit records, in unit order.
    pub records: Vec<UnitRecord>,
    /// Per-step telemetry aggregates.
    pub step_telemetry: BTreeMap<String, StepTelemetrySnapshot>,
    /// Retrieval log entries grouped by pipeline name.
    pub rag_logs: BTreeMap<String, Vec<RetrievalLogEntry>>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// The error that halted the run, when `continue_on_error` was off.
    pub halt_error: Option<EngineError>,
    /// Units that reached their terminal `EMITTED` state.
    pub units_emitted: u64,
    /// Units that reached their terminal `FAILED` state.
    pub units_failed: u64,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Everything a unit task needs, cheaply cloneable.
#[derive(Clone)]
struct TaskCtx {
    step: Arc<Step>,
    prompt_text: Arc<String>,
    dispatcher: Arc<Dispatcher>,
    retrieval: Option<Arc<dyn RetrievalPipeline>>,
    docs: Arc<Vec<Document>>,
    all_scope: Arc<BTreeMap<String, Vec<Value>>>,
    run_id: Arc<String>,
    all_join_max_chars: usize,
}

enum UnitOutcome {
    Emitted {
        value: Value,
        include_in_all: bool,
        json_failure: bool,
        telemetry: Vec<InferenceTelemetry>,
        rag: Option<RetrievalLogEntry>,
    },
    Failed {
        error: EngineError,
        telemetry: Vec<InferenceTelemetry>,
        rag: Option<RetrievalLogEntry>,
    },
    Skipped,
}

/// Executes a pipeline's steps over a fixed unit set.
pub struct Executor {
    dispatcher: Arc<Dispatcher>,
    retrievals: BTreeMap<String, Arc<dyn RetrievalPipeline>>,
    redactor: Redactor,
    cancel: CancelToken,
    grace: Duration,
}

impl Executor {
    /// Build an executor.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        retrievals: BTreeMap<String, Arc<dyn RetrievalPipeline>>,
        redactor: Redactor,
        cancel: CancelToken,
    ) -> Self {
        Self {
            dispatcher,
            retrievals,
            redactor,
            cancel,
            grace: Duration::from_secs(5),
        }
    }

    /// Override the cancellation grace period.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Run every step over every unit.
    ///
    /// `prompt_texts` maps step id to its resolved template text.
    pub async fn execute(
        &self,
        pipeline: &Pipeline,
        prompt_texts: &BTreeMap<String, String>,
        units: &[ExecutionUnit],
        docs: Arc<Vec<Document>>,
        run_id: &str,
    ) -> ExecutionReport {
        let mut unit_outputs: Vec<serde_json::Map<String, Value>> =
            vec![serde_json::Map::new(); units.len()];
        let mut unit_errors: Vec<Option<ErrorRecord>> = vec![None; units.len()];
        let mut all_scope: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut step_telemetry: BTreeMap<String, StepTelemetrySnapshot> = BTreeMap::new();
        let mut rag_logs: BTreeMap<String, Vec<RetrievalLogEntry>> = BTreeMap::new();
        let mut halt_error: Option<EngineError> = None;

        for step in &pipeline.steps {
            if halt_error.is_some() || self.cancel.is_cancelled() {
                break;
            }
            let mut aggregator = StepTelemetry::new();
            let prompt_text = Arc::new(
                prompt_texts
                    .get(&step.id)
                    .cloned()
                    .unwrap_or_else(|| step.prompt_template.clone()),
            );
            let ctx = TaskCtx {
                step: Arc::new(step.clone()),
                prompt_text,
                dispatcher: Arc::clone(&self.dispatcher),
                retrieval: step
                    .retrieval
                    .as_ref()
                    .and_then(|b| self.retrievals.get(&b.pipeline).cloned()),
                docs: Arc::clone(&docs),
                all_scope: Arc::new(all_scope.clone()),
                run_id: Arc::new(run_id.to_string()),
                all_join_max_chars: pipeline.all_join_max_chars,
            };

            let semaphore = Arc::new(Semaphore::new(pipeline.concurrency));
            let halted = Arc::new(AtomicBool::new(false));
            let mut join_set: JoinSet<(usize, UnitOutcome)> = JoinSet::new();

            for (idx, unit) in units.iter().enumerate() {
                if unit_errors[idx].is_some() {
                    continue;
                }
                let ctx = ctx.clone();
                let unit = unit.clone();
                let semaphore = Arc::clone(&semaphore);
                let halted = Arc::clone(&halted);
                let cancel = self.cancel.clone();
                let prior = unit_outputs[idx].clone();
                join_set.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (idx, UnitOutcome::Skipped);
                    };
                    if halted.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        return (idx, UnitOutcome::Skipped);
                    }
                    (idx, process_unit(&ctx, &unit, prior).await)
                });
            }

            // Collect in completion order; results land by unit index.
            let mut outcomes: Vec<Option<UnitOutcome>> = Vec::new();
            outcomes.resize_with(units.len(), || None);
            let mut grace_mode = false;
            loop {
                let joined = if self.cancel.is_cancelled() {
                    if !grace_mode {
                        grace_mode = true;
                        info!(target: "ppl.executor", grace_s = self.grace.as_secs(), "cancelled; draining in-flight units");
                    }
                    match tokio::time::timeout(self.grace, join_set.join_next()).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            warn!(target: "ppl.executor", "grace period expired; aborting in-flight units");
                            join_set.abort_all();
                            while join_set.join_next().await.is_some() {}
                            None
                        }
                    }
                } else {
                    join_set.join_next().await
                };
                match joined {
                    Some(Ok((idx, outcome))) => outcomes[idx] = Some(outcome),
                    Some(Err(join_err)) => {
                        if !join_err.is_cancelled() {
                            warn!(target: "ppl.executor", error = %join_err, "unit task panicked");
                        }
                    }
                    None => break,
                }
            }

            // Fold outcomes back into run state, in unit order.
            let mut step_all: Vec<(usize, Value)> = Vec::new();
            for (idx, outcome) in outcomes.into_iter().enumerate() {
                match outcome {
                    Some(UnitOutcome::Emitted {
                        value,
                        include_in_all,
                        json_failure,
                        telemetry,
                        rag,
                    }) => {
                        for call in &telemetry {
                            aggregator.record(call);
                        }
                        if let Some(entry) = rag {
                            let pipeline_name = step
                                .retrieval
                                .as_ref()
                                .map(|b| b.pipeline.clone())
                                .unwrap_or_default();
                            rag_logs.entry(pipeline_name).or_default().push(entry);
                        }
                        if json_failure {
                            aggregator.record_json_failure();
                            ppl_telemetry::global()
                                .incr(&format!("step.{}", step.id), "json_parse_failures");
                            if !pipeline.continue_on_error {
                                // Exhausted enforcement halts the run.
                                let error = EngineError::inference(format!(
                                    "json enforcement exhausted for unit {}",
                                    units[idx].id()
                                ));
                                let record = error.record(Some(units[idx].id()), Some(&step.id));
                                unit_outputs[idx].insert(step.output_name.clone(), value);
                                unit_errors[idx] = Some(record);
                                if halt_error.is_none() {
                                    halted.store(true, Ordering::SeqCst);
                                    halt_error = Some(error);
                                }
                                continue;
                            }
                        }
                        unit_outputs[idx].insert(step.output_name.clone(), value.clone());
                        if include_in_all {
                            step_all.push((idx, value));
                        }
                    }
                    Some(UnitOutcome::Failed {
                        error,
                        telemetry,
                        rag,
                    }) => {
                        for call in &telemetry {
                            aggregator.record(call);
                        }
                        if let Some(entry) = rag {
                            let pipeline_name = step
                                .retrieval
                                .as_ref()
                                .map(|b| b.pipeline.clone())
                                .unwrap_or_default();
                            rag_logs.entry(pipeline_name).or_default().push(entry);
                        }
                        let mut record = error.record(Some(units[idx].id()), Some(&step.id));
                        record.message = self.redactor.redact(&record.message);
                        warn!(
                            target: "ppl.executor",
                            unit = %units[idx].id(),
                            step = %step.id,
                            error = %record.message,
                            "unit failed"
                        );
                        if pipeline.continue_on_error {
                            unit_errors[idx] = Some(record);
                        } else if halt_error.is_none() {
                            halted.store(true, Ordering::SeqCst);
                            unit_errors[idx] = Some(record);
                            halt_error = Some(error);
                        } else {
                            unit_errors[idx] = Some(record);
                        }
                    }
                    Some(UnitOutcome::Skipped) | None => {
                        if self.cancel.is_cancelled() && unit_errors[idx].is_none() {
                            let err = EngineError::cancelled();
                            unit_errors[idx] = Some(err.record(Some(units[idx].id()), Some(&step.id)));
                        }
                    }
                }
            }

            // Publish this step's outputs to later steps, in unit order.
            step_all.sort_by_key(|(idx, _)| *idx);
            all_scope.insert(
                step.output_name.clone(),
                step_all.into_iter().map(|(_, v)| v).collect(),
            );
            step_telemetry.insert(step.id.clone(), aggregator.snapshot());
        }

        let mut units_emitted = 0u64;
        let mut units_failed = 0u64;
        let mut records = Vec::with_capacity(units.len());
        for (idx, unit) in units.iter().enumerate() {
            let error = unit_errors[idx].clone();
            if error.is_some() {
                units_failed += 1;
            } else if !unit_outputs[idx].is_empty() {
                units_emitted += 1;
            }
            records.push(UnitRecord {
                unit_id: unit.id().to_string(),
                step_outputs: unit_outputs[idx].clone(),
                error,
            });
        }

        ExecutionReport {
            records,
            step_telemetry,
            rag_logs,
            cancelled: self.cancel.is_cancelled(),
            halt_error,
            units_emitted,
            units_failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit processing
// ---------------------------------------------------------------------------

fn document_for<'a>(docs: &'a [Document], unit: &ExecutionUnit) -> Option<&'a Document> {
    match unit {
        ExecutionUnit::Chunk(c) => docs.iter().find(|d| d.id == c.doc_id),
        ExecutionUnit::Images(g) => docs.iter().find(|d| d.id == g.doc_id),
        ExecutionUnit::Row(r) => docs.iter().find(|d| d.source_uri == r.source_uri),
    }
}

fn build_scope(ctx: &TaskCtx, unit: &ExecutionUnit, prior: &serde_json::Map<String, Value>) -> Scope {
    let mut scope = Scope::new().with_join_cap(ctx.all_join_max_chars);
    scope.bind("run_id", Value::String(ctx.run_id.as_str().to_string()));

    if let Some(doc) = document_for(&ctx.docs, unit) {
        if let Ok(value) = serde_json::to_value(doc) {
            scope.bind_namespace("document", value);
        }
    }
    match unit {
        ExecutionUnit::Chunk(chunk) => {
            if let Ok(value) = serde_json::to_value(chunk) {
                scope.bind_namespace("chunk", value);
            }
        }
        ExecutionUnit::Row(row) => {
            if let Ok(value) = serde_json::to_value(row) {
                scope.bind_namespace("row", value);
            }
            scope.bind("row_index", Value::from(row.row_index));
        }
        ExecutionUnit::Images(group) => {
            if let Ok(value) = serde_json::to_value(group) {
                scope.bind_namespace("images", value);
            }
        }
    }
    for (name, values) in ctx.all_scope.iter() {
        scope.set_all(name, values.clone());
    }
    for (name, value) in prior.iter() {
        scope.bind(name.clone(), value.clone());
    }
    scope
}

fn build_messages(
    step: &Step,
    unit: &ExecutionUnit,
    prompt: String,
    rag_blobs: Vec<ppl_core::Blob>,
) -> Vec<Message> {
    match step.mode {
        StepMode::Text => vec![Message::user(prompt)],
        StepMode::Multimodal | StepMode::ImagesGroup => {
            let mut parts = vec![ContentPart::Text { text: prompt }];
            if let ExecutionUnit::Images(group) = unit {
                for blob in &group.blobs {
                    parts.push(ContentPart::ImageBytes {
                        mime: blob.mime.clone(),
                        bytes: blob.bytes.clone(),
                    });
                }
            }
            for blob in rag_blobs {
                parts.push(ContentPart::ImageBytes {
                    mime: blob.mime.clone(),
                    bytes: blob.bytes,
                });
            }
            vec![Message::user_parts(parts)]
        }
    }
}

async fn process_unit(
    ctx: &TaskCtx,
    unit: &ExecutionUnit,
    prior: serde_json::Map<String, Value>,
) -> UnitOutcome {
    let step = ctx.step.as_ref();
    let mut scope = build_scope(ctx, unit, &prior);
    let mut telemetry: Vec<InferenceTelemetry> = Vec::new();
    let mut rag_entry: Option<RetrievalLogEntry> = None;
    let mut rag_blobs: Vec<ppl_core::Blob> = Vec::new();

    // Retrieval runs strictly before dispatch.
    if let Some(binding) = &step.retrieval {
        let Some(pipeline) = &ctx.retrieval else {
            return UnitOutcome::Failed {
                error: EngineError::Config(format!(
                    "unknown retrieval pipeline: {}",
                    binding.pipeline
                )),
                telemetry,
                rag: None,
            };
        };
        match ppl_infer::attach(pipeline.as_ref(), binding, &scope, unit.id(), &step.id).await {
            Ok(attachment) => {
                scope.bind(
                    attachment.text_var.clone(),
                    Value::String(attachment.text.clone()),
                );
                scope.bind(
                    attachment.image_var.clone(),
                    Value::Array(
                        attachment
                            .blobs
                            .iter()
                            .map(|b| Value::String(b.id.clone()))
                            .collect(),
                    ),
                );
                rag_blobs = attachment.blobs;
                rag_entry = Some(attachment.log);
            }
            Err(error) => {
                return UnitOutcome::Failed {
                    error,
                    telemetry,
                    rag: None,
                };
            }
        }
    }

    // User-declared bindings are themselves template expressions.
    for (name, expression) in &step.input_bindings {
        match ppl_template::render(expression, &scope) {
            Ok(rendered) => scope.bind(name.clone(), Value::String(rendered)),
            Err(error) => {
                return UnitOutcome::Failed {
                    error,
                    telemetry,
                    rag: rag_entry,
                };
            }
        }
    }

    let prompt = match ppl_template::render(&ctx.prompt_text, &scope) {
        Ok(prompt) => prompt,
        Err(error) => {
            return UnitOutcome::Failed {
                error,
                telemetry,
                rag: rag_entry,
            };
        }
    };
    let messages = build_messages(step, unit, prompt, rag_blobs);

    let (completion, call_telemetry) = match ctx.dispatcher.invoke(step, &messages, None).await {
        Ok(result) => result,
        Err(error) => {
            return UnitOutcome::Failed {
                error,
                telemetry,
                rag: rag_entry,
            };
        }
    };
    telemetry.push(call_telemetry);

    match step.output_expects {
        OutputExpectation::None => UnitOutcome::Emitted {
            value: Value::String(completion.text),
            include_in_all: true,
            json_failure: false,
            telemetry,
            rag: rag_entry,
        },
        OutputExpectation::Json => {
            match enforce_json(ctx.dispatcher.as_ref(), step, &messages, &completion).await {
                Ok((JsonOutcome::Parsed { value, .. }, repair_telemetry)) => {
                    telemetry.extend(repair_telemetry);
                    UnitOutcome::Emitted {
                        value,
                        include_in_all: true,
                        json_failure: false,
                        telemetry,
                        rag: rag_entry,
                    }
                }
                Ok((
                    JsonOutcome::Failed {
                        parse_error,
                        raw_text,
                    },
                    repair_telemetry,
                )) => {
                    telemetry.extend(repair_telemetry);
                    UnitOutcome::Emitted {
                        value: serde_json::json!({
                            "parse_error": parse_error,
                            "raw_text": raw_text,
                        }),
                        include_in_all: false,
                        json_failure: true,
                        telemetry,
                        rag: rag_entry,
                    }
                }
                Err(error) => UnitOutcome::Failed {
                    error,
                    telemetry,
                    rag: rag_entry,
                },
            }
        }
    }
}
