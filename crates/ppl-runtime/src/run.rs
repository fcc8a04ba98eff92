// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run orchestration: documents → units → steps → artefacts → record.

use crate::artefacts::ArtifactWriter;
use crate::executor::{ExecutionReport, Executor, UnitRecord};
use crate::serialize::{ColumnarEncoder, serialize_records};
use chrono::Utc;
use ppl_core::cancel::CancelToken;
use ppl_core::config::{PromptTemplate, UnitSpec};
use ppl_core::contract::{Connector, ExportOptions, ExportPayload, ExportSink, Provider,
    RetrievalPipeline};
use ppl_core::prompts::PromptRegistry;
use ppl_core::secret::Redactor;
use ppl_core::{
    EngineError, ExecutionUnit, Pipeline, PromptUse, RunRecord, RunStatus, RunTotals, identity,
};
use ppl_infer::{Dispatcher, RuntimeContext};
use ppl_retry::RetryPolicy;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

// ---------------------------------------------------------------------------
// RunSummary
// ---------------------------------------------------------------------------

/// What a finished (or cancelled) run hands back to the caller.
#[derive(Debug)]
pub struct RunSummary {
    /// The run id.
    pub run_id: String,
    /// The audit record, as written to `run.yaml`.
    pub record: RunRecord,
    /// Absolute path of the run directory.
    pub run_dir: PathBuf,
    /// Per-unit output records, in unit order.
    pub outputs: Vec<UnitRecord>,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Owns the collaborators of a run and drives the pipeline end to end.
pub struct Runner {
    provider: Arc<dyn Provider>,
    retrievals: BTreeMap<String, Arc<dyn RetrievalPipeline>>,
    prompts: PromptRegistry,
    artefacts_dir: PathBuf,
    ctx: RuntimeContext,
    cancel: CancelToken,
    redactor: Redactor,
    fixed_run_id: Option<String>,
    sink: Option<Arc<dyn ExportSink>>,
    columnar: Option<Arc<dyn ColumnarEncoder>>,
    grace: Duration,
}

impl Runner {
    /// A runner over one provider writing under `artefacts_dir`.
    pub fn new(provider: Arc<dyn Provider>, artefacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            retrievals: BTreeMap::new(),
            prompts: PromptRegistry::new(),
            artefacts_dir: artefacts_dir.into(),
            ctx: RuntimeContext::default(),
            cancel: CancelToken::new(),
            redactor: Redactor::new(),
            fixed_run_id: None,
            sink: None,
            columnar: None,
            grace: Duration::from_secs(5),
        }
    }

    /// Use the given prompt registry.
    #[must_use]
    pub fn with_prompts(mut self, prompts: PromptRegistry) -> Self {
        self.prompts = prompts;
        self
    }

    /// Register a retrieval pipeline under its own name.
    #[must_use]
    pub fn with_retrieval(mut self, pipeline: Arc<dyn RetrievalPipeline>) -> Self {
        self.retrievals.insert(pipeline.name().to_string(), pipeline);
        self
    }

    /// Use the given runtime context (mode override).
    #[must_use]
    pub fn with_context(mut self, ctx: RuntimeContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Observe the given cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Redact the given secrets from records and logs.
    #[must_use]
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Pin the run id (determinism tests, reproducible reruns).
    #[must_use]
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.fixed_run_id = Some(run_id.into());
        self
    }

    /// Export serialised outputs to the given sink at run end.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ExportSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use a caller-supplied columnar encoder for columnar outputs.
    #[must_use]
    pub fn with_columnar(mut self, encoder: Arc<dyn ColumnarEncoder>) -> Self {
        self.columnar = Some(encoder);
        self
    }

    /// Override the cancellation grace period.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn make_run_id(&self) -> String {
        if let Some(fixed) = &self.fixed_run_id {
            return fixed.clone();
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let random = uuid::Uuid::new_v4().simple().to_string();
        format!("{stamp}-{}", &random[..8])
    }

    fn resolve_prompts(
        &self,
        pipeline: &Pipeline,
    ) -> Result<(BTreeMap<String, String>, Vec<PromptUse>), EngineError> {
        let mut texts = BTreeMap::new();
        let mut uses = Vec::new();
        for step in &pipeline.steps {
            match step.template()? {
                PromptTemplate::Inline(text) => {
                    uses.push(PromptUse {
                        id: "inline".into(),
                        version: step.id.clone(),
                        content_hash: identity::prompt_hash(&text),
                    });
                    texts.insert(step.id.clone(), text);
                }
                PromptTemplate::Registry { id, version } => {
                    let entry = self.prompts.resolve(&id, &version)?;
                    uses.push(PromptUse {
                        id: entry.id.clone(),
                        version: entry.version.clone(),
                        content_hash: entry.content_hash.clone(),
                    });
                    texts.insert(step.id.clone(), entry.template.clone());
                }
            }
        }
        Ok((texts, uses))
    }

    fn check_retrievals(&self, pipeline: &Pipeline) -> Result<(), EngineError> {
        for step in &pipeline.steps {
            if let Some(binding) = &step.retrieval {
                if !self.retrievals.contains_key(&binding.pipeline) {
                    return Err(EngineError::Config(format!(
                        "step '{}' names unknown retrieval pipeline: {}",
                        step.id, binding.pipeline
                    )));
                }
            }
        }
        Ok(())
    }

    /// Execute a pipeline over the resources a connector yields for the
    /// given selectors.
    ///
    /// Artefacts (including `run.yaml`) are written even when the run halts
    /// on an error; the error is returned after the record is persisted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for invalid pipelines, and the
    /// halting error for runs without `continue_on_error`.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        connector: &dyn Connector,
        selectors: &[String],
    ) -> Result<RunSummary, EngineError> {
        pipeline.validate()?;
        self.check_retrievals(pipeline)?;
        if let Some(name) = &pipeline.hash_algo {
            // First configuration wins for the process; later runs reuse it.
            identity::configure_hashing(identity::HashAlgo::parse(name)?);
        }
        let (prompt_texts, prompts_used) = self.resolve_prompts(pipeline)?;

        let run_id = self.make_run_id();
        let started_at = Utc::now();
        let config_hash = identity::config_hash(pipeline)?;
        info!(target: "ppl.run", run_id = %run_id, pipeline = %pipeline.name, "run starting");

        let docs = ppl_units::load_documents(connector, selectors).await?;
        let units = ppl_units::units_for(&docs, &pipeline.units, pipeline.continue_on_error)?;
        let manifest = ppl_units::build_manifest(&docs, &units);

        let writer = ArtifactWriter::new(&self.artefacts_dir, &run_id)?;
        writer.write_jsonl("docs.jsonl", &docs)?;
        match &pipeline.units {
            UnitSpec::Text { .. } => {
                let chunks: Vec<_> = units
                    .iter()
                    .filter_map(|u| match u {
                        ExecutionUnit::Chunk(c) => Some(c),
                        _ => None,
                    })
                    .collect();
                writer.write_jsonl("chunks.jsonl", &chunks)?;
            }
            UnitSpec::Table { .. } => {
                let rows: Vec<_> = units
                    .iter()
                    .filter_map(|u| match u {
                        ExecutionUnit::Row(r) => Some(r),
                        _ => None,
                    })
                    .collect();
                writer.write_jsonl("rows.jsonl", &rows)?;
            }
            UnitSpec::Images { .. } => {
                let groups: Vec<_> = units
                    .iter()
                    .filter_map(|u| match u {
                        ExecutionUnit::Images(g) => Some(g),
                        _ => None,
                    })
                    .collect();
                writer.write_jsonl("groups.jsonl", &groups)?;
            }
        }
        writer.write_json("manifest.json", &manifest)?;

        // Optional whole-run deadline, enforced through the cancel token.
        let deadline_guard = pipeline.run_deadline_s.map(|secs| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                cancel.cancel();
            })
        });

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.provider),
            RetryPolicy::from_options(&pipeline.retry),
            self.ctx,
            self.cancel.clone(),
        ));
        let executor = Executor::new(
            dispatcher,
            self.retrievals.clone(),
            self.redactor.clone(),
            self.cancel.clone(),
        )
        .with_grace(self.grace);

        let report = executor
            .execute(
                pipeline,
                &prompt_texts,
                &units,
                Arc::new(docs),
                &run_id,
            )
            .await;

        if let Some(guard) = deadline_guard {
            guard.abort();
        }

        self.persist(pipeline, &writer, report, RunMeta {
            run_id,
            started_at,
            config_hash,
            prompts_used,
            units_total: units.len() as u64,
        })
        .await
    }

    async fn persist(
        &self,
        pipeline: &Pipeline,
        writer: &ArtifactWriter,
        report: ExecutionReport,
        meta: RunMeta,
    ) -> Result<RunSummary, EngineError> {
        for (name, entries) in &report.rag_logs {
            if !name.is_empty() {
                writer.write_jsonl(&format!("rag/{name}.jsonl"), entries)?;
            }
        }

        // Only emitted outputs (plus attributed failures under
        // continue_on_error) appear in outputs.jsonl.
        let visible: Vec<&UnitRecord> = report
            .records
            .iter()
            .filter(|r| {
                !r.step_outputs.is_empty() || (pipeline.continue_on_error && r.error.is_some())
            })
            .collect();
        writer.write_jsonl("outputs.jsonl", &visible)?;

        let status = if report.cancelled {
            RunStatus::Cancelled
        } else if report.halt_error.is_some() {
            RunStatus::Failed
        } else if report.units_failed > 0 {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };

        let finished_at = Utc::now();
        let mut totals = RunTotals {
            units_total: meta.units_total,
            units_emitted: report.units_emitted,
            units_failed: report.units_failed,
            duration_ms: (finished_at - meta.started_at)
                .to_std()
                .unwrap_or_default()
                .as_millis() as u64,
            ..RunTotals::default()
        };
        for snapshot in report.step_telemetry.values() {
            totals.calls += snapshot.calls;
            totals.retries += snapshot.retries;
            totals.fallbacks += snapshot.fallbacks;
            totals.json_parse_failures += snapshot.json_parse_failures;
            totals.tokens_out += snapshot.tokens_out;
        }

        let mut artefact_paths = writer.paths();
        artefact_paths.push("run.yaml".to_string());
        let record = RunRecord {
            run_id: meta.run_id.clone(),
            status,
            started_at: meta.started_at,
            finished_at,
            config_hash: meta.config_hash,
            prompts_used: meta.prompts_used,
            metrics: totals,
            step_telemetry: report.step_telemetry,
            artefact_paths,
        };
        writer.write_yaml("run.yaml", &record)?;
        info!(
            target: "ppl.run",
            run_id = %meta.run_id,
            status = status.as_str(),
            emitted = record.metrics.units_emitted,
            failed = record.metrics.units_failed,
            "run finished"
        );

        // Export after the artefact trail is complete.
        if status != RunStatus::Failed {
            self.export(pipeline, &report.records).await?;
        }

        if let Some(error) = report.halt_error {
            return Err(error);
        }
        Ok(RunSummary {
            run_id: meta.run_id,
            record,
            run_dir: writer.run_dir().to_path_buf(),
            outputs: report.records,
        })
    }

    async fn export(
        &self,
        pipeline: &Pipeline,
        records: &[UnitRecord],
    ) -> Result<(), EngineError> {
        let (Some(outputs), Some(sink)) = (&pipeline.outputs, &self.sink) else {
            return Ok(());
        };
        let values: Vec<serde_json::Value> = records
            .iter()
            .filter(|r| r.error.is_none())
            .filter_map(|r| r.step_outputs.get(&outputs.step_output).cloned())
            .collect();
        let bytes = serialize_records(
            &values,
            outputs.format,
            outputs.compression,
            self.columnar.as_deref(),
        )?;
        sink.write(ExportPayload::Bytes(bytes), &ExportOptions::default())
            .await?;
        sink.finalize().await
    }
}

struct RunMeta {
    run_id: String,
    started_at: chrono::DateTime<Utc>,
    config_hash: String,
    prompts_used: Vec<PromptUse>,
    units_total: u64,
}
