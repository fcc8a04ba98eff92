// SPDX-License-Identifier: MIT OR Apache-2.0
//! Declarative pipeline configuration surface.
//!
//! These types are the in-memory pipeline description the engine executes.
//! Unknown keys fail closed at deserialisation time; semantic problems are
//! reported by [`Pipeline::validate`] before any unit is dispatched.

use crate::error::EngineError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::CallParams;

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Provider call style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InferMode {
    /// Stream when the provider can, fall back to regular when it cannot.
    #[default]
    Auto,
    /// Always a regular completion call.
    Regular,
    /// Require streaming; fail when the provider cannot stream.
    Stream,
}

impl InferMode {
    /// Stable configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Regular => "regular",
            Self::Stream => "stream",
        }
    }
}

impl FromStr for InferMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "regular" => Ok(Self::Regular),
            "stream" => Ok(Self::Stream),
            other => Err(EngineError::Config(format!(
                "unrecognised inference mode: {other}"
            ))),
        }
    }
}

/// Shape of the messages a step sends to the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// Plain text prompt.
    #[default]
    Text,
    /// Text plus attached image parts from the active unit.
    Multimodal,
    /// One call per image group.
    ImagesGroup,
}

/// What the step expects the model to return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputExpectation {
    /// Free text; stored verbatim.
    #[default]
    None,
    /// JSON, parsed and optionally schema-validated with repair.
    Json,
}

// ---------------------------------------------------------------------------
// Prompt templates
// ---------------------------------------------------------------------------

/// A resolved prompt template reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptTemplate {
    /// The template text itself (from an `inline:` prefix).
    Inline(String),
    /// A registry reference (`prompt_id#version`).
    Registry {
        /// Registry id.
        id: String,
        /// Registry version.
        version: String,
    },
}

impl PromptTemplate {
    /// Parse a step's `prompt_template` field.
    ///
    /// `inline: <text>` means the remainder is the template itself; anything
    /// else must be a `prompt_id#version` registry reference.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for references without a version.
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        if let Some(rest) = raw.strip_prefix("inline:") {
            return Ok(Self::Inline(rest.strip_prefix(' ').unwrap_or(rest).to_string()));
        }
        match raw.split_once('#') {
            Some((id, version)) if !id.is_empty() && !version.is_empty() => Ok(Self::Registry {
                id: id.to_string(),
                version: version.to_string(),
            }),
            _ => Err(EngineError::Config(format!(
                "prompt template must be 'inline: <text>' or 'id#version', got: {raw}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Retrieval binding
// ---------------------------------------------------------------------------

fn default_text_var() -> String {
    "rag_context".to_string()
}

fn default_image_var() -> String {
    "rag_images".to_string()
}

fn default_rag_max_chars() -> usize {
    8_000
}

/// Optional retrieval-augmented context binding for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RetrievalBinding {
    /// Name of the prebuilt retrieval pipeline to invoke.
    pub pipeline: String,
    /// Query template, rendered against the unit scope.
    pub query: String,
    /// Maximum text items to request.
    #[serde(default)]
    pub top_k_text: u32,
    /// Maximum image items to request.
    #[serde(default)]
    pub top_k_images: u32,
    /// Scope variable that receives the joined text context.
    #[serde(default = "default_text_var")]
    pub text_var: String,
    /// Scope variable that names the attached image blobs.
    #[serde(default = "default_image_var")]
    pub image_var: String,
    /// Character cap applied to the joined text context.
    #[serde(default = "default_rag_max_chars")]
    pub max_chars: usize,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// One logical inference operation applied to every unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Unique step id within the pipeline.
    pub id: String,
    /// `inline: <text>` or `prompt_id#version`.
    pub prompt_template: String,
    /// Extra scope bindings, each value itself a template expression.
    #[serde(default)]
    pub input_bindings: BTreeMap<String, String>,
    /// Message shape.
    #[serde(default)]
    pub mode: StepMode,
    /// Name under which the step's output is stored and exposed to `all.*`.
    pub output_name: String,
    /// Expected output discipline.
    #[serde(default)]
    pub output_expects: OutputExpectation,
    /// JSON schema enforced on the output when `output_expects = json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    /// Repair reprompts allowed when JSON enforcement fails.
    #[serde(default)]
    pub parse_retries: u32,
    /// Per-step inference mode override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infer_mode: Option<InferMode>,
    /// Optional retrieval-augmented context binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalBinding>,
    /// Provider call parameters.
    #[serde(default)]
    pub params: CallParams,
}

impl Step {
    /// Parse this step's prompt template reference.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] when the field is malformed.
    pub fn template(&self) -> Result<PromptTemplate, EngineError> {
        PromptTemplate::parse(&self.prompt_template)
    }
}

// ---------------------------------------------------------------------------
// Unit specification
// ---------------------------------------------------------------------------

/// Text splitting strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Splitter {
    /// Split on sentence boundaries.
    BySentence,
    /// Split on blank-line paragraph boundaries.
    #[default]
    ByParagraph,
    /// One chunk per document.
    None,
}

/// Text column selection for table units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum TextColumn {
    /// A single column.
    Single(String),
    /// An ordered list of columns whose string-join yields the row text.
    Joined(Vec<String>),
}

fn default_max_tokens() -> u32 {
    512
}

fn default_group_size() -> usize {
    1
}

fn default_header_row() -> bool {
    true
}

/// How resources are turned into execution units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UnitSpec {
    /// Text chunks.
    Text {
        /// Splitting strategy.
        #[serde(default)]
        splitter: Splitter,
        /// Approximate token budget per chunk.
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
        /// Words of trailing context carried into the next chunk.
        #[serde(default)]
        overlap: u32,
    },
    /// Table rows.
    Table {
        /// Column(s) whose values form `row.text`.
        text_column: TextColumn,
        /// Columns echoed into `row.values`, in order.
        #[serde(default)]
        pass_through: Vec<String>,
        /// Whether the first record is a header row.
        #[serde(default = "default_header_row")]
        header_row: bool,
    },
    /// Image groups.
    Images {
        /// Blobs per group; a smaller tail group is emitted as-is.
        #[serde(default = "default_group_size")]
        group_size: usize,
    },
}

// ---------------------------------------------------------------------------
// Outputs and retry options
// ---------------------------------------------------------------------------

/// Serialisation format for persisted step outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// One JSON object per line (default).
    #[default]
    Jsonl,
    /// Comma-separated values with a first-seen header union.
    Csv,
    /// Caller-supplied columnar encoder.
    Columnar,
}

/// Pass-through byte compression applied after serialisation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// No compression (default).
    #[default]
    None,
    /// gzip.
    Gzip,
}

/// Which step output is persisted, and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OutputsSpec {
    /// `output_name` of the step whose results are exported.
    pub step_output: String,
    /// Serialisation format.
    #[serde(default)]
    pub format: OutputFormat,
    /// Post-serialisation compression.
    #[serde(default)]
    pub compression: Compression,
}

fn default_initial_delay_s() -> f64 {
    0.5
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_cap_s() -> f64 {
    30.0
}

fn default_max_elapsed_s() -> f64 {
    120.0
}

/// Retry/rate-control options for provider calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RetryOptions {
    /// First backoff delay in seconds.
    #[serde(default = "default_initial_delay_s")]
    pub initial_delay_s: f64,
    /// Backoff multiplier per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1)`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Absolute cap on a single backoff sleep, in seconds.
    #[serde(default = "default_cap_s")]
    pub cap_s: f64,
    /// Hard wall-clock deadline for one logical call, in seconds.
    #[serde(default = "default_max_elapsed_s")]
    pub max_elapsed_s: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_delay_s: default_initial_delay_s(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            cap_s: default_cap_s(),
            max_elapsed_s: default_max_elapsed_s(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

fn default_concurrency() -> usize {
    4
}

fn default_all_join_max_chars() -> usize {
    100_000
}

/// An ordered sequence of steps over a unit set, plus execution knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    /// Human-readable pipeline name.
    pub name: String,
    /// Steps, executed in declared order.
    pub steps: Vec<Step>,
    /// How resources become execution units.
    pub units: UnitSpec,
    /// Maximum units in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Attribute single-unit failures and keep going.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Optional whole-run wall-clock deadline in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_deadline_s: Option<f64>,
    /// Which step output is persisted, and how.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<OutputsSpec>,
    /// Id hash algorithm name (`blake2b` | `xxh64`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algo: Option<String>,
    /// Size cap on a rendered `all.*` join, in characters.
    #[serde(default = "default_all_join_max_chars")]
    pub all_join_max_chars: usize,
    /// Retry/rate-control options.
    #[serde(default)]
    pub retry: RetryOptions,
}

impl Pipeline {
    /// Semantic validation, run before any unit is dispatched.
    ///
    /// # Errors
    ///
    /// Returns a single [`EngineError::Config`] naming every problem found.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut reasons = Vec::new();

        if self.steps.is_empty() {
            reasons.push("pipeline has no steps".to_string());
        }
        if self.concurrency == 0 {
            reasons.push("concurrency must be positive".to_string());
        }
        if self.all_join_max_chars == 0 {
            reasons.push("all_join_max_chars must be positive".to_string());
        }
        if let Some(name) = &self.hash_algo {
            if let Err(e) = crate::identity::HashAlgo::parse(name) {
                reasons.push(e.to_string());
            }
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            reasons.push(format!(
                "retry.jitter must be in [0, 1), got {}",
                self.retry.jitter
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                reasons.push(format!("duplicate step id: {}", step.id));
            }
            if let Err(e) = step.template() {
                reasons.push(format!("step '{}': {e}", step.id));
            }
            if step.output_expects == OutputExpectation::None && step.output_schema.is_some() {
                reasons.push(format!(
                    "step '{}': output_schema requires output_expects = json",
                    step.id
                ));
            }
            if let Some(binding) = &step.retrieval {
                if binding.pipeline.is_empty() {
                    reasons.push(format!(
                        "step '{}': retrieval binding names no pipeline",
                        step.id
                    ));
                }
            }
        }

        if let Some(outputs) = &self.outputs {
            let known = self.steps.iter().any(|s| s.output_name == outputs.step_output);
            if !known {
                reasons.push(format!(
                    "outputs.step_output '{}' matches no step output_name",
                    outputs.step_output
                ));
            }
        }

        if let UnitSpec::Images { group_size } = &self.units {
            if *group_size == 0 {
                reasons.push("group_size must be positive".to_string());
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Config(reasons.join("; ")))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_step() -> Step {
        Step {
            id: "echo".into(),
            prompt_template: "inline: Echo: ${row.text}".into(),
            input_bindings: BTreeMap::new(),
            mode: StepMode::Text,
            output_name: "echo".into(),
            output_expects: OutputExpectation::None,
            output_schema: None,
            parse_retries: 0,
            infer_mode: None,
            retrieval: None,
            params: CallParams::default(),
        }
    }

    fn text_pipeline() -> Pipeline {
        Pipeline {
            name: "t".into(),
            steps: vec![echo_step()],
            units: UnitSpec::Text {
                splitter: Splitter::ByParagraph,
                max_tokens: 512,
                overlap: 0,
            },
            concurrency: 4,
            continue_on_error: false,
            run_deadline_s: None,
            outputs: None,
            hash_algo: None,
            all_join_max_chars: 100_000,
            retry: RetryOptions::default(),
        }
    }

    // -- Prompt templates --

    #[test]
    fn inline_prefix_yields_template_text() {
        let t = PromptTemplate::parse("inline: Echo: ${row.text}").unwrap();
        assert_eq!(t, PromptTemplate::Inline("Echo: ${row.text}".into()));
    }

    #[test]
    fn registry_reference_requires_version() {
        let t = PromptTemplate::parse("summarise#v2").unwrap();
        assert_eq!(
            t,
            PromptTemplate::Registry {
                id: "summarise".into(),
                version: "v2".into()
            }
        );
        assert!(PromptTemplate::parse("summarise").is_err());
        assert!(PromptTemplate::parse("#v2").is_err());
    }

    // -- Mode parsing --

    #[test]
    fn infer_mode_from_str() {
        assert_eq!("auto".parse::<InferMode>().unwrap(), InferMode::Auto);
        assert_eq!("stream".parse::<InferMode>().unwrap(), InferMode::Stream);
        assert!("fast".parse::<InferMode>().is_err());
    }

    // -- Unknown keys fail closed --

    #[test]
    fn unknown_step_key_is_rejected() {
        let raw = serde_json::json!({
            "id": "s",
            "prompt_template": "inline: x",
            "output_name": "o",
            "surprise": true,
        });
        let parsed: Result<Step, _> = serde_json::from_value(raw);
        assert!(parsed.is_err());
    }

    #[test]
    fn unit_spec_tagged_parsing() {
        let raw = serde_json::json!({
            "mode": "table",
            "text_column": "comment",
            "pass_through": ["id"],
        });
        let spec: UnitSpec = serde_json::from_value(raw).unwrap();
        match spec {
            UnitSpec::Table {
                text_column,
                pass_through,
                header_row,
            } => {
                assert_eq!(text_column, TextColumn::Single("comment".into()));
                assert_eq!(pass_through, vec!["id".to_string()]);
                assert!(header_row);
            }
            other => panic!("expected table spec, got {other:?}"),
        }
    }

    #[test]
    fn joined_text_column_parses_from_list() {
        let spec: TextColumn = serde_json::from_value(serde_json::json!(["a", "b"])).unwrap();
        assert_eq!(spec, TextColumn::Joined(vec!["a".into(), "b".into()]));
    }

    // -- Validation --

    #[test]
    fn valid_pipeline_passes() {
        text_pipeline().validate().unwrap();
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut p = text_pipeline();
        p.concurrency = 0;
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn duplicate_step_ids_rejected() {
        let mut p = text_pipeline();
        p.steps.push(echo_step());
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn schema_without_json_expectation_rejected() {
        let mut p = text_pipeline();
        p.steps[0].output_schema = Some(serde_json::json!({"required": ["tag"]}));
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("output_expects"));
    }

    #[test]
    fn unknown_hash_algo_rejected() {
        let mut p = text_pipeline();
        p.hash_algo = Some("md5".into());
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("hash algorithm"));
    }

    #[test]
    fn outputs_must_match_a_step() {
        let mut p = text_pipeline();
        p.outputs = Some(OutputsSpec {
            step_output: "missing".into(),
            format: OutputFormat::Jsonl,
            compression: Compression::None,
        });
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("matches no step"));
    }

    #[test]
    fn jitter_out_of_range_rejected() {
        let mut p = text_pipeline();
        p.retry.jitter = 1.0;
        assert!(p.validate().is_err());
    }
}
