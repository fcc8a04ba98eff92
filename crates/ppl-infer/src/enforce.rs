// SPDX-License-Identifier: MIT OR Apache-2.0
//! JSON enforcement with a bounded repair loop.
//!
//! Enforcement is a value, not an exception: parse and validation failures
//! flow through [`JsonOutcome`] and the loop reprompts deterministically up
//! to the step's `parse_retries` budget. Repairs always use regular mode.

use crate::dispatch::Dispatcher;
use ppl_core::{Completion, EngineError, InferenceTelemetry, Message, Step};
use serde_json::Value;
use tracing::debug;

// ---------------------------------------------------------------------------
// JsonOutcome
// ---------------------------------------------------------------------------

/// Terminal result of the enforcement pass for one unit.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonOutcome {
    /// The completion parsed (and validated, when a schema is set).
    Parsed {
        /// The parsed value.
        value: Value,
        /// Repair reprompts that were needed (0 for already-valid output).
        repairs: u32,
    },
    /// The repair budget is exhausted.
    Failed {
        /// What went wrong on the last attempt (`invalid_json` or
        /// `schema_mismatch: …`).
        parse_error: String,
        /// The last raw completion text.
        raw_text: String,
    },
}

impl JsonOutcome {
    /// Whether enforcement succeeded.
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed { .. })
    }
}

// ---------------------------------------------------------------------------
// Enforcement
// ---------------------------------------------------------------------------

fn check(raw: &str, validator: Option<&jsonschema::Validator>) -> Result<Value, String> {
    let value: Value =
        serde_json::from_str(raw.trim()).map_err(|_| "invalid_json".to_string())?;
    if let Some(validator) = validator {
        if let Some(first) = validator.iter_errors(&value).next() {
            return Err(format!("schema_mismatch: {first}"));
        }
    }
    Ok(value)
}

/// Summarise a schema's required keys and their declared types for the
/// repair instruction. No examples are added beyond the failed output.
fn schema_summary(schema: &Value) -> Option<String> {
    let required = schema.get("required")?.as_array()?;
    let properties = schema.get("properties");
    let keys: Vec<String> = required
        .iter()
        .filter_map(|k| k.as_str())
        .map(|key| {
            let declared = properties
                .and_then(|p| p.get(key))
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str());
            match declared {
                Some(ty) => format!("{key} ({ty})"),
                None => key.to_string(),
            }
        })
        .collect();
    if keys.is_empty() {
        None
    } else {
        Some(format!("Required keys: {}.", keys.join(", ")))
    }
}

fn repair_instruction(raw: &str, schema: Option<&Value>) -> String {
    let mut text = format!(
        "The previous reply was not valid JSON output.\nInvalid reply:\n{raw}\nReturn only a corrected JSON value, with no surrounding prose."
    );
    if let Some(summary) = schema.and_then(schema_summary) {
        text.push('\n');
        text.push_str(&summary);
    }
    text
}

/// Enforce the step's JSON expectation on a completion.
///
/// Returns the terminal outcome plus the telemetry of every repair call
/// made. Callers decide whether a `Failed` outcome halts the run.
///
/// # Errors
///
/// Returns [`EngineError::Config`] for an uncompilable `output_schema`, and
/// propagates provider failures from repair calls.
pub async fn enforce_json(
    dispatcher: &Dispatcher,
    step: &Step,
    messages: &[Message],
    completion: &Completion,
) -> Result<(JsonOutcome, Vec<InferenceTelemetry>), EngineError> {
    let validator = match &step.output_schema {
        Some(schema) => Some(jsonschema::validator_for(schema).map_err(|e| {
            EngineError::Config(format!("invalid output_schema for step '{}': {e}", step.id))
        })?),
        None => None,
    };

    let mut raw = completion.text.clone();
    let mut repairs: u32 = 0;
    let mut telemetry = Vec::new();

    loop {
        match check(&raw, validator.as_ref()) {
            Ok(value) => {
                return Ok((JsonOutcome::Parsed { value, repairs }, telemetry));
            }
            Err(parse_error) => {
                if repairs >= step.parse_retries {
                    debug!(
                        target: "ppl.infer",
                        step = %step.id,
                        repairs,
                        error = %parse_error,
                        "json enforcement exhausted"
                    );
                    return Ok((
                        JsonOutcome::Failed {
                            parse_error,
                            raw_text: raw,
                        },
                        telemetry,
                    ));
                }
                let mut repair_messages = messages.to_vec();
                repair_messages.push(Message::system(repair_instruction(
                    &raw,
                    step.output_schema.as_ref(),
                )));
                let (repaired, call_telemetry) =
                    dispatcher.invoke_regular(step, &repair_messages).await?;
                telemetry.push(call_telemetry);
                raw = repaired.text;
                repairs += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RuntimeContext;
    use ppl_core::cancel::CancelToken;
    use ppl_core::config::{OutputExpectation, StepMode};
    use ppl_core::CallParams;
    use ppl_mock::ScriptedProvider;
    use ppl_retry::RetryPolicy;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn json_step(parse_retries: u32, schema: Option<Value>) -> Step {
        Step {
            id: "extract".into(),
            prompt_template: "inline: ${chunk.text}".into(),
            input_bindings: BTreeMap::new(),
            mode: StepMode::Text,
            output_name: "extract".into(),
            output_expects: OutputExpectation::Json,
            output_schema: schema,
            parse_retries,
            infer_mode: None,
            retrieval: None,
            params: CallParams::default(),
        }
    }

    fn dispatcher(provider: ScriptedProvider) -> (Dispatcher, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let d = Dispatcher::new(
            provider.clone(),
            RetryPolicy::default(),
            RuntimeContext::default(),
            CancelToken::new(),
        );
        (d, provider)
    }

    fn completion(text: &str) -> Completion {
        Completion {
            text: text.into(),
            ..Completion::default()
        }
    }

    // -- Idempotence (valid output makes zero repair calls) --

    #[tokio::test]
    async fn valid_json_passes_with_zero_repairs() {
        let (d, provider) = dispatcher(ScriptedProvider::echo());
        let step = json_step(3, Some(json!({"required": ["tag"]})));
        let (outcome, telemetry) = enforce_json(
            &d,
            &step,
            &[Message::user("q")],
            &completion(r#"{"tag": "x"}"#),
        )
        .await
        .unwrap();
        assert_eq!(
            outcome,
            JsonOutcome::Parsed {
                value: json!({"tag": "x"}),
                repairs: 0
            }
        );
        assert!(telemetry.is_empty());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn schemaless_enforcement_only_parses() {
        let (d, _) = dispatcher(ScriptedProvider::echo());
        let step = json_step(0, None);
        let (outcome, _) = enforce_json(&d, &step, &[Message::user("q")], &completion("[1, 2]"))
            .await
            .unwrap();
        assert!(outcome.is_parsed());
    }

    // -- Repair loop --

    #[tokio::test]
    async fn repair_fixes_invalid_json() {
        let (d, provider) =
            dispatcher(ScriptedProvider::echo().with_texts(vec![r#"{"tag": "x"}"#]));
        let step = json_step(1, Some(json!({"required": ["tag"]})));
        let (outcome, telemetry) =
            enforce_json(&d, &step, &[Message::user("q")], &completion("not json"))
                .await
                .unwrap();
        assert_eq!(
            outcome,
            JsonOutcome::Parsed {
                value: json!({"tag": "x"}),
                repairs: 1
            }
        );
        assert_eq!(telemetry.len(), 1);
        assert_eq!(provider.call_count(), 1);

        // The repair instruction quotes the invalid text and the schema's
        // required keys, and keeps the original user message.
        let calls = provider.calls();
        let repair_call = &calls[0];
        assert_eq!(repair_call[0], Message::user("q"));
        match &repair_call[1].content {
            ppl_core::Content::Text(text) => {
                assert!(text.contains("not json"));
                assert!(text.contains("Required keys: tag"));
            }
            other => panic!("expected text instruction, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn schema_mismatch_triggers_repair() {
        let (d, _) = dispatcher(ScriptedProvider::echo().with_texts(vec![r#"{"tag": "x"}"#]));
        let step = json_step(1, Some(json!({"required": ["tag"]})));
        let (outcome, _) = enforce_json(
            &d,
            &step,
            &[Message::user("q")],
            &completion(r#"{"other": 1}"#),
        )
        .await
        .unwrap();
        assert_eq!(
            outcome,
            JsonOutcome::Parsed {
                value: json!({"tag": "x"}),
                repairs: 1
            }
        );
    }

    #[tokio::test]
    async fn exhaustion_yields_failed_outcome() {
        let (d, provider) =
            dispatcher(ScriptedProvider::echo().with_texts(vec!["still bad", "also bad"]));
        let step = json_step(2, None);
        let (outcome, telemetry) =
            enforce_json(&d, &step, &[Message::user("q")], &completion("bad"))
                .await
                .unwrap();
        match outcome {
            JsonOutcome::Failed {
                parse_error,
                raw_text,
            } => {
                assert_eq!(parse_error, "invalid_json");
                assert_eq!(raw_text, "also bad");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(telemetry.len(), 2);
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn zero_budget_fails_immediately() {
        let (d, provider) = dispatcher(ScriptedProvider::echo());
        let step = json_step(0, None);
        let (outcome, _) = enforce_json(&d, &step, &[Message::user("q")], &completion("bad"))
            .await
            .unwrap();
        assert!(!outcome.is_parsed());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn invalid_schema_is_config_error() {
        let (d, _) = dispatcher(ScriptedProvider::echo());
        let step = json_step(0, Some(json!({"type": 42})));
        let err = enforce_json(&d, &step, &[Message::user("q")], &completion("{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    // -- Schema summary --

    #[test]
    fn schema_summary_includes_types() {
        let schema = json!({
            "required": ["tag", "score"],
            "properties": {
                "tag": {"type": "string"},
                "score": {"type": "number"}
            }
        });
        assert_eq!(
            schema_summary(&schema).unwrap(),
            "Required keys: tag (string), score (number)."
        );
    }

    #[test]
    fn schema_summary_absent_without_required() {
        assert!(schema_summary(&json!({"type": "object"})).is_none());
    }
}
