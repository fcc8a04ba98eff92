// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `invoke_with_mode` dispatcher.
//!
//! One uniform path for every provider call: resolve the effective mode,
//! check the streaming capability, run the call (streaming or regular),
//! apply the fallback contract, and return the completion together with
//! per-call telemetry.

use crate::context::RuntimeContext;
use ppl_core::cancel::CancelToken;
use ppl_core::contract::Provider;
use ppl_core::text::{DEFAULT_TOKEN_MULTIPLIER, estimate_tokens};
use ppl_core::{
    CallParams, Completion, EngineError, InferMode, InferenceTelemetry, Message, Step,
};
use ppl_retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Dispatches unit-step calls through one provider under one retry policy.
pub struct Dispatcher {
    provider: Arc<dyn Provider>,
    policy: RetryPolicy,
    ctx: RuntimeContext,
    cancel: CancelToken,
}

struct StreamSuccess {
    completion: Completion,
    ttfb: Duration,
    chunks: u64,
}

enum StreamFailure {
    /// Failed before any token arrived (fallback-eligible under `auto`).
    BeforeContent(EngineError),
    /// Failed after content was emitted (never silently recovered).
    AfterContent(EngineError),
    /// The caller's scope was cancelled.
    Cancelled,
}

impl Dispatcher {
    /// Build a dispatcher.
    pub fn new(
        provider: Arc<dyn Provider>,
        policy: RetryPolicy,
        ctx: RuntimeContext,
        cancel: CancelToken,
    ) -> Self {
        Self {
            provider,
            policy,
            ctx,
            cancel,
        }
    }

    /// The provider this dispatcher calls.
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// The cancellation token this dispatcher observes.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Invoke one unit-step call under the mode/fallback contract.
    ///
    /// Mode precedence, highest first: environment override, `mode_hint`,
    /// the step's `infer_mode`, `auto`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Provider`] when resolved mode is `stream` and the
    ///   provider reports no streaming capability (no regular call is made).
    /// - [`EngineError::Inference`] for provider failures, mid-stream errors
    ///   after content, deadline expiry, and cancellation.
    pub async fn invoke(
        &self,
        step: &Step,
        messages: &[Message],
        mode_hint: Option<InferMode>,
    ) -> Result<(Completion, InferenceTelemetry), EngineError> {
        let resolved = self.ctx.resolve_mode(mode_hint, step.infer_mode);
        let label = format!("infer.{}.{}", self.provider.name(), step.id);
        let start = Instant::now();

        match resolved {
            InferMode::Regular => {
                let (completion, retries) = self.call_regular(&label, messages, &step.params).await?;
                Ok(finish_regular(completion, retries, None, start))
            }
            InferMode::Stream => {
                if !self.provider.supports_streaming() {
                    return Err(EngineError::Provider(format!(
                        "streaming unsupported by {}",
                        self.provider.name()
                    )));
                }
                let params = step.params.clone();
                let msgs = messages.to_vec();
                let outcome = ppl_retry::call(&self.policy, &label, || {
                    let this = self;
                    let msgs = msgs.clone();
                    let params = params.clone();
                    async move {
                        match this.attempt_stream(&msgs, &params, start).await {
                            Ok(success) => Ok(success),
                            Err(StreamFailure::BeforeContent(e)) => Err(e),
                            Err(StreamFailure::AfterContent(e)) => Err(EngineError::inference(
                                format!("mid-stream failure after content: {}", short_message(&e)),
                            )),
                            Err(StreamFailure::Cancelled) => Err(EngineError::cancelled()),
                        }
                    }
                })
                .await?;
                let success = outcome.value;
                let latency = start.elapsed();
                let tokens_out = tokens_of(&success.completion);
                debug!(
                    target: "ppl.infer",
                    step = %step.id,
                    chunks = success.chunks,
                    latency_ms = latency.as_millis() as u64,
                    "streamed call complete"
                );
                Ok((
                    success.completion,
                    InferenceTelemetry {
                        streaming: true,
                        selected_mode: InferMode::Stream,
                        fallback_reason: None,
                        ttfb_ms: success.ttfb.as_millis() as u64,
                        latency_ms: latency.as_millis() as u64,
                        chunk_count: success.chunks,
                        tokens_out,
                        retries: outcome.retries,
                    },
                ))
            }
            InferMode::Auto => {
                if !self.provider.supports_streaming() {
                    let (completion, retries) =
                        self.call_regular(&label, messages, &step.params).await?;
                    return Ok(finish_regular(
                        completion,
                        retries,
                        Some("streaming_unsupported".to_string()),
                        start,
                    ));
                }
                match self.attempt_stream(messages, &step.params, start).await {
                    Ok(success) => {
                        let latency = start.elapsed();
                        let tokens_out = tokens_of(&success.completion);
                        Ok((
                            success.completion,
                            InferenceTelemetry {
                                streaming: true,
                                selected_mode: InferMode::Stream,
                                fallback_reason: None,
                                ttfb_ms: success.ttfb.as_millis() as u64,
                                latency_ms: latency.as_millis() as u64,
                                chunk_count: success.chunks,
                                tokens_out,
                                retries: 0,
                            },
                        ))
                    }
                    Err(StreamFailure::BeforeContent(e)) => {
                        let reason = format!("stream_error:{}", short_message(&e));
                        warn!(
                            target: "ppl.infer",
                            step = %step.id,
                            reason = %reason,
                            "stream failed before first token, falling back to regular"
                        );
                        let (completion, retries) =
                            self.call_regular(&label, messages, &step.params).await?;
                        Ok(finish_regular(completion, retries, Some(reason), start))
                    }
                    Err(StreamFailure::AfterContent(e)) => Err(EngineError::inference(format!(
                        "mid-stream failure after content: {}",
                        short_message(&e)
                    ))),
                    Err(StreamFailure::Cancelled) => Err(EngineError::cancelled()),
                }
            }
        }
    }

    /// A regular call regardless of any mode override. Used by the JSON
    /// repair loop, which needs deterministic non-streaming reprompts.
    pub async fn invoke_regular(
        &self,
        step: &Step,
        messages: &[Message],
    ) -> Result<(Completion, InferenceTelemetry), EngineError> {
        let label = format!("infer.{}.{}", self.provider.name(), step.id);
        let start = Instant::now();
        let (completion, retries) = self.call_regular(&label, messages, &step.params).await?;
        Ok(finish_regular(completion, retries, None, start))
    }

    async fn call_regular(
        &self,
        label: &str,
        messages: &[Message],
        params: &CallParams,
    ) -> Result<(Completion, u64), EngineError> {
        let msgs = messages.to_vec();
        let outcome = ppl_retry::call(&self.policy, label, || {
            let this = self;
            let msgs = msgs.clone();
            let params = params.clone();
            async move {
                if this.cancel.is_cancelled() {
                    return Err(EngineError::cancelled());
                }
                tokio::select! {
                    _ = this.cancel.cancelled() => Err(EngineError::cancelled()),
                    result = this.provider.complete(&msgs, &params) => result,
                }
            }
        })
        .await?;
        Ok((outcome.value, outcome.retries))
    }

    async fn attempt_stream(
        &self,
        messages: &[Message],
        params: &CallParams,
        start: Instant,
    ) -> Result<StreamSuccess, StreamFailure> {
        if self.cancel.is_cancelled() {
            return Err(StreamFailure::Cancelled);
        }
        let mut rx = tokio::select! {
            _ = self.cancel.cancelled() => return Err(StreamFailure::Cancelled),
            result = self.provider.stream(messages, params) => {
                result.map_err(StreamFailure::BeforeContent)?
            }
        };

        let mut text = String::new();
        let mut chunks: u64 = 0;
        let mut ttfb: Option<Duration> = None;
        let mut final_completion: Option<Completion> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Partial tokens are discarded.
                    return Err(StreamFailure::Cancelled);
                }
                item = rx.recv() => match item {
                    Some(Ok(chunk)) => {
                        if let Some(completion) = chunk.completion {
                            final_completion = Some(completion);
                            break;
                        }
                        if ttfb.is_none() {
                            ttfb = Some(start.elapsed());
                        }
                        chunks += 1;
                        text.push_str(&chunk.delta);
                    }
                    Some(Err(e)) => {
                        return Err(if chunks == 0 {
                            StreamFailure::BeforeContent(e)
                        } else {
                            StreamFailure::AfterContent(e)
                        });
                    }
                    // Closed without a terminal chunk: treat the
                    // accumulated text as the completion.
                    None => break,
                }
            }
        }

        let mut completion = final_completion.unwrap_or_default();
        if completion.text.is_empty() {
            completion.text = text;
        }
        Ok(StreamSuccess {
            completion,
            ttfb: ttfb.unwrap_or_else(|| start.elapsed()),
            chunks,
        })
    }
}

fn finish_regular(
    completion: Completion,
    retries: u64,
    fallback_reason: Option<String>,
    start: Instant,
) -> (Completion, InferenceTelemetry) {
    let latency = start.elapsed().as_millis() as u64;
    let tokens_out = tokens_of(&completion);
    let telemetry = InferenceTelemetry {
        streaming: false,
        selected_mode: InferMode::Regular,
        fallback_reason,
        ttfb_ms: latency,
        latency_ms: latency,
        chunk_count: 0,
        tokens_out,
        retries,
    };
    (completion, telemetry)
}

fn tokens_of(completion: &Completion) -> u64 {
    completion.tokens_completion.unwrap_or_else(|| {
        estimate_tokens(&completion.text, DEFAULT_TOKEN_MULTIPLIER) as u64
    })
}

fn short_message(err: &EngineError) -> String {
    match err {
        EngineError::Inference { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use ppl_core::config::{OutputExpectation, StepMode};
    use ppl_mock::{ScriptedProvider, StreamScript};
    use std::collections::BTreeMap;

    fn step(infer_mode: Option<InferMode>) -> Step {
        Step {
            id: "echo".into(),
            prompt_template: "inline: ${chunk.text}".into(),
            input_bindings: BTreeMap::new(),
            mode: StepMode::Text,
            output_name: "echo".into(),
            output_expects: OutputExpectation::None,
            output_schema: None,
            parse_retries: 0,
            infer_mode,
            retrieval: None,
            params: CallParams::default(),
        }
    }

    fn dispatcher(provider: ScriptedProvider) -> (Dispatcher, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let d = Dispatcher::new(
            provider.clone(),
            RetryPolicy::builder()
                .initial_delay(Duration::from_millis(5))
                .jitter(0.0)
                .max_elapsed(Duration::from_secs(10))
                .build(),
            RuntimeContext::default(),
            CancelToken::new(),
        );
        (d, provider)
    }

    fn user(text: &str) -> Vec<Message> {
        vec![Message::user(text)]
    }

    // -- Regular --

    #[tokio::test]
    async fn regular_mode_never_streams() {
        let (d, provider) = dispatcher(ScriptedProvider::echo());
        let (completion, telemetry) = d
            .invoke(&step(Some(InferMode::Regular)), &user("hello"), None)
            .await
            .unwrap();
        assert_eq!(completion.text, "hello");
        assert!(!telemetry.streaming);
        assert_eq!(telemetry.selected_mode, InferMode::Regular);
        assert_eq!(telemetry.chunk_count, 0);
        assert_eq!(telemetry.ttfb_ms, telemetry.latency_ms);
        assert!(telemetry.fallback_reason.is_none());
        assert_eq!(provider.call_count(), 1);
    }

    // -- Stream --

    #[tokio::test]
    async fn stream_mode_streams_and_measures() {
        let (d, _) = dispatcher(ScriptedProvider::echo());
        let (completion, telemetry) = d
            .invoke(&step(Some(InferMode::Stream)), &user("a b c"), None)
            .await
            .unwrap();
        assert_eq!(completion.text, "a b c");
        assert!(telemetry.streaming);
        assert_eq!(telemetry.selected_mode, InferMode::Stream);
        assert_eq!(telemetry.chunk_count, 3);
        assert!(telemetry.fallback_reason.is_none());
    }

    #[tokio::test]
    async fn stream_mode_without_capability_is_provider_error() {
        let (d, provider) = dispatcher(ScriptedProvider::echo().with_streaming(false));
        let err = d
            .invoke(&step(Some(InferMode::Stream)), &user("x"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Provider(_)));
        assert!(err.to_string().contains("streaming unsupported"));
        // No regular call was attempted.
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn stream_mode_mid_stream_error_after_content_fails() {
        let (d, _) = dispatcher(
            ScriptedProvider::echo()
                .with_stream_script(StreamScript::ErrAfterTokens(2, "conn_reset".into())),
        );
        let err = d
            .invoke(&step(Some(InferMode::Stream)), &user("a b c d"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mid-stream failure after content"));
    }

    // -- Auto --

    #[tokio::test]
    async fn auto_streams_when_capability_present() {
        let (d, _) = dispatcher(ScriptedProvider::echo());
        let (_, telemetry) = d
            .invoke(&step(Some(InferMode::Auto)), &user("a b"), None)
            .await
            .unwrap();
        assert!(telemetry.streaming);
        assert!(telemetry.fallback_reason.is_none());
    }

    #[tokio::test]
    async fn auto_without_capability_falls_back_with_reason() {
        let (d, _) = dispatcher(ScriptedProvider::echo().with_streaming(false));
        let (completion, telemetry) = d
            .invoke(&step(Some(InferMode::Auto)), &user("hi"), None)
            .await
            .unwrap();
        assert_eq!(completion.text, "hi");
        assert!(!telemetry.streaming);
        assert_eq!(
            telemetry.fallback_reason.as_deref(),
            Some("streaming_unsupported")
        );
    }

    #[tokio::test]
    async fn auto_falls_back_on_pre_token_stream_error() {
        let (d, provider) = dispatcher(
            ScriptedProvider::echo().with_stream_script(StreamScript::ErrBeforeToken("503".into())),
        );
        let (completion, telemetry) = d
            .invoke(&step(Some(InferMode::Auto)), &user("hi"), None)
            .await
            .unwrap();
        assert_eq!(completion.text, "hi");
        assert!(!telemetry.streaming);
        assert_eq!(telemetry.fallback_reason.as_deref(), Some("stream_error:503"));
        // One regular call after the failed stream attempt.
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn auto_does_not_fall_back_after_content() {
        let (d, _) = dispatcher(
            ScriptedProvider::echo()
                .with_stream_script(StreamScript::ErrAfterTokens(1, "cut".into())),
        );
        let err = d
            .invoke(&step(Some(InferMode::Auto)), &user("a b c"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Inference { .. }));
    }

    // -- Precedence --

    #[tokio::test]
    async fn caller_hint_beats_step_mode() {
        let (d, _) = dispatcher(ScriptedProvider::echo());
        let (_, telemetry) = d
            .invoke(
                &step(Some(InferMode::Stream)),
                &user("x"),
                Some(InferMode::Regular),
            )
            .await
            .unwrap();
        assert!(!telemetry.streaming);
    }

    #[tokio::test]
    async fn env_override_beats_caller_hint() {
        let provider = Arc::new(ScriptedProvider::echo().with_streaming(false));
        let d = Dispatcher::new(
            provider,
            RetryPolicy::default(),
            RuntimeContext::with_override(Some(InferMode::Stream)),
            CancelToken::new(),
        );
        let err = d
            .invoke(&step(None), &user("x"), Some(InferMode::Regular))
            .await
            .unwrap_err();
        // Forced stream mode against a non-streaming provider.
        assert!(matches!(err, EngineError::Provider(_)));
    }

    // -- Retries --

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_counted_as_retries() {
        let (d, provider) = dispatcher(ScriptedProvider::echo().with_transient_failures(2));
        let (_, telemetry) = d
            .invoke(&step(Some(InferMode::Regular)), &user("x"), None)
            .await
            .unwrap();
        assert_eq!(telemetry.retries, 2);
        assert_eq!(provider.call_count(), 3);
    }

    // -- Cancellation --

    #[tokio::test]
    async fn cancelled_scope_aborts_with_sentinel() {
        let provider = Arc::new(ScriptedProvider::echo().with_delay(Duration::from_secs(60)));
        let cancel = CancelToken::new();
        let d = Dispatcher::new(
            provider,
            RetryPolicy::default(),
            RuntimeContext::default(),
            cancel.clone(),
        );
        let s = step(Some(InferMode::Regular));
        let messages = user("x");
        let invoke = d.invoke(&s, &messages, None);
        tokio::pin!(invoke);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            _ = &mut invoke => panic!("should still be in flight"),
        }
        cancel.cancel();
        let err = invoke.await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
