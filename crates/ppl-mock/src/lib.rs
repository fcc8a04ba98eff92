// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ppl-mock
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use ppl_core::contract::{
    Connector, ExportOptions, ExportPayload, ExportResult, ExportSink, Provider,
    RetrievalPipeline, RetrievalRequest, RetrievalResult, SecretSource,
};
use ppl_core::error::ConnectorErrorKind;
use ppl_core::{CallParams, Completion, Content, EngineError, Message, Resource, TokenChunk};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

/// How a scripted stream behaves.
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// Deltas then a terminal chunk.
    Clean,
    /// Fail with the given code before any token is emitted.
    ErrBeforeToken(String),
    /// Emit `n` deltas, then fail with the given code.
    ErrAfterTokens(usize, String),
}

/// A provider for unit and workspace tests.
///
/// Replies come from a scripted queue when one is loaded, otherwise the
/// provider echoes the last user message's text. Supports streaming with
/// configurable failure points, transient-failure injection for retry
/// tests, call recording, and in-flight high-water tracking for
/// concurrency-cap assertions.
pub struct ScriptedProvider {
    name: String,
    streaming_supported: bool,
    stream_script: Mutex<StreamScript>,
    replies: Mutex<VecDeque<Result<Completion, EngineError>>>,
    transient_failures: AtomicU32,
    delay: Option<Duration>,
    calls: Mutex<Vec<Vec<Message>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    /// An echoing provider with streaming support.
    pub fn echo() -> Self {
        Self {
            name: "scripted".into(),
            streaming_supported: true,
            stream_script: Mutex::new(StreamScript::Clean),
            replies: Mutex::new(VecDeque::new()),
            transient_failures: AtomicU32::new(0),
            delay: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Toggle the advertised streaming capability.
    #[must_use]
    pub fn with_streaming(mut self, supported: bool) -> Self {
        self.streaming_supported = supported;
        self
    }

    /// Configure streaming behaviour.
    #[must_use]
    pub fn with_stream_script(self, script: StreamScript) -> Self {
        *self.stream_script.lock().unwrap() = script;
        self
    }

    /// Queue fixed replies, consumed in order before echoing resumes.
    #[must_use]
    pub fn with_replies(self, replies: Vec<Result<Completion, EngineError>>) -> Self {
        self.replies.lock().unwrap().extend(replies);
        self
    }

    /// Queue plain-text replies.
    #[must_use]
    pub fn with_texts(self, texts: Vec<&str>) -> Self {
        let replies = texts
            .into_iter()
            .map(|t| {
                Ok(Completion {
                    text: t.to_string(),
                    finish_reason: Some("stop".into()),
                    ..Completion::default()
                })
            })
            .collect();
        self.with_replies(replies)
    }

    /// Fail the first `n` calls with a transient inference error.
    #[must_use]
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Hold each call open for `delay`, so overlap becomes observable.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every recorded call's messages, in call order.
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn last_user_text(messages: &[Message]) -> String {
        messages
            .iter()
            .rev()
            .find(|m| m.role == ppl_core::Role::User)
            .map(|m| match &m.content {
                Content::Text(t) => t.clone(),
                Content::Parts(parts) => parts
                    .iter()
                    .filter_map(|p| match p {
                        ppl_core::ContentPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            })
            .unwrap_or_default()
    }

    async fn produce(&self, messages: &[Message]) -> Result<Completion, EngineError> {
        self.calls.lock().unwrap().push(messages.to_vec());

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(EngineError::inference_transient("injected 429"));
        }

        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        Ok(Completion {
            text: Self::last_user_text(messages),
            finish_reason: Some("stop".into()),
            ..Completion::default()
        })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_streaming(&self) -> bool {
        self.streaming_supported
    }

    async fn complete(
        &self,
        messages: &[Message],
        _params: &CallParams,
    ) -> Result<Completion, EngineError> {
        self.produce(messages).await
    }

    async fn stream(
        &self,
        messages: &[Message],
        _params: &CallParams,
    ) -> Result<mpsc::Receiver<Result<TokenChunk, EngineError>>, EngineError> {
        if !self.streaming_supported {
            return Err(EngineError::Provider(format!(
                "streaming unsupported by {}",
                self.name
            )));
        }
        let script = self.stream_script.lock().unwrap().clone();
        let (tx, rx) = mpsc::channel(16);

        if let StreamScript::ErrBeforeToken(code) = &script {
            let code = code.clone();
            tokio::spawn(async move {
                let _ = tx.send(Err(EngineError::inference_transient(code))).await;
            });
            return Ok(rx);
        }

        let completion = self.produce(messages).await?;
        tokio::spawn(async move {
            let deltas: Vec<String> = completion
                .text
                .split_inclusive(' ')
                .map(str::to_string)
                .collect();
            match script {
                StreamScript::Clean => {
                    for (i, delta) in deltas.iter().enumerate() {
                        let chunk = TokenChunk {
                            delta: delta.clone(),
                            index: Some(i as u32),
                            completion: None,
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Ok(TokenChunk::terminal(completion))).await;
                }
                StreamScript::ErrAfterTokens(n, code) => {
                    for (i, delta) in deltas.iter().take(n).enumerate() {
                        let chunk = TokenChunk {
                            delta: delta.clone(),
                            index: Some(i as u32),
                            completion: None,
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Err(EngineError::inference(code))).await;
                }
                StreamScript::ErrBeforeToken(_) => unreachable!(),
            }
        });
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// MemoryConnector
// ---------------------------------------------------------------------------

/// A connector over an in-memory uri → bytes map.
#[derive(Default)]
pub struct MemoryConnector {
    entries: Vec<(Resource, Vec<u8>)>,
}

impl MemoryConnector {
    /// An empty connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a textual resource.
    #[must_use]
    pub fn with_text(mut self, uri: &str, mime: &str, body: &str) -> Self {
        let bytes = body.as_bytes().to_vec();
        self.entries.push((
            Resource {
                uri: uri.to_string(),
                mime: mime.to_string(),
                size_bytes: bytes.len() as u64,
                etag_or_hash: None,
                modified_at: None,
            },
            bytes,
        ));
        self
    }

    /// Add a binary resource.
    #[must_use]
    pub fn with_bytes(mut self, uri: &str, mime: &str, bytes: Vec<u8>) -> Self {
        self.entries.push((
            Resource {
                uri: uri.to_string(),
                mime: mime.to_string(),
                size_bytes: bytes.len() as u64,
                etag_or_hash: None,
                modified_at: None,
            },
            bytes,
        ));
        self
    }

    fn compile(selectors: &[String]) -> Result<Option<GlobSet>, EngineError> {
        if selectors.is_empty() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        for selector in selectors {
            let glob = Glob::new(selector).map_err(|e| EngineError::Connector {
                kind: ConnectorErrorKind::InvalidSelector,
                message: format!("{selector}: {e}"),
            })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|e| EngineError::Connector {
            kind: ConnectorErrorKind::InvalidSelector,
            message: e.to_string(),
        })?;
        Ok(Some(set))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn list(&self, selectors: &[String]) -> Result<Vec<Resource>, EngineError> {
        let set = Self::compile(selectors)?;
        Ok(self
            .entries
            .iter()
            .filter(|(r, _)| set.as_ref().is_none_or(|s| s.is_match(&r.uri)))
            .map(|(r, _)| r.clone())
            .collect())
    }

    async fn open(
        &self,
        resource: &Resource,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, EngineError> {
        let bytes = self
            .entries
            .iter()
            .find(|(r, _)| r.uri == resource.uri)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| EngineError::Connector {
                kind: ConnectorErrorKind::NotFound,
                message: resource.uri.clone(),
            })?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }
}

// ---------------------------------------------------------------------------
// RecordingSink
// ---------------------------------------------------------------------------

/// An export sink that records every write.
#[derive(Default)]
pub struct RecordingSink {
    writes: Mutex<Vec<(ExportPayload, ExportOptions)>>,
    finalized: AtomicU32,
}

impl RecordingSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded write, in order.
    pub fn writes(&self) -> Vec<(ExportPayload, ExportOptions)> {
        self.writes.lock().unwrap().clone()
    }

    /// How many times `finalize` was called.
    pub fn finalize_count(&self) -> u32 {
        self.finalized.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExportSink for RecordingSink {
    async fn write(
        &self,
        payload: ExportPayload,
        options: &ExportOptions,
    ) -> Result<ExportResult, EngineError> {
        options.validate()?;
        let result = match &payload {
            ExportPayload::Records(records) => ExportResult {
                records_written: records.len() as u64,
                bytes_written: 0,
            },
            ExportPayload::Bytes(bytes) => ExportResult {
                records_written: 0,
                bytes_written: bytes.len() as u64,
            },
        };
        self.writes.lock().unwrap().push((payload, options.clone()));
        Ok(result)
    }

    async fn finalize(&self) -> Result<(), EngineError> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CannedRetrieval
// ---------------------------------------------------------------------------

/// A retrieval pipeline returning a fixed result.
pub struct CannedRetrieval {
    name: String,
    result: RetrievalResult,
    fail: bool,
    queries: Mutex<Vec<String>>,
}

impl CannedRetrieval {
    /// A pipeline returning the given result for every query.
    pub fn new(name: &str, result: RetrievalResult) -> Self {
        Self {
            name: name.to_string(),
            result,
            fail: false,
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Make every retrieve call fail.
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Every query seen, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetrievalPipeline for CannedRetrieval {
    fn name(&self) -> &str {
        &self.name
    }

    async fn retrieve(
        &self,
        query: &str,
        request: &RetrievalRequest,
    ) -> Result<RetrievalResult, EngineError> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.fail {
            return Err(EngineError::processing(format!(
                "retrieval pipeline '{}' unavailable",
                self.name
            )));
        }
        let mut result = self.result.clone();
        result.text_items.truncate(request.top_k_text as usize);
        result.image_items.truncate(request.top_k_images as usize);
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// MapSecrets
// ---------------------------------------------------------------------------

/// A secret source over a fixed name → value map.
#[derive(Default)]
pub struct MapSecrets {
    values: BTreeMap<String, String>,
}

impl MapSecrets {
    /// An empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret.
    #[must_use]
    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl SecretSource for MapSecrets {
    async fn resolve(&self, logical_name: &str) -> Result<String, EngineError> {
        self.values
            .get(logical_name)
            .cloned()
            .ok_or_else(|| EngineError::Secret(format!("missing: {logical_name}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
