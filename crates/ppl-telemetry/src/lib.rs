// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! ppl-telemetry
#![deny(unsafe_code)]
#![warn(missing_docs)]

use ppl_core::{InferenceTelemetry, StepTelemetrySnapshot};
use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

// ---------------------------------------------------------------------------
// CounterRegistry
// ---------------------------------------------------------------------------

/// Thread-safe registry of named counters grouped by label.
///
/// Labels identify a logical emitter (a step id, a provider, a retry call
/// site); counters are plain names like `attempts` or `sleep_ms`. Snapshots
/// have no read side effects.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    inner: Mutex<BTreeMap<String, BTreeMap<String, u64>>>,
}

impl CounterRegistry {
    /// A new, empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to `label.counter`, creating it at zero first if needed.
    pub fn add(&self, label: &str, counter: &str, delta: u64) {
        let mut inner = self.inner.lock().expect("counter lock poisoned");
        *inner
            .entry(label.to_string())
            .or_default()
            .entry(counter.to_string())
            .or_insert(0) += delta;
    }

    /// Increment `label.counter` by one.
    pub fn incr(&self, label: &str, counter: &str) {
        self.add(label, counter, 1);
    }

    /// Point-in-time copy of every counter, deterministically ordered.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, u64>> {
        self.inner.lock().expect("counter lock poisoned").clone()
    }

    /// Point-in-time copy of one label's counters.
    pub fn snapshot_label(&self, label: &str) -> BTreeMap<String, u64> {
        self.inner
            .lock()
            .expect("counter lock poisoned")
            .get(label)
            .cloned()
            .unwrap_or_default()
    }

    /// Read a single counter value (0 when absent).
    pub fn get(&self, label: &str, counter: &str) -> u64 {
        self.inner
            .lock()
            .expect("counter lock poisoned")
            .get(label)
            .and_then(|c| c.get(counter))
            .copied()
            .unwrap_or(0)
    }

    /// Drop every counter. Intended for tests.
    pub fn clear(&self) {
        self.inner.lock().expect("counter lock poisoned").clear();
    }

    /// Export the full snapshot as pretty-printed JSON.
    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }
}

static GLOBAL: OnceLock<CounterRegistry> = OnceLock::new();

/// The process-wide counter registry.
pub fn global() -> &'static CounterRegistry {
    GLOBAL.get_or_init(CounterRegistry::new)
}

// ---------------------------------------------------------------------------
// Step aggregation
// ---------------------------------------------------------------------------

/// Folds per-call [`InferenceTelemetry`] values into a step-level snapshot.
#[derive(Debug, Default)]
pub struct StepTelemetry {
    snap: StepTelemetrySnapshot,
}

impl StepTelemetry {
    /// A new, zeroed aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one call's telemetry.
    pub fn record(&mut self, call: &InferenceTelemetry) {
        self.snap.calls += 1;
        if call.streaming {
            self.snap.streamed += 1;
            self.snap.streaming = true;
        }
        if let Some(reason) = &call.fallback_reason {
            self.snap.fallbacks += 1;
            self.snap.fallback_reason = Some(reason.clone());
        }
        self.snap.ttfb_ms_total += call.ttfb_ms;
        self.snap.latency_ms_total += call.latency_ms;
        self.snap.latency_ms_max = self.snap.latency_ms_max.max(call.latency_ms);
        self.snap.chunk_count += call.chunk_count;
        self.snap.tokens_out += call.tokens_out;
        self.snap.retries += call.retries;
    }

    /// Record a unit whose JSON output could not be enforced.
    pub fn record_json_failure(&mut self) {
        self.snap.json_parse_failures += 1;
    }

    /// The aggregated snapshot so far.
    pub fn snapshot(&self) -> StepTelemetrySnapshot {
        self.snap.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
