//! Fire-and-forget progress reporting
//!
//! Stages report completed-unit counts as they go. Reporting is best-effort:
//! a sink must never block a stage or fail the run. The default sink emits
//! structured tracing events; tests use [`CountingSink`] to assert on totals.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Receives progress updates from pipeline stages.
pub trait ProgressSink: Send + Sync {
    /// Record that `stage` completed `done` more units. Totals are not known
    /// up front; sinks accumulate.
    fn report(&self, stage: &str, done: u64);
}

/// Cloneable handle the stages hold; wraps a shared sink.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    /// Wrap a sink.
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink }
    }

    /// Report progress; never blocks, never fails.
    pub fn report(&self, stage: &str, done: u64) {
        if done > 0 {
            self.sink.report(stage, done);
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

/// Default sink: structured tracing events, one per report.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn report(&self, stage: &str, done: u64) {
        tracing::debug!(stage = %stage, done, "progress");
    }
}

/// Accumulating sink for tests and embedders that want totals.
#[derive(Default)]
pub struct CountingSink {
    totals: Mutex<HashMap<String, u64>>,
}

impl CountingSink {
    /// Total units reported so far for `stage`.
    pub fn total(&self, stage: &str) -> u64 {
        self.totals
            .lock()
            .map(|t| t.get(stage).copied().unwrap_or(0))
            .unwrap_or(0)
    }
}

impl ProgressSink for CountingSink {
    fn report(&self, stage: &str, done: u64) {
        if let Ok(mut totals) = self.totals.lock() {
            *totals.entry(stage.to_string()).or_insert(0) += done;
        }
    }
}
