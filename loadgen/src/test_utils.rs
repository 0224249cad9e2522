//! Test Utilities Module
//!
//! Scripted scenarios and recording sinks for exercising workers and the ramp
//! controller without a network. Only compiled when running tests.

#![cfg(test)]

use crate::scenario::{IterationStats, Scenario};
use crate::sink::{MetricsSink, Outcome, RequestKind};
use async_trait::async_trait;
use rand::rngs::StdRng;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// ============================================================================
// Sinks
// ============================================================================

/// Sink that keeps every record
#[derive(Debug, Default)]
pub struct CountingSink {
    records: Mutex<Vec<(RequestKind, Outcome)>>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn records(&self) -> Vec<(RequestKind, Outcome)> {
        self.records.lock().unwrap().clone()
    }
}

impl MetricsSink for CountingSink {
    fn record(&self, kind: RequestKind, outcome: &Outcome, _latency: Duration) {
        self.records.lock().unwrap().push((kind, *outcome));
    }
}

// ============================================================================
// Scenarios
// ============================================================================

/// Scenario whose "requests" are timed sleeps
#[derive(Debug)]
pub struct ScriptedScenario {
    requests: usize,
    request_time: Duration,
    status: u16,
    panic_on: Option<u64>,
    started: AtomicU64,
    completed: AtomicU64,
}

impl ScriptedScenario {
    pub fn new(requests: usize, request_time: Duration) -> Self {
        Self {
            requests,
            request_time,
            status: 200,
            panic_on: None,
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Every request answers 503
    pub fn failing(mut self) -> Self {
        self.status = 503;
        self
    }

    /// The `n`th iteration started across all workers panics
    pub fn panicking_on(mut self, n: u64) -> Self {
        self.panic_on = Some(n);
        self
    }

    /// Iterations begun so far
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::SeqCst)
    }

    /// Iterations whose whole batch finished
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scenario for ScriptedScenario {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run_iteration(&self, _rng: &mut StdRng, sink: &dyn MetricsSink) -> IterationStats {
        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_on == Some(n) {
            panic!("scripted iteration {n} panicked");
        }
        let mut stats = IterationStats::default();

        for _ in 0..self.requests {
            tokio::time::sleep(self.request_time).await;
            let outcome = Outcome::Status(self.status);
            sink.record(RequestKind::QueryAd, &outcome, self.request_time);
            stats.observe(&outcome);
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        stats
    }
}
