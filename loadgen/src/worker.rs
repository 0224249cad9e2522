//! Virtual worker
//!
//! A worker runs scenario iterations back to back with a fixed pause in
//! between. The stop signal is only honoured between iterations, so a started
//! request batch always completes; the pause itself is cut short by a stop.

use crate::scenario::{IterationStats, Scenario};
use crate::sink::MetricsSink;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info_span, warn};

/// Consecutive failed requests between "target unreachable" warnings
pub const FAILURE_WARN_EVERY: u64 = 100;

/// Consecutive failed requests across iteration boundaries
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct FailureStreak(u64);

impl FailureStreak {
    /// Fold in one iteration; true when the streak reaches a new multiple of
    /// [`FAILURE_WARN_EVERY`]
    fn observe(&mut self, stats: &IterationStats) -> bool {
        let before = self.0;
        if stats.requests > 0 && stats.trailing_failures == stats.requests {
            self.0 += stats.requests;
        } else if stats.requests > 0 {
            // A success inside the batch restarts the count
            self.0 = stats.trailing_failures;
            return self.0 >= FAILURE_WARN_EVERY;
        }
        self.0 / FAILURE_WARN_EVERY > before / FAILURE_WARN_EVERY
    }
}

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => WorkerState::Starting,
            1 => WorkerState::Running,
            2 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerState::Starting as u8)))
    }

    fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// States only move forward
    fn advance(&self, state: WorkerState) {
        self.0.fetch_max(state as u8, Ordering::AcqRel);
    }
}

/// What a worker did over its lifetime
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub id: u64,
    pub iterations: u64,
    pub requests: u64,
    pub failures: u64,
}

impl WorkerReport {
    fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    fn absorb(&mut self, stats: IterationStats) {
        self.iterations += 1;
        self.requests += stats.requests;
        self.failures += stats.failures;
    }
}

/// Everything a worker needs besides its identity
#[derive(Clone)]
pub struct WorkerContext {
    pub scenario: Arc<dyn Scenario>,
    pub sink: Arc<dyn MetricsSink>,
    /// Pause between iterations
    pub sleep: Duration,
}

/// Controller side of a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    id: u64,
    state: SharedState,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<WorkerReport>,
}

impl WorkerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    /// Ask the worker to stop after its current iteration
    pub fn signal_stop(&self) {
        self.state.advance(WorkerState::Stopping);
        self.stop_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the worker to exit
    pub async fn join(self) -> WorkerReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!(worker = self.id, "Worker task failed: {}", e);
                self.state.advance(WorkerState::Stopped);
                WorkerReport::new(self.id)
            }
        }
    }
}

/// Spawn a worker on the current tokio runtime
pub fn spawn(id: u64, ctx: WorkerContext) -> WorkerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let state = SharedState::new();

    let worker = Worker {
        id,
        ctx,
        state: state.clone(),
        stop_rx,
        rng: StdRng::from_os_rng(),
    };
    let span = info_span!("worker", id);
    let task = tokio::spawn(worker.run().instrument(span));

    WorkerHandle {
        id,
        state,
        stop_tx,
        task,
    }
}

struct Worker {
    id: u64,
    ctx: WorkerContext,
    state: SharedState,
    stop_rx: watch::Receiver<bool>,
    rng: StdRng,
}

impl Worker {
    async fn run(mut self) -> WorkerReport {
        self.state.advance(WorkerState::Running);
        let mut report = WorkerReport::new(self.id);
        let mut failure_streak = FailureStreak::default();

        loop {
            if *self.stop_rx.borrow_and_update() {
                break;
            }

            let stats = self
                .ctx
                .scenario
                .run_iteration(&mut self.rng, self.ctx.sink.as_ref())
                .await;
            report.absorb(stats);

            if failure_streak.observe(&stats) {
                warn!(
                    scenario = self.ctx.scenario.name(),
                    failure_streak = failure_streak.0,
                    "Target keeps failing; continuing without backoff"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.sleep) => {}
                changed = self.stop_rx.changed() => {
                    // Handle dropped: nobody can stop us any more
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.state.advance(WorkerState::Stopping);
        debug!(
            iterations = report.iterations,
            requests = report.requests,
            "Worker stopped"
        );
        self.state.advance(WorkerState::Stopped);
        report
    }
}
