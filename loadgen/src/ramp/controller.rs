//! Ramp controller
//!
//! Owns the worker pool of one scenario run. A single task walks the schedule
//! stage by stage: between boundaries it re-evaluates the interpolated target
//! every tick, and at each boundary it applies the stage target exactly.
//! Surplus workers are asked to stop after their current iteration and kept
//! aside until their task finishes.

use super::{RunError, Schedule, Stage, interpolate};
use crate::config::ConfigError;
use crate::scenario::Scenario;
use crate::sink::MetricsSink;
use crate::worker::{self, WorkerContext, WorkerHandle, WorkerReport};
use futures_util::future::join_all;
use metrics::gauge;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Default interval between re-evaluations of the target worker count
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Live view of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub stage_index: usize,
    pub elapsed: Duration,
    /// Workers that have not been asked to stop
    pub active: usize,
    /// Workers asked to stop that are still finishing an iteration
    pub draining: usize,
}

/// Outcome of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub scenario: &'static str,
    pub elapsed: Duration,
    /// Active workers at the end of each completed stage
    pub stage_ends: Vec<usize>,
    /// Highest active worker count observed
    pub peak_active: usize,
    pub workers_spawned: u64,
    /// Workers whose task ended without being asked to stop
    pub workers_lost: u64,
    pub iterations: u64,
    pub requests: u64,
    pub failures: u64,
    /// The run was stopped before the schedule finished
    pub interrupted: bool,
}

/// Spawns and drives runs of one scenario
pub struct RampController {
    ctx: WorkerContext,
    tick: Duration,
}

impl RampController {
    pub fn new(scenario: Arc<dyn Scenario>, sink: Arc<dyn MetricsSink>, sleep: Duration) -> Self {
        Self {
            ctx: WorkerContext {
                scenario,
                sink,
                sleep,
            },
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Validate the schedule and start driving it.
    ///
    /// Fails before any worker exists when the schedule is invalid. Must be
    /// called from within a tokio runtime.
    pub fn start(&self, stages: Vec<Stage>, initial_workers: usize) -> Result<RunHandle, ConfigError> {
        let schedule = Schedule::new(initial_workers, stages)?;
        let scenario = self.ctx.scenario.name();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(Progress::default());

        let run = Run {
            ctx: self.ctx.clone(),
            tick: self.tick,
            schedule,
            progress_tx,
        };
        let span = info_span!("ramp", scenario, run_id = %Uuid::new_v4());
        let task = tokio::spawn(run.drive(stop_rx).instrument(span));

        Ok(RunHandle {
            scenario,
            stop_tx: Arc::new(stop_tx),
            progress_rx,
            task,
        })
    }
}

/// Cloneable trigger that stops a run
#[derive(Debug, Clone)]
pub struct Stopper(Arc<watch::Sender<bool>>);

impl Stopper {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

/// Caller side of a running schedule
#[derive(Debug)]
pub struct RunHandle {
    scenario: &'static str,
    stop_tx: Arc<watch::Sender<bool>>,
    progress_rx: watch::Receiver<Progress>,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn scenario(&self) -> &'static str {
        self.scenario
    }

    pub fn progress(&self) -> Progress {
        *self.progress_rx.borrow()
    }

    /// Subscribe to progress updates
    pub fn watch_progress(&self) -> watch::Receiver<Progress> {
        self.progress_rx.clone()
    }

    pub fn stopper(&self) -> Stopper {
        Stopper(self.stop_tx.clone())
    }

    /// Stop every worker and wait until all of them have drained
    pub async fn stop(self) -> Result<RunReport, RunError> {
        self.stopper().stop();
        self.wait().await
    }

    /// Wait for the schedule to finish and the workers to drain
    pub async fn wait(self) -> Result<RunReport, RunError> {
        Ok(self.task.await?)
    }
}

/// Mutable state of one run, owned by the controller task
struct RunState {
    started: Instant,
    stage_index: usize,
    elapsed: Duration,
    active: Vec<WorkerHandle>,
    draining: Vec<WorkerHandle>,
    next_id: u64,
    peak_active: usize,
    stage_ends: Vec<usize>,
    workers_lost: u64,
    iterations: u64,
    requests: u64,
    failures: u64,
}

impl RunState {
    fn new(started: Instant) -> Self {
        Self {
            started,
            stage_index: 0,
            elapsed: Duration::ZERO,
            active: Vec::new(),
            draining: Vec::new(),
            next_id: 1,
            peak_active: 0,
            stage_ends: Vec::new(),
            workers_lost: 0,
            iterations: 0,
            requests: 0,
            failures: 0,
        }
    }

    fn absorb(&mut self, report: WorkerReport) {
        self.iterations += report.iterations;
        self.requests += report.requests;
        self.failures += report.failures;
    }

    /// Join workers that finished draining
    async fn reap(&mut self) {
        if !self.draining.iter().any(WorkerHandle::is_finished) {
            return;
        }
        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.draining)
            .into_iter()
            .partition(WorkerHandle::is_finished);
        self.draining = pending;
        for handle in finished {
            let report = handle.join().await;
            self.absorb(report);
        }
    }

    /// Pull out active workers whose task already ended, e.g. after a panic
    async fn reap_lost(&mut self) {
        if !self.active.iter().any(WorkerHandle::is_finished) {
            return;
        }
        let (lost, alive): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(WorkerHandle::is_finished);
        self.active = alive;
        for handle in lost {
            let id = handle.id();
            let report = handle.join().await;
            warn!(worker = id, "Worker exited without being stopped");
            self.workers_lost += 1;
            self.absorb(report);
        }
    }

    fn progress(&self) -> Progress {
        Progress {
            stage_index: self.stage_index,
            elapsed: self.elapsed,
            active: self.active.len(),
            draining: self.draining.len(),
        }
    }
}

struct Run {
    ctx: WorkerContext,
    tick: Duration,
    schedule: Schedule,
    progress_tx: watch::Sender<Progress>,
}

impl Run {
    async fn drive(self, mut stop_rx: watch::Receiver<bool>) -> RunReport {
        let mut state = RunState::new(Instant::now());
        info!(
            initial = self.schedule.initial_workers(),
            stages = self.schedule.stages().len(),
            duration = ?self.schedule.total_duration(),
            "Starting ramp"
        );

        self.reconcile(&mut state, self.schedule.initial_workers())
            .await;

        let mut interrupted = false;
        'stages: for (index, stage) in self.schedule.stages().iter().enumerate() {
            state.stage_index = index;
            let stage_start = state.started + self.schedule.stage_offset(index);
            let stage_end = stage_start + stage.duration;
            let origin = self.schedule.stage_origin(index);

            loop {
                let now = Instant::now();
                if now >= stage_end {
                    break;
                }

                let into = now.saturating_duration_since(stage_start);
                let progress = into.as_secs_f64() / stage.duration.as_secs_f64();
                self.reconcile(&mut state, interpolate(origin, stage.target, progress))
                    .await;

                let wake = (now + self.tick).min(stage_end);
                tokio::select! {
                    _ = sleep_until(wake) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            interrupted = true;
                            break 'stages;
                        }
                    }
                }
            }

            self.reconcile(&mut state, stage.target).await;
            state.stage_ends.push(state.active.len());
            debug!(
                stage = index,
                target = stage.target,
                active = state.active.len(),
                "Stage complete"
            );
        }

        if interrupted {
            info!(stage = state.stage_index, "Ramp interrupted, stopping workers");
        }
        self.drain(state, interrupted).await
    }

    /// Spawn or stop workers until exactly `target` are active
    async fn reconcile(&self, state: &mut RunState, target: usize) {
        state.reap().await;
        state.reap_lost().await;

        while state.active.len() < target {
            let id = state.next_id;
            state.next_id += 1;
            state.active.push(worker::spawn(id, self.ctx.clone()));
        }

        // Most recently spawned workers leave first
        while state.active.len() > target {
            if let Some(handle) = state.active.pop() {
                handle.signal_stop();
                state.draining.push(handle);
            }
        }

        state.peak_active = state.peak_active.max(state.active.len());
        state.elapsed = state.started.elapsed();
        gauge!("adload_workers_active", "scenario" => self.ctx.scenario.name())
            .set(state.active.len() as f64);
        self.progress_tx.send_replace(state.progress());
    }

    /// Stop everything and wait for every worker to exit
    async fn drain(&self, mut state: RunState, interrupted: bool) -> RunReport {
        state.reap_lost().await;
        for handle in state.active.drain(..) {
            handle.signal_stop();
            state.draining.push(handle);
        }
        self.progress_tx.send_replace(state.progress());
        gauge!("adload_workers_active", "scenario" => self.ctx.scenario.name()).set(0.0);

        let draining = std::mem::take(&mut state.draining);
        debug!(workers = draining.len(), "Draining workers");
        for report in join_all(draining.into_iter().map(WorkerHandle::join)).await {
            state.absorb(report);
        }

        state.elapsed = state.started.elapsed();
        self.progress_tx.send_replace(state.progress());

        let report = RunReport {
            scenario: self.ctx.scenario.name(),
            elapsed: state.elapsed,
            stage_ends: state.stage_ends,
            peak_active: state.peak_active,
            workers_spawned: state.next_id - 1,
            workers_lost: state.workers_lost,
            iterations: state.iterations,
            requests: state.requests,
            failures: state.failures,
            interrupted,
        };
        info!(
            elapsed = ?report.elapsed,
            peak_active = report.peak_active,
            workers = report.workers_spawned,
            lost = report.workers_lost,
            iterations = report.iterations,
            requests = report.requests,
            failures = report.failures,
            "Ramp finished"
        );
        report
    }
}
