//! Staged worker ramping
//!
//! A schedule is an initial worker count followed by stages. Each stage moves
//! the desired worker count linearly from the previous target (or the initial
//! count) to its own target over its duration.

pub mod controller;

pub use controller::{Progress, RampController, RunHandle, RunReport, Stopper};

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// One segment of the ramp schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    /// Worker count reached at the end of the stage
    pub target: usize,
    /// Time taken to get there
    pub duration: Duration,
}

impl Stage {
    pub fn new(target: usize, duration: Duration) -> Self {
        Self { target, duration }
    }
}

/// Errors surfaced once a run is underway
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Ramp controller task failed: {0}")]
    Controller(#[from] tokio::task::JoinError),
}

/// Validated, immutable ramp schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    initial_workers: usize,
    stages: Vec<Stage>,
}

impl Schedule {
    pub fn new(initial_workers: usize, stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::EmptySchedule);
        }
        Ok(Self {
            initial_workers,
            stages,
        })
    }

    pub fn initial_workers(&self) -> usize {
        self.initial_workers
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Sum of all stage durations
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Offset from run start at which stage `index` begins
    pub fn stage_offset(&self, index: usize) -> Duration {
        self.stages[..index.min(self.stages.len())]
            .iter()
            .map(|s| s.duration)
            .sum()
    }

    /// Worker count stage `index` ramps from
    pub fn stage_origin(&self, index: usize) -> usize {
        match index {
            0 => self.initial_workers,
            i => self.stages[(i - 1).min(self.stages.len() - 1)].target,
        }
    }

    /// Desired worker count `elapsed` into the run
    pub fn target_at(&self, elapsed: Duration) -> usize {
        let mut start = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            let end = start + stage.duration;
            if elapsed < end {
                let progress = (elapsed - start).as_secs_f64() / stage.duration.as_secs_f64();
                return interpolate(self.stage_origin(index), stage.target, progress);
            }
            start = end;
        }
        self.stages
            .last()
            .map(|s| s.target)
            .unwrap_or(self.initial_workers)
    }
}

/// Linear interpolation between two worker counts, rounded to the nearest
/// worker. The result never leaves `[min(from, to), max(from, to)]`.
pub fn interpolate(from: usize, to: usize, progress: f64) -> usize {
    let progress = progress.clamp(0.0, 1.0);
    let value = from as f64 + (to as f64 - from as f64) * progress;
    (value.round() as usize).clamp(from.min(to), from.max(to))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_empty_schedule_is_rejected() {
        assert!(matches!(
            Schedule::new(10, vec![]),
            Err(ConfigError::EmptySchedule)
        ));
    }

    #[test]
    fn test_interpolate_bounds() {
        assert_eq!(interpolate(100, 200, 0.0), 100);
        assert_eq!(interpolate(100, 200, 0.5), 150);
        assert_eq!(interpolate(100, 200, 1.0), 200);
        assert_eq!(interpolate(200, 100, 0.25), 175);
        assert_eq!(interpolate(5, 5, 0.7), 5);
        // Out of range progress is clamped
        assert_eq!(interpolate(0, 10, 3.0), 10);
        assert_eq!(interpolate(0, 10, -1.0), 0);
    }

    #[test]
    fn test_target_at_single_ramp() {
        let schedule = Schedule::new(100, vec![Stage::new(200, secs(10))]).unwrap();
        assert_eq!(schedule.target_at(Duration::ZERO), 100);
        assert_eq!(schedule.target_at(secs(5)), 150);
        assert_eq!(schedule.target_at(Duration::from_millis(9_990)), 200);
        assert_eq!(schedule.target_at(secs(10)), 200);
        assert_eq!(schedule.target_at(secs(60)), 200);
    }

    #[test]
    fn test_target_at_multi_stage() {
        let schedule = Schedule::new(
            0,
            vec![
                Stage::new(10, secs(10)),
                Stage::new(10, secs(5)),
                Stage::new(0, secs(10)),
            ],
        )
        .unwrap();

        assert_eq!(schedule.total_duration(), secs(25));
        assert_eq!(schedule.target_at(secs(2)), 2);
        assert_eq!(schedule.target_at(secs(12)), 10);
        assert_eq!(schedule.target_at(secs(20)), 5);
        assert_eq!(schedule.target_at(secs(25)), 0);
    }

    #[test]
    fn test_zero_duration_stage_jumps() {
        let schedule = Schedule::new(
            3,
            vec![Stage::new(8, Duration::ZERO), Stage::new(8, secs(4))],
        )
        .unwrap();
        assert_eq!(schedule.target_at(Duration::ZERO), 8);
        assert_eq!(schedule.stage_origin(1), 8);
        assert_eq!(schedule.stage_offset(1), Duration::ZERO);
    }

    #[test]
    fn test_ramp_never_overshoots() {
        let schedule = Schedule::new(100, vec![Stage::new(200, secs(10))]).unwrap();
        for ms in (0..=10_000).step_by(7) {
            let target = schedule.target_at(Duration::from_millis(ms));
            assert!((100..=200).contains(&target), "{target} at {ms}ms");
        }
    }
}
