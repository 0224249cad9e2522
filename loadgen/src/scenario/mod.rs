//! Scenario iterations
//!
//! A scenario is the body a virtual worker runs once per iteration: build the
//! request parameters, issue the requests sequentially and record every
//! outcome. Scenarios never retry and never fail an iteration as a whole.

mod create_ad;
mod query_ad;

pub use create_ad::CreateAdScenario;
pub use query_ad::QueryAdScenario;

use crate::sink::{MetricsSink, Outcome};
use async_trait::async_trait;
use rand::rngs::StdRng;

/// Requests issued and failed during one iteration
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IterationStats {
    pub requests: u64,
    pub failures: u64,
    /// Failed requests since the last success of the iteration
    pub trailing_failures: u64,
}

impl IterationStats {
    pub fn observe(&mut self, outcome: &Outcome) {
        self.requests += 1;
        if outcome.is_success() {
            self.trailing_failures = 0;
        } else {
            self.failures += 1;
            self.trailing_failures += 1;
        }
    }

    /// Every request of the iteration failed
    pub fn all_failed(&self) -> bool {
        self.requests > 0 && self.failures == self.requests
    }
}

/// One traffic shape
#[async_trait]
pub trait Scenario: Send + Sync {
    /// Name used in logs and metric labels
    fn name(&self) -> &'static str;

    /// Run the scenario body once
    async fn run_iteration(&self, rng: &mut StdRng, sink: &dyn MetricsSink) -> IterationStats;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::TransportError;

    #[test]
    fn test_iteration_stats() {
        let mut stats = IterationStats::default();
        assert!(!stats.all_failed());

        stats.observe(&Outcome::Status(500));
        stats.observe(&Outcome::Transport(TransportError::Timeout));
        assert_eq!(stats.requests, 2);
        assert!(stats.all_failed());

        assert_eq!(stats.trailing_failures, 2);

        stats.observe(&Outcome::Status(200));
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.trailing_failures, 0);
        assert!(!stats.all_failed());

        stats.observe(&Outcome::Status(502));
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.trailing_failures, 1);
    }
}
