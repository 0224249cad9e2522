use super::{IterationStats, Scenario};
use crate::client::AdClient;
use crate::request::QueryParams;
use crate::sink::{MetricsSink, RequestKind};
use async_trait::async_trait;
use rand::rngs::StdRng;
use std::time::Instant;

/// Read-heavy traffic: `repeat` pages of one random filter, offsets 0, 1, 2, ...
pub struct QueryAdScenario {
    client: AdClient,
    repeat: u32,
}

impl QueryAdScenario {
    pub fn new(client: AdClient, repeat: u32) -> Self {
        Self { client, repeat }
    }
}

#[async_trait]
impl Scenario for QueryAdScenario {
    fn name(&self) -> &'static str {
        "query-ad"
    }

    async fn run_iteration(&self, rng: &mut StdRng, sink: &dyn MetricsSink) -> IterationStats {
        let params = QueryParams::generate(rng);
        let mut stats = IterationStats::default();

        for offset in 0..self.repeat {
            let start = Instant::now();
            let outcome = self.client.query_ads(&params.page(offset)).await;
            sink.record(RequestKind::QueryAd, &outcome, start.elapsed());
            stats.observe(&outcome);
        }

        stats
    }
}
