use super::{IterationStats, Scenario};
use crate::client::AdClient;
use crate::config::{ConfigError, ad_ttl_delta};
use crate::request::NewAd;
use crate::sink::{MetricsSink, RequestKind};
use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use std::time::{Duration, Instant};

/// Write-heavy traffic: the same random ad POSTed `repeat` times
pub struct CreateAdScenario {
    client: AdClient,
    repeat: u32,
    ad_ttl: TimeDelta,
}

impl CreateAdScenario {
    /// Fails when `ad_ttl` cannot be added to the current date
    pub fn new(client: AdClient, repeat: u32, ad_ttl: Duration) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            repeat,
            ad_ttl: ad_ttl_delta(ad_ttl)?,
        })
    }
}

#[async_trait]
impl Scenario for CreateAdScenario {
    fn name(&self) -> &'static str {
        "create-ad"
    }

    async fn run_iteration(&self, rng: &mut StdRng, sink: &dyn MetricsSink) -> IterationStats {
        let end_at = Utc::now()
            .naive_utc()
            .checked_add_signed(self.ad_ttl)
            .unwrap_or(NaiveDateTime::MAX);
        let ad = NewAd::generate(rng, end_at);
        let mut stats = IterationStats::default();

        for _ in 0..self.repeat {
            let start = Instant::now();
            let outcome = self.client.create_ad(&ad).await;
            sink.record(RequestKind::CreateAd, &outcome, start.elapsed());
            stats.observe(&outcome);
        }

        stats
    }
}
