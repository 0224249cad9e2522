//! Request outcome recording
//!
//! Every request attempt is reported exactly once through [`MetricsSink`].
//! [`RunMetrics`] keeps in-process counters and latency samples for the
//! end-of-run summary, and forwards each record to the `metrics` facade so an
//! installed exporter sees live progress.

use hdrhistogram::Histogram;
use metrics::{counter, histogram};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Kind of request issued against the ad server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `POST /ad`
    CreateAd,
    /// `GET /ad?...`
    QueryAd,
}

impl RequestKind {
    pub const ALL: [RequestKind; 2] = [RequestKind::CreateAd, RequestKind::QueryAd];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::CreateAd => "create_ad",
            RequestKind::QueryAd => "query_ad",
        }
    }
}

/// Transport level failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Connect,
    Other,
}

/// Result of a single request attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The server answered with this status
    Status(u16),
    /// No usable response
    Transport(TransportError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Status(code) if (200..300).contains(code))
    }

    /// Label used for the `result` metric dimension
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Status(_) if self.is_success() => "ok",
            Outcome::Status(_) => "http_error",
            Outcome::Transport(_) => "transport_error",
        }
    }
}

/// Destination for request outcomes
pub trait MetricsSink: Send + Sync {
    fn record(&self, kind: RequestKind, outcome: &Outcome, latency: Duration);
}

/// Highest latency tracked exactly; slower requests are clamped to it
const MAX_TRACKED_LATENCY_US: u64 = 60 * 60 * 1_000_000;

/// Latency distribution for one request kind, in microseconds
#[derive(Debug, Clone)]
pub struct LatencyStats {
    histogram: Option<Histogram<u64>>,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyStats {
    pub fn new() -> Self {
        // 3 significant digits between 1us and one hour
        Self {
            histogram: Histogram::new_with_bounds(1, MAX_TRACKED_LATENCY_US, 3).ok(),
        }
    }

    pub fn record(&mut self, latency: Duration) {
        if let Some(histogram) = self.histogram.as_mut() {
            let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
            histogram.saturating_record(micros.max(1));
        }
    }

    pub fn len(&self) -> u64 {
        self.histogram.as_ref().map_or(0, Histogram::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calculate percentile (0-100)
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        self.non_empty()
            .map(|h| Duration::from_micros(h.value_at_quantile(p / 100.0)))
    }

    pub fn max(&self) -> Option<Duration> {
        self.non_empty().map(|h| Duration::from_micros(h.max()))
    }

    fn non_empty(&self) -> Option<&Histogram<u64>> {
        self.histogram.as_ref().filter(|h| !h.is_empty())
    }
}

#[derive(Debug, Default)]
struct KindCounters {
    total: AtomicU64,
    ok: AtomicU64,
    http_errors: AtomicU64,
    transport_errors: AtomicU64,
    latencies: Mutex<LatencyStats>,
}

impl KindCounters {
    fn record(&self, outcome: &Outcome, latency: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::Status(_) if outcome.is_success() => {
                self.ok.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Status(_) => {
                self.http_errors.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Transport(_) => {
                self.transport_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(latency);
    }

    fn snapshot(&self, kind: RequestKind) -> KindSummary {
        let latencies = self
            .latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        KindSummary {
            kind,
            total: self.total.load(Ordering::Relaxed),
            ok: self.ok.load(Ordering::Relaxed),
            http_errors: self.http_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            p50: latencies.percentile(50.0),
            p95: latencies.percentile(95.0),
            p99: latencies.percentile(99.0),
            max: latencies.max(),
        }
    }
}

/// In-process sink shared by every worker of a run
#[derive(Debug, Default)]
pub struct RunMetrics {
    create_ad: KindCounters,
    query_ad: KindCounters,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, kind: RequestKind) -> &KindCounters {
        match kind {
            RequestKind::CreateAd => &self.create_ad,
            RequestKind::QueryAd => &self.query_ad,
        }
    }

    /// Point-in-time view of one request kind
    pub fn snapshot(&self, kind: RequestKind) -> KindSummary {
        self.counters(kind).snapshot(kind)
    }

    /// Summary over every kind that saw traffic
    pub fn summary(&self, elapsed: Duration) -> Summary {
        let kinds = RequestKind::ALL
            .iter()
            .map(|kind| self.snapshot(*kind))
            .filter(|s| s.total > 0)
            .collect();
        Summary { elapsed, kinds }
    }
}

impl MetricsSink for RunMetrics {
    fn record(&self, kind: RequestKind, outcome: &Outcome, latency: Duration) {
        self.counters(kind).record(outcome, latency);

        counter!("adload_requests_total", "kind" => kind.as_str(), "result" => outcome.label())
            .increment(1);
        histogram!("adload_request_duration_seconds", "kind" => kind.as_str())
            .record(latency.as_secs_f64());
    }
}

/// Totals and latency percentiles for one request kind
#[derive(Debug, Clone, PartialEq)]
pub struct KindSummary {
    pub kind: RequestKind,
    pub total: u64,
    pub ok: u64,
    pub http_errors: u64,
    pub transport_errors: u64,
    pub p50: Option<Duration>,
    pub p95: Option<Duration>,
    pub p99: Option<Duration>,
    pub max: Option<Duration>,
}

impl KindSummary {
    pub fn failures(&self) -> u64 {
        self.http_errors + self.transport_errors
    }

    /// Error rate as a fraction (0.0 to 1.0)
    pub fn error_rate(&self) -> f64 {
        if self.total > 0 {
            self.failures() as f64 / self.total as f64
        } else {
            0.0
        }
    }
}

/// End-of-run report
#[derive(Debug, Clone)]
pub struct Summary {
    pub elapsed: Duration,
    pub kinds: Vec<KindSummary>,
}

impl Summary {
    pub fn total_requests(&self) -> u64 {
        self.kinds.iter().map(|k| k.total).sum()
    }

    /// Requests per second over the whole run
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_requests() as f64 / secs
        } else {
            0.0
        }
    }
}

fn fmt_ms(latency: Option<Duration>) -> String {
    latency
        .map(|d| format!("{:.1}ms", d.as_secs_f64() * 1000.0))
        .unwrap_or_else(|| "-".to_string())
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== adload summary ===")?;
        writeln!(
            f,
            "duration: {:.1}s  requests: {}  throughput: {:.1} req/s",
            self.elapsed.as_secs_f64(),
            self.total_requests(),
            self.throughput()
        )?;
        for k in &self.kinds {
            writeln!(
                f,
                "{:<10} total={} ok={} http_err={} transport_err={} err_rate={:.2}% p50={} p95={} p99={} max={}",
                k.kind.as_str(),
                k.total,
                k.ok,
                k.http_errors,
                k.transport_errors,
                k.error_rate() * 100.0,
                fmt_ms(k.p50),
                fmt_ms(k.p95),
                fmt_ms(k.p99),
                fmt_ms(k.max),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_classification() {
        assert!(Outcome::Status(200).is_success());
        assert!(Outcome::Status(204).is_success());
        assert!(!Outcome::Status(404).is_success());
        assert!(!Outcome::Status(500).is_success());
        assert!(!Outcome::Transport(TransportError::Timeout).is_success());

        assert_eq!(Outcome::Status(201).label(), "ok");
        assert_eq!(Outcome::Status(503).label(), "http_error");
        assert_eq!(
            Outcome::Transport(TransportError::Connect).label(),
            "transport_error"
        );
    }

    fn assert_close(actual: Option<Duration>, expected_ms: u64) {
        let actual = actual.expect("histogram has samples").as_secs_f64() * 1000.0;
        let expected = expected_ms as f64;
        // 3 significant digits
        assert!(
            (actual - expected).abs() <= expected * 0.001 + 0.001,
            "{actual}ms vs {expected}ms"
        );
    }

    #[test]
    fn test_percentiles() {
        let mut stats = LatencyStats::new();
        assert!(stats.percentile(99.0).is_none());
        assert!(stats.max().is_none());

        for ms in 1..=100 {
            stats.record(Duration::from_millis(ms));
        }
        assert_eq!(stats.len(), 100);
        assert_close(stats.percentile(50.0), 50);
        assert_close(stats.percentile(99.0), 99);
        assert_close(stats.max(), 100);
    }

    #[test]
    fn test_latency_memory_is_bounded() {
        let mut stats = LatencyStats::new();
        let before = stats.clone();

        for i in 0..200_000u64 {
            stats.record(Duration::from_micros(500 + i % 1_000));
        }
        // Out of range samples are clamped rather than dropped
        stats.record(Duration::from_secs(10 * 60 * 60));
        stats.record(Duration::ZERO);

        assert_eq!(stats.len(), 200_002);
        assert!(before.is_empty());
        assert_close(stats.max(), 60 * 60 * 1000);
    }

    #[test]
    fn test_run_metrics_counts_each_record_once() {
        let metrics = RunMetrics::new();
        let latency = Duration::from_millis(5);

        metrics.record(RequestKind::CreateAd, &Outcome::Status(200), latency);
        metrics.record(RequestKind::CreateAd, &Outcome::Status(500), latency);
        metrics.record(
            RequestKind::CreateAd,
            &Outcome::Transport(TransportError::Connect),
            latency,
        );
        metrics.record(RequestKind::QueryAd, &Outcome::Status(200), latency);

        let create = metrics.snapshot(RequestKind::CreateAd);
        assert_eq!(create.total, 3);
        assert_eq!(create.ok, 1);
        assert_eq!(create.http_errors, 1);
        assert_eq!(create.transport_errors, 1);
        assert_eq!(create.failures(), 2);

        let query = metrics.snapshot(RequestKind::QueryAd);
        assert_eq!(query.total, 1);
        assert_eq!(query.error_rate(), 0.0);
    }

    #[test]
    fn test_summary_skips_idle_kinds() {
        let metrics = RunMetrics::new();
        metrics.record(
            RequestKind::QueryAd,
            &Outcome::Status(200),
            Duration::from_millis(3),
        );

        let summary = metrics.summary(Duration::from_secs(2));
        assert_eq!(summary.kinds.len(), 1);
        assert_eq!(summary.kinds[0].kind, RequestKind::QueryAd);
        assert_eq!(summary.total_requests(), 1);
        assert!((summary.throughput() - 0.5).abs() < f64::EPSILON);

        let rendered = summary.to_string();
        assert!(rendered.contains("query_ad"));
        assert!(!rendered.contains("create_ad"));
    }
}
