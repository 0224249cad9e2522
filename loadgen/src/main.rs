use adload::config::parse_stage;
use adload::ramp::{Progress, RunHandle, Stopper};
use adload::{
    AdClient, Config, ConfigError, CreateAdScenario, QueryAdScenario, RampController, RequestKind, RunMetrics,
    Scenario, ScenarioConfig, Stage,
};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures_util::future::join_all;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Ramping load generator for the ad-serving HTTP API
#[derive(Parser)]
#[command(name = "adload")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the ad server
    #[arg(long, global = true)]
    target: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// How often the worker count is re-evaluated, in milliseconds
    #[arg(long, global = true)]
    tick_ms: Option<u64>,

    /// Serve Prometheus metrics on this address
    #[arg(long, global = true)]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write-heavy traffic against POST /ad
    CreateAd(ScenarioArgs),
    /// Read-heavy traffic against GET /ad
    QueryAd(ScenarioArgs),
    /// Both scenarios side by side, shaped by the environment
    All,
}

#[derive(Args)]
struct ScenarioArgs {
    /// Workers running when the first stage begins
    #[arg(long)]
    start_workers: Option<usize>,

    /// Ramp stage as <target>:<duration>, e.g. 200:10s (repeatable)
    #[arg(long = "stage", value_parser = parse_stage)]
    stages: Vec<Stage>,

    /// Requests per iteration
    #[arg(long)]
    repeat: Option<u32>,

    /// Pause between iterations, in milliseconds
    #[arg(long)]
    sleep_ms: Option<u64>,
}

impl ScenarioArgs {
    fn apply(self, shape: &mut ScenarioConfig) {
        if let Some(n) = self.start_workers {
            shape.start_workers = n;
        }
        if !self.stages.is_empty() {
            shape.stages = self.stages;
        }
        if let Some(n) = self.repeat {
            shape.repeat = n;
        }
        if let Some(ms) = self.sleep_ms {
            shape.sleep = Duration::from_millis(ms);
        }
    }
}

impl Cli {
    /// Fold flags into the environment configuration, returning the
    /// scenarios to run
    fn apply(self, config: &mut Config) -> Vec<RequestKind> {
        if let Some(target) = self.target {
            config.target_url = target;
        }
        if let Some(secs) = self.timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.tick_ms {
            config.tick_interval = Duration::from_millis(ms);
        }
        if self.metrics_addr.is_some() {
            config.metrics_addr = self.metrics_addr;
        }

        match self.command {
            Commands::CreateAd(args) => {
                args.apply(&mut config.create_ad);
                vec![RequestKind::CreateAd]
            }
            Commands::QueryAd(args) => {
                args.apply(&mut config.query_ad);
                vec![RequestKind::QueryAd]
            }
            Commands::All => RequestKind::ALL.to_vec(),
        }
    }
}

fn build_scenario(
    kind: RequestKind,
    config: &Config,
    client: &AdClient,
) -> Result<(Arc<dyn Scenario>, ScenarioConfig), ConfigError> {
    let scenario: Arc<dyn Scenario> = match kind {
        RequestKind::CreateAd => Arc::new(CreateAdScenario::new(
            client.clone(),
            config.create_ad.repeat,
            config.ad_ttl,
        )?),
        RequestKind::QueryAd => Arc::new(QueryAdScenario::new(
            client.clone(),
            config.query_ad.repeat,
        )),
    };
    let shape = match kind {
        RequestKind::CreateAd => config.create_ad.clone(),
        RequestKind::QueryAd => config.query_ad.clone(),
    };
    Ok((scenario, shape))
}

/// Log the worker pool of every run every few seconds
fn spawn_progress_logger(runs: Vec<(&'static str, watch::Receiver<Progress>)>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        interval.tick().await;
        loop {
            interval.tick().await;
            for (scenario, rx) in &runs {
                let p = *rx.borrow();
                info!(
                    scenario,
                    stage = p.stage_index,
                    active = p.active,
                    draining = p.draining,
                    "Progress"
                );
            }
        }
    });
}

/// The first interrupt calls `stop_all`; resolves to true on a second one
async fn watch_interrupts<I, Fut>(mut interrupt: I, stop_all: impl Fn()) -> bool
where
    I: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if let Err(e) = interrupt().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        return false;
    }
    warn!("Interrupted, waiting for in-flight iterations to finish (Ctrl-C again to exit)");
    stop_all();

    interrupt().await.is_ok()
}

/// Stop every run on Ctrl-C; in-flight iterations still complete unless a
/// second Ctrl-C arrives
fn spawn_interrupt_handler(stoppers: Vec<Stopper>) {
    tokio::spawn(async move {
        let stop_all = || stoppers.iter().for_each(Stopper::stop);
        if watch_interrupts(tokio::signal::ctrl_c, stop_all).await {
            warn!("Interrupted again, exiting without draining");
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Environment first, then command line flags
    let mut config = Config::from_env().context("Invalid configuration in environment")?;
    let selected = cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    info!(
        "Target {} with {} scenario(s)",
        config.target_url,
        selected.len()
    );

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics on http://{}/metrics", addr);
    }

    let client = AdClient::new(
        &config.target_url,
        config.request_timeout,
        config.pool_max_idle_per_host,
    )?;
    let sink = Arc::new(RunMetrics::new());

    let started = Instant::now();
    let mut handles: Vec<RunHandle> = Vec::new();
    for kind in selected {
        let (scenario, shape) = build_scenario(kind, &config, &client)?;
        info!(
            scenario = scenario.name(),
            start_workers = shape.start_workers,
            stages = ?shape.stages,
            repeat = shape.repeat,
            sleep = ?shape.sleep,
            "Starting scenario"
        );
        let controller =
            RampController::new(scenario, sink.clone(), shape.sleep).with_tick(config.tick_interval);
        handles.push(controller.start(shape.stages, shape.start_workers)?);
    }

    spawn_interrupt_handler(handles.iter().map(RunHandle::stopper).collect());
    spawn_progress_logger(
        handles
            .iter()
            .map(|h| (h.scenario(), h.watch_progress()))
            .collect(),
    );

    for result in join_all(handles.into_iter().map(RunHandle::wait)).await {
        let report = result.context("Scenario run failed")?;
        info!(
            scenario = report.scenario,
            stage_ends = ?report.stage_ends,
            peak_active = report.peak_active,
            iterations = report.iterations,
            interrupted = report.interrupted,
            "Scenario finished"
        );
    }

    println!("{}", sink.summary(started.elapsed()));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    type Interrupt = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

    /// Interrupt source fired by `notify_one`
    fn signal(notify: &Arc<Notify>) -> impl FnMut() -> Interrupt + Send + 'static {
        let notify = notify.clone();
        move || {
            let notify = notify.clone();
            Box::pin(async move {
                notify.notified().await;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_second_interrupt_requests_exit() {
        let notify = Arc::new(Notify::new());
        let stops = Arc::new(AtomicUsize::new(0));

        let watcher = {
            let interrupt = signal(&notify);
            let stops = stops.clone();
            tokio::spawn(async move {
                watch_interrupts(interrupt, move || {
                    stops.fetch_add(1, Ordering::SeqCst);
                })
                .await
            })
        };

        notify.notify_one();
        while stops.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!watcher.is_finished());

        notify.notify_one();
        assert!(watcher.await.unwrap());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_signal_never_stops() {
        let stops = AtomicUsize::new(0);
        let exit = watch_interrupts(
            || async { Err(io::Error::other("no signal handler")) },
            || {
                stops.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;

        assert!(!exit);
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }
}
