//! Load generator configuration
//!
//! Configuration is loaded from environment variables, then overridden by
//! command line flags in `main`. Invalid values are fatal: they are reported
//! before any worker is spawned.

use crate::ramp::Stage;
use chrono::{TimeDelta, Utc};
use reqwest::Url;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Stage schedule is empty")]
    EmptySchedule,

    #[error("Invalid stage {input:?}: {reason}")]
    InvalidStage { input: String, reason: String },

    #[error("Invalid duration {input:?}: {source}")]
    InvalidDuration {
        input: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("Invalid target URL {input:?}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("Repeat count for {0} must be at least 1")]
    ZeroRepeat(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Main load generator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the ad server
    pub target_url: String,
    /// Upper bound on a single request, including the body
    pub request_timeout: Duration,
    /// Idle connections kept per host in the shared pool
    pub pool_max_idle_per_host: usize,
    /// How often the ramp controller re-evaluates the worker count
    pub tick_interval: Duration,
    /// Prometheus scrape listener (disabled when unset)
    pub metrics_addr: Option<SocketAddr>,
    /// How far in the future generated ads expire
    pub ad_ttl: Duration,

    /// Write-heavy scenario
    pub create_ad: ScenarioConfig,
    /// Read-heavy scenario
    pub query_ad: ScenarioConfig,
}

/// Per-scenario traffic shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioConfig {
    /// Workers running when the first stage begins
    pub start_workers: usize,
    /// Ramp schedule
    pub stages: Vec<Stage>,
    /// Requests issued per iteration
    pub repeat: u32,
    /// Pause between iterations
    pub sleep: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_url: "http://ad-server.local".to_string(),
            request_timeout: Duration::from_secs(30),
            pool_max_idle_per_host: 256,
            tick_interval: Duration::from_millis(100),
            metrics_addr: None,
            ad_ttl: Duration::from_secs(30 * SECS_PER_DAY),
            create_ad: ScenarioConfig::create_ad(),
            query_ad: ScenarioConfig::query_ad(),
        }
    }
}

impl ScenarioConfig {
    /// 100 workers ramping to 200 over 10s, 25 POSTs per iteration
    pub fn create_ad() -> Self {
        Self {
            start_workers: 100,
            stages: vec![Stage::new(200, Duration::from_secs(10))],
            repeat: 25,
            sleep: Duration::from_secs(1),
        }
    }

    /// 150 workers held for 30s, 10 GETs per iteration
    pub fn query_ad() -> Self {
        Self {
            start_workers: 150,
            stages: vec![Stage::new(150, Duration::from_secs(30))],
            repeat: 10,
            sleep: Duration::from_secs(1),
        }
    }

    fn apply_env<F>(&mut self, prefix: &str, lookup: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = |suffix: &str| format!("{prefix}_{suffix}");

        if let Some(v) = parse_var(lookup, &key("START_WORKERS"))? {
            self.start_workers = v;
        }
        if let Some(raw) = non_empty(lookup, &key("STAGES")) {
            self.stages = parse_stages(&raw)?;
        }
        if let Some(v) = parse_var(lookup, &key("REPEAT"))? {
            self.repeat = v;
        }
        if let Some(ms) = parse_var::<u64, _>(lookup, &key("SLEEP_MS"))? {
            self.sleep = Duration::from_millis(ms);
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = non_empty(&lookup, "ADLOAD_TARGET_URL") {
            config.target_url = url;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "ADLOAD_REQUEST_TIMEOUT_SECS")? {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = parse_var(&lookup, "ADLOAD_POOL_MAX_IDLE")? {
            config.pool_max_idle_per_host = v;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "ADLOAD_TICK_MS")? {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(addr) = parse_var(&lookup, "ADLOAD_METRICS_ADDR")? {
            config.metrics_addr = Some(addr);
        }
        if let Some(days) = parse_var::<u64, _>(&lookup, "CREATE_AD_TTL_DAYS")? {
            let secs = days
                .checked_mul(SECS_PER_DAY)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "CREATE_AD_TTL_DAYS".to_string(),
                    value: days.to_string(),
                })?;
            config.ad_ttl = Duration::from_secs(secs);
        }

        config.create_ad.apply_env("CREATE_AD", &lookup)?;
        config.query_ad.apply_env("QUERY_AD", &lookup)?;

        Ok(config)
    }

    /// Check everything a run depends on before any worker is spawned
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_target_url(&self.target_url)?;
        ad_ttl_delta(self.ad_ttl)?;

        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "tick_interval".to_string(),
                value: "0ms".to_string(),
            });
        }

        for (name, scenario) in [("create-ad", &self.create_ad), ("query-ad", &self.query_ad)] {
            if scenario.stages.is_empty() {
                return Err(ConfigError::EmptySchedule);
            }
            if scenario.repeat == 0 {
                return Err(ConfigError::ZeroRepeat(name));
            }
        }

        Ok(())
    }
}

/// Parse and normalize the target base URL
pub fn parse_target_url(input: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(input).map_err(|e| ConfigError::InvalidUrl {
        input: input.to_string(),
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            input: input.to_string(),
            reason: format!("unsupported scheme {:?}", url.scheme()),
        });
    }

    Ok(url)
}

/// Convert the ad TTL into a calendar offset, rejecting values that would
/// push `end_at` past the representable date range
pub fn ad_ttl_delta(ttl: Duration) -> Result<TimeDelta, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        key: "ad_ttl".to_string(),
        value: format!("{}s", ttl.as_secs()),
    };
    let delta = TimeDelta::from_std(ttl).map_err(|_| invalid())?;
    Utc::now()
        .naive_utc()
        .checked_add_signed(delta)
        .ok_or_else(invalid)?;
    Ok(delta)
}

/// Parse a humantime duration such as `10s`, `1m30s` or `500ms`
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(input.trim()).map_err(|source| ConfigError::InvalidDuration {
        input: input.to_string(),
        source,
    })
}

/// Parse a single `target:duration` stage
pub fn parse_stage(input: &str) -> Result<Stage, ConfigError> {
    let Some((target, duration)) = input.trim().split_once(':') else {
        return Err(ConfigError::InvalidStage {
            input: input.to_string(),
            reason: "expected <target>:<duration>".to_string(),
        });
    };

    let target = target
        .trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::InvalidStage {
            input: input.to_string(),
            reason: format!("bad target: {e}"),
        })?;

    Ok(Stage::new(target, parse_duration(duration)?))
}

/// Parse a comma separated stage list, e.g. `200:10s,200:1m,0:10s`
pub fn parse_stages(input: &str) -> Result<Vec<Stage>, ConfigError> {
    let stages = input
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(parse_stage)
        .collect::<Result<Vec<_>, _>>()?;

    if stages.is_empty() {
        return Err(ConfigError::EmptySchedule);
    }
    Ok(stages)
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        None => Ok(None),
    }
}
