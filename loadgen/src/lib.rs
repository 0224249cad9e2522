//! adload Library
//!
//! Ramping load generator for the ad-serving HTTP API. A [`RampController`]
//! grows and shrinks a pool of virtual workers along a staged schedule; each
//! worker repeatedly runs a [`Scenario`] iteration and reports every request
//! outcome to a [`MetricsSink`].

pub mod client;
pub mod config;
pub mod ramp;
pub mod request;
pub mod scenario;
pub mod sink;
pub mod worker;

mod test_utils;

// Re-export commonly used types
pub use client::AdClient;
pub use config::{Config, ConfigError, ScenarioConfig};
pub use ramp::{RampController, RunHandle, RunReport, Stage};
pub use scenario::{CreateAdScenario, QueryAdScenario, Scenario};
pub use sink::{MetricsSink, Outcome, RequestKind, RunMetrics};
