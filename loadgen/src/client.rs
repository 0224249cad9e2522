//! HTTP client for the ad server
//!
//! One `AdClient` is built per process and cloned into every scenario; the
//! underlying `reqwest::Client` shares a single connection pool.

use crate::config::{ConfigError, parse_target_url};
use crate::request::{AdQuery, NewAd};
use crate::sink::{Outcome, TransportError};
use reqwest::{Client, Response, Url};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AdClient {
    http: Client,
    ad_url: Url,
}

impl AdClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        pool_max_idle_per_host: usize,
    ) -> Result<Self, ConfigError> {
        let http = Client::builder()
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .timeout(timeout)
            .build()?;
        Self::with_client(http, base_url)
    }

    /// Wrap an existing client, e.g. one tuned by the caller
    pub fn with_client(http: Client, base_url: &str) -> Result<Self, ConfigError> {
        let base = parse_target_url(base_url)?;
        let ad_url = parse_target_url(&format!("{}/ad", base.as_str().trim_end_matches('/')))?;
        Ok(Self { http, ad_url })
    }

    /// URL of the ad resource
    pub fn ad_url(&self) -> &Url {
        &self.ad_url
    }

    /// `POST /ad` with a JSON body
    pub async fn create_ad(&self, ad: &NewAd) -> Outcome {
        let result = self.http.post(self.ad_url.clone()).json(ad).send().await;
        finish(result).await
    }

    /// `GET /ad?limit=&offset=&age=&gender=&country=&platform=`
    pub async fn query_ads(&self, query: &AdQuery) -> Outcome {
        let result = self.http.get(self.ad_url.clone()).query(query).send().await;
        finish(result).await
    }
}

/// Drain the body so the connection returns to the pool, keep only the status
async fn finish(result: Result<Response, reqwest::Error>) -> Outcome {
    match result {
        Ok(resp) => {
            let status = resp.status().as_u16();
            match resp.bytes().await {
                Ok(_) => Outcome::Status(status),
                Err(e) => {
                    debug!("Failed to read response body: {}", e);
                    Outcome::Transport(classify(&e))
                }
            }
        }
        Err(e) => {
            debug!("Request failed: {}", e);
            Outcome::Transport(classify(&e))
        }
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect
    } else {
        TransportError::Other
    }
}
