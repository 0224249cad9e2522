//! Common Test Utilities for Integration Tests
//!
//! An in-process mock of the ad server that records every request it sees.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::post,
};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// Everything the mock server received
#[derive(Debug, Default)]
pub struct Recorded {
    pub created: Vec<Value>,
    pub queries: Vec<HashMap<String, String>>,
}

#[derive(Clone)]
pub struct MockState {
    recorded: Arc<Mutex<Recorded>>,
    status: StatusCode,
    delay: Duration,
}

/// Handle on a running mock ad server
pub struct MockAdServer {
    pub addr: SocketAddr,
    state: MockState,
}

impl MockAdServer {
    /// Answers every request with 200
    pub async fn start() -> Self {
        Self::start_with(StatusCode::OK, Duration::ZERO).await
    }

    /// Answers every request with `status` after `delay`
    pub async fn start_with(status: StatusCode, delay: Duration) -> Self {
        let state = MockState {
            recorded: Arc::new(Mutex::new(Recorded::default())),
            status,
            delay,
        };

        let app = Router::new()
            .route("/ad", post(create_ad).get(query_ads))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn created(&self) -> Vec<Value> {
        self.state.recorded.lock().unwrap().created.clone()
    }

    pub fn queries(&self) -> Vec<HashMap<String, String>> {
        self.state.recorded.lock().unwrap().queries.clone()
    }

    /// Requests of either kind received so far
    pub fn request_count(&self) -> usize {
        let recorded = self.state.recorded.lock().unwrap();
        recorded.created.len() + recorded.queries.len()
    }
}

async fn create_ad(State(state): State<MockState>, Json(body): Json<Value>) -> StatusCode {
    state.recorded.lock().unwrap().created.push(body);
    tokio::time::sleep(state.delay).await;
    state.status
}

async fn query_ads(
    State(state): State<MockState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    state.recorded.lock().unwrap().queries.push(params);
    tokio::time::sleep(state.delay).await;
    (state.status, Json(serde_json::json!({ "items": [] })))
}

/// An address nothing listens on
#[allow(dead_code)]
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

/// Initialize test logging for detailed output
#[allow(dead_code)]
pub fn init_test_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adload=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
