#![allow(dead_code)]

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;

use voxrelay::App;
use voxrelay::config::{AppConfig, RetryPolicy};
use voxrelay::delivery::IDEMPOTENCY_HEADER;
use voxrelay::domain::{JobPayload, JobRequest};
use voxrelay::model::ScriptedModelFactory;

/// Config for tests: ephemeral port, small batches, fast retries, no
/// autoscaling.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.transport.port = 0;
    config.transport.request_timeout_ms = 5_000;
    config.orchestrator.sync_timeout_ms = 4_000;
    config.batch.max_batch_size = 4;
    config.batch.max_wait_ms = 5;
    config.pool.min_workers = 1;
    config.pool.max_workers = 2;
    config.pool.batch_timeout_ms = 5_000;
    config.scaling.enabled = false;
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 10,
        max_delay_ms: 50,
    };
    config.delivery.retry = RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 10,
        max_delay_ms: 50,
    };
    config
}

pub async fn start_app(config: AppConfig, factory: ScriptedModelFactory) -> App {
    let app = App::build(config, Arc::new(factory)).await.unwrap();
    app.start().await.unwrap();
    app
}

pub fn translation(text: &str) -> JobRequest {
    JobRequest::new(JobPayload::Translation {
        text: text.to_string(),
        source_language: Some("en".to_string()),
        target_languages: vec!["fr".to_string()],
    })
}

/// One webhook POST as seen by the receiver.
#[derive(Debug, Clone)]
pub struct WebhookHit {
    pub idempotency_key: Option<String>,
    pub body: Value,
}

type Hits = Arc<Mutex<Vec<WebhookHit>>>;

/// Local HTTP endpoint that records webhook POSTs and answers 200.
pub struct WebhookReceiver {
    pub url: String,
    hits: Hits,
}

impl WebhookReceiver {
    pub async fn start() -> Self {
        let hits: Hits = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/hooks/jobs", post(record_hit))
            .with_state(hits.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hooks/jobs", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { url, hits }
    }

    pub fn hits(&self) -> Vec<WebhookHit> {
        self.hits.lock().clone()
    }
}

async fn record_hit(
    State(hits): State<Hits>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    hits.lock().push(WebhookHit {
        idempotency_key,
        body,
    });
    StatusCode::OK
}
