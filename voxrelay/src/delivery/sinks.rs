use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use super::event::TerminalEvent;
use crate::utils::http_client::install_rustls_provider;
use crate::{Error, Result};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Destination for terminal events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Stable name; the delivery ledger is keyed on it.
    fn name(&self) -> &str;

    async fn deliver(&self, event: &TerminalEvent) -> Result<()>;
}

/// POSTs the event as JSON with an `Idempotency-Key` of the job id.
///
/// A sink built with [`WebhookSink::new`] always posts to one URL. One built
/// with [`WebhookSink::per_job`] posts to each event's own `webhook_url` and
/// treats events without one as delivered.
pub struct WebhookSink {
    name: String,
    url: Option<String>,
    client: Client,
    headers: Vec<(String, String)>,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Self::build("webhook", Some(url.into()), timeout)
    }

    pub fn per_job(timeout: Duration) -> Result<Self> {
        Self::build("job-webhook", None, timeout)
    }

    fn build(name: &str, url: Option<String>, timeout: Duration) -> Result<Self> {
        install_rustls_provider();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("cannot build webhook client: {}", e)))?;
        Ok(Self {
            name: name.to_string(),
            url,
            client,
            headers: Vec::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Fixed target, `None` for a per-job sink.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    fn target<'a>(&'a self, event: &'a TerminalEvent) -> Option<&'a str> {
        match &self.url {
            Some(url) => Some(url.as_str()),
            None => event.webhook_url.as_deref(),
        }
    }

    fn build_headers(&self, event: &TerminalEvent) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                value.parse::<HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(event.idempotency_key()) {
            headers.insert(HeaderName::from_static("idempotency-key"), value);
        }
        headers
    }
}

#[async_trait]
impl EventSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &TerminalEvent) -> Result<()> {
        let Some(url) = self.target(event) else {
            return Ok(());
        };
        let response = self
            .client
            .post(url)
            .headers(self.build_headers(event))
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(job_id = %event.job_id, %status, url, "Webhook delivered");
            Ok(())
        } else {
            Err(Error::transport(format!(
                "webhook {} returned {}",
                url, status
            )))
        }
    }
}

/// Publishes events in-process, e.g. to transport subscribers.
#[derive(Clone)]
pub struct PublishSink {
    tx: broadcast::Sender<TerminalEvent>,
}

impl PublishSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<TerminalEvent> {
        self.tx.clone()
    }
}

#[async_trait]
impl EventSink for PublishSink {
    fn name(&self) -> &str {
        "publish"
    }

    async fn deliver(&self, event: &TerminalEvent) -> Result<()> {
        // No subscribers is not a failure.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}
