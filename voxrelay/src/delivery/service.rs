use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

use super::event::TerminalEvent;
use super::ledger::DeliveryLedger;
use super::sinks::EventSink;
use crate::config::DeliveryConfig;
use crate::config::RetryPolicy;
use crate::{Error, Result};

/// An event a sink never accepted within its retry budget.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: u64,
    pub sink: String,
    pub event: TerminalEvent,
    pub attempts: u32,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub delivered: Vec<String>,
    /// Already delivered earlier; not sent again.
    pub skipped: Vec<String>,
    pub dead_lettered: Vec<String>,
}

impl DeliveryOutcome {
    /// Every sink has the event.
    pub fn is_complete(&self) -> bool {
        self.dead_lettered.is_empty()
    }
}

enum SinkOutcome {
    Delivered,
    Skipped,
    DeadLettered,
}

/// Fans terminal events out to sinks with retries, deduplication and a
/// dead-letter list.
pub struct DeliveryService {
    sinks: Vec<Arc<dyn EventSink>>,
    policy: RetryPolicy,
    ledger: DeliveryLedger,
    dead_letters: DashMap<u64, DeadLetter>,
    next_dead_letter_id: AtomicU64,
    dead_letter_capacity: usize,
}

impl DeliveryService {
    pub fn new(config: &DeliveryConfig, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            sinks,
            policy: config.retry.clone(),
            ledger: DeliveryLedger::new(),
            dead_letters: DashMap::new(),
            next_dead_letter_id: AtomicU64::new(1),
            dead_letter_capacity: config.dead_letter_capacity.max(1),
        }
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn ledger(&self) -> &DeliveryLedger {
        &self.ledger
    }

    /// Deliver to every sink concurrently. Sinks that already have the event
    /// are skipped.
    pub async fn deliver(&self, event: &TerminalEvent) -> DeliveryOutcome {
        let results = futures::future::join_all(
            self.sinks
                .iter()
                .map(|sink| async move { (sink.name().to_string(), self.deliver_to(sink.as_ref(), event).await) }),
        )
        .await;

        let mut outcome = DeliveryOutcome::default();
        for (name, result) in results {
            match result {
                SinkOutcome::Delivered => outcome.delivered.push(name),
                SinkOutcome::Skipped => outcome.skipped.push(name),
                SinkOutcome::DeadLettered => outcome.dead_lettered.push(name),
            }
        }
        outcome
    }

    async fn deliver_to(&self, sink: &dyn EventSink, event: &TerminalEvent) -> SinkOutcome {
        let name = sink.name();
        let Some(claim) = self.ledger.claim(&event.job_id, name) else {
            debug!(job_id = %event.job_id, sink = name, "Already delivered, skipping");
            return SinkOutcome::Skipped;
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match sink.deliver(event).await {
                Ok(()) => {
                    claim.delivered();
                    debug!(job_id = %event.job_id, sink = name, attempt, "Terminal event delivered");
                    return SinkOutcome::Delivered;
                }
                Err(e) if self.policy.allows_retry(attempt) => {
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        job_id = %event.job_id,
                        sink = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(job_id = %event.job_id, sink = name, attempts = attempt, error = %e, "Delivery exhausted retries, dead-lettering");
                    drop(claim);
                    self.push_dead_letter(name, event, attempt, e.to_string());
                    return SinkOutcome::DeadLettered;
                }
            }
        }
    }

    fn push_dead_letter(&self, sink: &str, event: &TerminalEvent, attempts: u32, last_error: String) {
        if self.dead_letters.len() >= self.dead_letter_capacity
            && let Some(oldest) = self.dead_letters.iter().map(|e| *e.key()).min()
        {
            self.dead_letters.remove(&oldest);
            warn!(dead_letter_id = oldest, "Dead-letter list full, dropped oldest entry");
        }

        let id = self.next_dead_letter_id.fetch_add(1, Ordering::Relaxed);
        self.dead_letters.insert(
            id,
            DeadLetter {
                id,
                sink: sink.to_string(),
                event: event.clone(),
                attempts,
                last_error,
                created_at: Utc::now(),
            },
        );
    }

    /// Dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        let mut letters: Vec<DeadLetter> = self.dead_letters.iter().map(|e| e.value().clone()).collect();
        letters.sort_by_key(|letter| letter.id);
        letters
    }

    /// Try a dead-lettered delivery again. Returns whether it went through;
    /// a failed retry is dead-lettered anew.
    pub async fn retry_dead_letter(&self, id: u64) -> Result<bool> {
        let (_, letter) = self
            .dead_letters
            .remove(&id)
            .ok_or_else(|| Error::not_found("dead letter", id.to_string()))?;

        let sink = self
            .sinks
            .iter()
            .find(|sink| sink.name() == letter.sink)
            .ok_or_else(|| Error::not_found("sink", letter.sink.clone()))?;

        let delivered = matches!(
            self.deliver_to(sink.as_ref(), &letter.event).await,
            SinkOutcome::Delivered | SinkOutcome::Skipped
        );
        if delivered {
            info!(dead_letter_id = id, job_id = %letter.event.job_id, "Dead letter redelivered");
        }
        Ok(delivered)
    }

    /// Forget ledger entries delivered before `cutoff`.
    pub fn prune_ledger(&self, cutoff: DateTime<Utc>) -> usize {
        self.ledger.prune_before(cutoff)
    }
}
