//! Terminal event delivery: webhook and in-process publish sinks, a
//! per-sink delivery ledger, backoff retries, and dead letters.

pub mod event;
pub mod ledger;
pub mod service;
pub mod sinks;

pub use event::TerminalEvent;
pub use ledger::DeliveryLedger;
pub use service::{DeadLetter, DeliveryOutcome, DeliveryService};
pub use sinks::{EventSink, IDEMPOTENCY_HEADER, PublishSink, WebhookSink};
