use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::domain::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LedgerState {
    InFlight,
    Delivered(DateTime<Utc>),
}

/// Remembers which (job, sink) pairs were delivered so each sink sees a job
/// at most once, even when delivery is requested again.
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    entries: DashMap<(JobId, String), LedgerState>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the pair for delivery. False if delivered or being delivered.
    pub fn try_claim(&self, job_id: &JobId, sink: &str) -> bool {
        match self.entries.entry((job_id.clone(), sink.to_string())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(LedgerState::InFlight);
                true
            }
        }
    }

    /// Claim the pair and get a guard that releases it on drop unless
    /// [`LedgerClaim::delivered`] was called.
    pub fn claim(&self, job_id: &JobId, sink: &str) -> Option<LedgerClaim<'_>> {
        self.try_claim(job_id, sink).then(|| LedgerClaim {
            ledger: self,
            job_id: job_id.clone(),
            sink: sink.to_string(),
        })
    }

    pub fn mark_delivered(&self, job_id: &JobId, sink: &str) {
        self.entries.insert(
            (job_id.clone(), sink.to_string()),
            LedgerState::Delivered(Utc::now()),
        );
    }

    /// Give up a claim after a failed delivery so it can be retried later.
    pub fn release(&self, job_id: &JobId, sink: &str) {
        self.entries
            .remove_if(&(job_id.clone(), sink.to_string()), |_, state| {
                *state == LedgerState::InFlight
            });
    }

    pub fn delivered_at(&self, job_id: &JobId, sink: &str) -> Option<DateTime<Utc>> {
        match self.entries.get(&(job_id.clone(), sink.to_string())).map(|e| *e) {
            Some(LedgerState::Delivered(at)) => Some(at),
            _ => None,
        }
    }

    pub fn is_delivered(&self, job_id: &JobId, sink: &str) -> bool {
        self.delivered_at(job_id, sink).is_some()
    }

    /// Drop delivered entries older than `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, state| match state {
            LedgerState::Delivered(at) => *at >= cutoff,
            LedgerState::InFlight => true,
        });
        before - self.entries.len()
    }
}

/// An in-flight claim. Dropping it without calling `delivered` gives the
/// pair back, so a cancelled delivery can be attempted again.
pub struct LedgerClaim<'a> {
    ledger: &'a DeliveryLedger,
    job_id: JobId,
    sink: String,
}

impl LedgerClaim<'_> {
    pub fn delivered(self) {
        self.ledger.mark_delivered(&self.job_id, &self.sink);
    }
}

impl Drop for LedgerClaim<'_> {
    fn drop(&mut self) {
        // No-op once delivered: release only removes in-flight entries.
        self.ledger.release(&self.job_id, &self.sink);
    }
}
