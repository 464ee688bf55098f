use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

use crate::domain::{Stage, Tier};

/// Batches considered for latency and error rate.
const WINDOW: usize = 128;

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub stage: Stage,
    pub tier: Tier,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub size: usize,
    pub target_size: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub workers_retired: u64,
}

/// Rolling record of recent batch outcomes.
#[derive(Debug, Default)]
pub(crate) struct StatsWindow {
    recent: VecDeque<(Duration, bool)>,
    pub completed: u64,
    pub failed: u64,
    pub retired: u64,
}

impl StatsWindow {
    pub fn record(&mut self, latency: Duration, ok: bool) {
        if self.recent.len() == WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back((latency, ok));
        if ok {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .recent
            .iter()
            .map(|(latency, _)| latency.as_secs_f64() * 1_000.0)
            .sum();
        total / self.recent.len() as f64
    }

    pub fn error_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failed = self.recent.iter().filter(|(_, ok)| !ok).count();
        failed as f64 / self.recent.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_averages() {
        let mut window = StatsWindow::default();
        assert_eq!(window.avg_latency_ms(), 0.0);
        assert_eq!(window.error_rate(), 0.0);

        window.record(Duration::from_millis(10), true);
        window.record(Duration::from_millis(30), false);
        assert!((window.avg_latency_ms() - 20.0).abs() < 1e-9);
        assert!((window.error_rate() - 0.5).abs() < 1e-9);
        assert_eq!(window.completed, 1);
        assert_eq!(window.failed, 1);
    }

    #[test]
    fn test_window_evicts_old_samples() {
        let mut window = StatsWindow::default();
        for _ in 0..WINDOW {
            window.record(Duration::from_millis(100), false);
        }
        for _ in 0..WINDOW {
            window.record(Duration::from_millis(1), true);
        }
        assert_eq!(window.error_rate(), 0.0);
        assert!((window.avg_latency_ms() - 1.0).abs() < 1e-9);
        assert_eq!(window.failed, WINDOW as u64);
    }
}
