use relay_envelope::ErrorCode;
use serde::Serialize;
use std::fmt;

use crate::domain::PoolKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    ScaleDown,
    Timeout,
    Crashed,
    Shutdown,
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetireReason::ScaleDown => write!(f, "scale_down"),
            RetireReason::Timeout => write!(f, "timeout"),
            RetireReason::Crashed => write!(f, "crashed"),
            RetireReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Lifecycle events broadcast by the pool manager.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    WorkerSpawned {
        pool: PoolKey,
        worker_id: u64,
    },
    WorkerRetired {
        pool: PoolKey,
        worker_id: u64,
        reason: RetireReason,
    },
    ScaledUp {
        pool: PoolKey,
        target: usize,
    },
    ScaledDown {
        pool: PoolKey,
        target: usize,
    },
    BatchCompleted {
        pool: PoolKey,
        batch_id: String,
        size: usize,
        latency_ms: u64,
    },
    BatchFailed {
        pool: PoolKey,
        batch_id: String,
        size: usize,
        code: ErrorCode,
    },
}

impl PoolEvent {
    pub fn pool(&self) -> &PoolKey {
        match self {
            PoolEvent::WorkerSpawned { pool, .. }
            | PoolEvent::WorkerRetired { pool, .. }
            | PoolEvent::ScaledUp { pool, .. }
            | PoolEvent::ScaledDown { pool, .. }
            | PoolEvent::BatchCompleted { pool, .. }
            | PoolEvent::BatchFailed { pool, .. } => pool,
        }
    }
}
