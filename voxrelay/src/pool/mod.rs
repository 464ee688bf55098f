//! Worker pools: exclusive model workers per (stage, tier), batch dispatch,
//! timeouts, and queue-depth autoscaling.

pub mod autoscaler;
pub mod events;
pub mod manager;
pub mod model_pool;
pub mod stats;
pub mod worker;

pub use autoscaler::{Autoscaler, ScaleDecision};
pub use events::{PoolEvent, RetireReason};
pub use manager::WorkerPoolManager;
pub use model_pool::Pool;
pub use stats::PoolStats;
pub use worker::Worker;
