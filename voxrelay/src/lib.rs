//! voxrelay: batched, multi-stage translation and voice job scheduling over
//! exclusive model worker pools.

pub mod app;
pub mod batch;
pub mod config;
pub mod database;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod transport;
pub mod utils;

pub use app::App;
pub use error::{Error, Result};
