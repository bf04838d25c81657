//! Compositing worker.
//!
//! Runs registry syncs, scene ingestion and composite tile builds from a task
//! queue, and drives composite builds through their phases.

pub mod config;
pub mod context;
pub mod controller;
pub mod pool;
pub mod tasks;

pub use config::WorkerConfig;
pub use context::{Parts, WorkerContext};
pub use controller::{coarse_tiles, Advance, BuildController, DEFAULT_MAX_SCENE_RETRIES};
pub use pool::{PoolStats, WorkerPool};
pub use tasks::TaskRunner;
