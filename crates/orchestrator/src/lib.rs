//! Orchestrator - endpoint leasing, batch scheduling and the polling loop
//!
//! A [`BatchScheduler`] runs a batch of challenge tasks on a fixed pool of
//! workers, one [`TaskLauncher`] call per task. The [`PollingDriver`] sits on
//! top: it filters targets against the persisted failure counters, runs a
//! batch and records the outcome.

mod driver;
mod launcher;
mod pool;
mod progress;
mod rate_limiter;
mod scheduler;

pub use driver::{filter_items, mark_processed, record_results, DriverConfig, OneShot, PollingDriver};
pub use launcher::{parse_worker_output, InProcessLauncher, ProcessLauncher, TaskLauncher};
pub use pool::{EndpointLease, EndpointPool, EndpointStatus, PoolStatus};
pub use progress::{ProgressSnapshot, ProgressTracker, RunSummary};
pub use rate_limiter::RateLimiter;
pub use scheduler::{BatchScheduler, SchedulerConfig};
