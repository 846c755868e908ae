//! Runner - executes a single challenge inside a worker
//!
//! The worker process builds one [`SingleTaskRunner`] per task. Memory
//! namespace initialization is coordinated across workers by
//! [`MemoryInitGuard`].

mod guard;
mod runner;
mod workflow;

pub use guard::MemoryInitGuard;
pub use runner::{RunnerConfig, SingleTaskRunner};
pub use workflow::CommandWorkflow;
