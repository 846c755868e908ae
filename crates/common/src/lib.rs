//! Flagrun Common - Shared types and traits
//!
//! This crate provides the data model, collaborator traits and small
//! utilities shared by the scheduler, the worker runner and the CLI.

pub mod error;
pub mod flag;
pub mod humanize;
pub mod traits;
pub mod types;
pub mod window;

// Re-export commonly used types
pub use error::{FlagrunError, FlagrunResult};
pub use flag::FlagValidator;
pub use humanize::format_duration;
pub use traits::{AttackWorkflow, ChallengeSource, FlagSubmitter, HintProvider};
pub use types::{
    challenge_key, AttackRequest, ChallengeItem, ChallengeTask, FailureCounters, FilterMode,
    ProcessedSet, TaskResult,
};
pub use window::CompetitionWindow;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
