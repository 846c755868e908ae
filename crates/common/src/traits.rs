//! Collaborator traits
//!
//! The runner and the driver only talk to the agent system and the
//! competition platform through these seams.

use crate::error::FlagrunResult;
use crate::types::{AttackRequest, ChallengeItem};
use async_trait::async_trait;

/// The attack workflow for a single challenge (agents, tools, prompts).
#[async_trait]
pub trait AttackWorkflow: Send + Sync {
    /// Run the workflow and return its raw textual output.
    async fn execute(&self, request: &AttackRequest) -> FlagrunResult<String>;

    /// Wipe any agent memory stored under `key`.
    async fn reset_memory(&self, _key: &str) -> FlagrunResult<()> {
        Ok(())
    }

    /// Workflow name/identifier
    fn name(&self) -> &str;
}

/// Where challenge targets come from.
#[async_trait]
pub trait ChallengeSource: Send + Sync {
    /// Fetch the current list of unsolved challenges.
    async fn fetch(&self) -> FlagrunResult<Vec<ChallengeItem>>;

    fn name(&self) -> &str;
}

/// Flag submission endpoint of the competition platform.
#[async_trait]
pub trait FlagSubmitter: Send + Sync {
    async fn submit(&self, code: &str, flag: &str) -> FlagrunResult<String>;
}

/// Hint endpoint of the competition platform.
#[async_trait]
pub trait HintProvider: Send + Sync {
    async fn hint(&self, code: &str) -> FlagrunResult<Option<String>>;
}
