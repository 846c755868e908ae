//! Core data types for the flagrun challenge runner
//!
//! Everything that crosses the scheduler/worker process boundary lives here
//! and derives serde, so a task can be shipped to a worker as plain JSON and
//! a result read back the same way.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A normalized challenge as returned by a challenge source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeItem {
    pub url: String,
    pub code: Option<String>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub hint_viewed: bool,
    /// Failure count stamped by the driver before dispatch (watch mode).
    #[serde(default)]
    pub failure_counts: u32,
}

impl ChallengeItem {
    #[inline]
    #[must_use]
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self {
            url: url.into(),
            code: None,
            difficulty: None,
            hint_viewed: false,
            failure_counts: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_difficulty<S: Into<String>>(mut self, difficulty: S) -> Self {
        self.difficulty = Some(difficulty.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_hint_viewed(mut self, viewed: bool) -> Self {
        self.hint_viewed = viewed;
        self
    }
}

impl fmt::Display for ChallengeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} - {}", code, self.url),
            None => f.write_str(&self.url),
        }
    }
}

/// One unit of work handed to a worker. Built per batch, consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeTask {
    pub url: String,
    pub code: Option<String>,
    pub hint_last_hour: bool,
    pub failure_counts: u32,
    pub cdp_endpoint: String,
}

impl ChallengeTask {
    #[inline]
    #[must_use]
    pub fn new<U: Into<String>, E: Into<String>>(url: U, cdp_endpoint: E) -> Self {
        Self {
            url: url.into(),
            code: None,
            hint_last_hour: false,
            failure_counts: 0,
            cdp_endpoint: cdp_endpoint.into(),
        }
    }

    /// Build a task from a source item with a pre-assigned endpoint.
    #[must_use]
    pub fn from_item(item: &ChallengeItem, cdp_endpoint: &str, hint_last_hour: bool) -> Self {
        Self {
            url: item.url.clone(),
            code: item.code.clone(),
            hint_last_hour,
            failure_counts: item.failure_counts,
            cdp_endpoint: cdp_endpoint.to_string(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn with_hint_last_hour(mut self, enabled: bool) -> Self {
        self.hint_last_hour = enabled;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_failure_counts(mut self, failures: u32) -> Self {
        self.failure_counts = failures;
        self
    }

    /// Code used in logs and memory keys.
    #[inline]
    #[must_use]
    pub fn display_code(&self) -> &str {
        self.code.as_deref().unwrap_or("unknown")
    }

    /// Memory namespace key for this challenge.
    #[must_use]
    pub fn key(&self) -> String {
        challenge_key(self.code.as_deref(), &self.url)
    }
}

/// Memory namespace key for a challenge: `ctf_<code>_<url>` with the URL's
/// `://` and `/` flattened to `_`.
#[must_use]
pub fn challenge_key(code: Option<&str>, url: &str) -> String {
    format!(
        "ctf_{}_{}",
        code.unwrap_or("unknown"),
        url.replace("://", "_").replace('/', "_")
    )
}

/// Input handed to the attack workflow for one challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackRequest {
    pub key: String,
    pub url: String,
    pub code: Option<String>,
    pub hint: Option<String>,
    pub failure_counts: u32,
    pub cdp_endpoint: String,
}

/// Outcome of one challenge attempt. `flag_content` carries the flag on
/// success and a diagnostic message otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub url: String,
    pub flag_found: bool,
    pub flag_content: String,
}

impl TaskResult {
    pub const TIMEOUT: &'static str = "execution timeout";
    pub const INCOMPLETE: &'static str = "task did not complete";
    pub const EXCEPTION_PREFIX: &'static str = "execution exception: ";

    #[inline]
    #[must_use]
    pub fn found<U: Into<String>, F: Into<String>>(url: U, flag: F) -> Self {
        Self {
            url: url.into(),
            flag_found: true,
            flag_content: flag.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn failed<U: Into<String>, M: Into<String>>(url: U, message: M) -> Self {
        Self {
            url: url.into(),
            flag_found: false,
            flag_content: message.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn timeout<U: Into<String>>(url: U) -> Self {
        Self::failed(url, Self::TIMEOUT)
    }

    #[inline]
    #[must_use]
    pub fn exception<U: Into<String>, M: fmt::Display>(url: U, message: M) -> Self {
        Self::failed(url, format!("{}{}", Self::EXCEPTION_PREFIX, message))
    }

    #[inline]
    #[must_use]
    pub fn incomplete<U: Into<String>>(url: U) -> Self {
        Self::failed(url, Self::INCOMPLETE)
    }

    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        !self.flag_found && self.flag_content == Self::TIMEOUT
    }

    #[inline]
    #[must_use]
    pub fn is_exception(&self) -> bool {
        !self.flag_found && self.flag_content.starts_with(Self::EXCEPTION_PREFIX)
    }
}

/// Which counter gates admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Single run: the larger of the per-code and per-url counters.
    OneShot,
    /// Poll loop: per-code only, urls may be regenerated between polls.
    Watch,
}

/// Failure counters keyed by challenge code and by url.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureCounters {
    pub by_code: BTreeMap<String, u32>,
    pub by_url: BTreeMap<String, u32>,
}

impl FailureCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn code_count(&self, code: Option<&str>) -> u32 {
        code.and_then(|c| self.by_code.get(c).copied()).unwrap_or(0)
    }

    #[inline]
    #[must_use]
    pub fn url_count(&self, url: &str) -> u32 {
        self.by_url.get(url).copied().unwrap_or(0)
    }

    /// Counter compared against the skip threshold.
    #[must_use]
    pub fn metric(&self, code: Option<&str>, url: &str, mode: FilterMode) -> u32 {
        let by_code = self.code_count(code);
        match mode {
            FilterMode::Watch => by_code,
            FilterMode::OneShot => by_code.max(self.url_count(url)),
        }
    }

    /// Apply one attempt: success removes both entries, failure adds one.
    pub fn record(&mut self, code: Option<&str>, url: &str, flag_found: bool) {
        if flag_found {
            if let Some(code) = code {
                self.by_code.remove(code);
            }
            self.by_url.remove(url);
        } else {
            if let Some(code) = code {
                let entry = self.by_code.entry(code.to_string()).or_insert(0);
                *entry = entry.saturating_add(1);
            }
            let entry = self.by_url.entry(url.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
        }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty() && self.by_url.is_empty()
    }
}

/// Append-only record of attempted challenges, kept for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessedSet {
    pub processed_codes: BTreeSet<String>,
    pub processed_urls: BTreeSet<String>,
}

impl ProcessedSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&mut self, code: Option<&str>, url: &str) {
        if let Some(code) = code {
            self.processed_codes.insert(code.to_string());
        }
        self.processed_urls.insert(url.to_string());
    }

    #[inline]
    #[must_use]
    pub fn contains_url(&self, url: &str) -> bool {
        self.processed_urls.contains(url)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.processed_urls.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processed_codes.is_empty() && self.processed_urls.is_empty()
    }
}
