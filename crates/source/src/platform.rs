// crates/source/src/platform.rs
//! HTTP client for the competition platform

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, instrument};

use flagrun_common::{
    ChallengeItem, ChallengeSource, FlagSubmitter, FlagrunError, FlagrunResult, HintProvider,
};

use crate::normalize::normalize_challenges;

/// Connection settings for the platform API.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
    /// Keep solved challenges and accept the platform's `debug` stage.
    pub debug: bool,
}

impl PlatformConfig {
    pub fn new<S: Into<String>>(base_url: S) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            timeout: Duration::from_secs(15),
            debug: false,
        }
    }
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    code: &'a str,
    flag: &'a str,
}

/// JSON-over-HTTP platform client: challenge listing, flag submission and
/// hints.
pub struct PlatformClient {
    http: Client,
    config: PlatformConfig,
}

impl PlatformClient {
    pub fn new(config: PlatformConfig) -> FlagrunResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(FlagrunError::Config("platform base url is empty".into()));
        }
        let http = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("flagrun/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FlagrunError::Platform(format!("failed to build http client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_json(&self, builder: RequestBuilder) -> FlagrunResult<Value> {
        let response = self
            .authorize(builder)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FlagrunError::Platform(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| FlagrunError::Platform(e.to_string()))?;
        if body.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Raw challenge listing document.
    pub async fn fetch_document(&self) -> FlagrunResult<Value> {
        self.send_json(self.http.get(self.endpoint("challenges"))).await
    }
}

#[async_trait]
impl ChallengeSource for PlatformClient {
    #[instrument(skip(self))]
    async fn fetch(&self) -> FlagrunResult<Vec<ChallengeItem>> {
        let doc = self.fetch_document().await?;
        let normalized = normalize_challenges(&doc, self.config.debug);
        let stats = &normalized.stats;

        if let Some(stage) = &normalized.stage {
            info!("Platform stage: {}", stage);
        }
        info!(
            "Challenges total={} solved={} unsolved={} easy={} medium={} hard={}",
            stats.total,
            stats.solved,
            stats.unsolved(),
            stats.easy,
            stats.medium,
            stats.hard
        );
        info!("Unsolved challenges after normalization: {}", normalized.items.len());
        Ok(normalized.items)
    }

    fn name(&self) -> &str {
        "platform"
    }
}

#[async_trait]
impl FlagSubmitter for PlatformClient {
    async fn submit(&self, code: &str, flag: &str) -> FlagrunResult<String> {
        let body = SubmitBody { code, flag };
        let ack = self
            .send_json(self.http.post(self.endpoint("submit")).json(&body))
            .await?;
        Ok(ack.to_string())
    }
}

#[async_trait]
impl HintProvider for PlatformClient {
    async fn hint(&self, code: &str) -> FlagrunResult<Option<String>> {
        let doc = self
            .send_json(self.http.get(self.endpoint(&format!("hint/{}", code))))
            .await?;
        Ok(hint_content(&doc))
    }
}

/// `hint_content` of a hint response, if present and non-empty.
pub fn hint_content(doc: &Value) -> Option<String> {
    doc.get("hint_content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}
