//! Static and file-backed challenge sources

use async_trait::async_trait;
use md5::{Digest, Md5};
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::warn;

use flagrun_common::{ChallengeItem, ChallengeSource, FlagrunResult};

/// Stable code for a bare URL target (md5 hex of the URL).
pub fn code_for_url(url: &str) -> String {
    hex::encode(Md5::digest(url.as_bytes()))
}

/// One target per non-empty line.
pub fn parse_targets(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Turn bare URLs into items coded by [`code_for_url`].
pub fn items_from_urls<I, S>(urls: I) -> Vec<ChallengeItem>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    urls.into_iter()
        .map(|url| {
            let url = url.as_ref();
            ChallengeItem::new(url).with_code(code_for_url(url))
        })
        .collect()
}

/// A fixed list of challenges.
pub struct StaticSource {
    items: Vec<ChallengeItem>,
}

impl StaticSource {
    pub fn new(items: Vec<ChallengeItem>) -> Self {
        Self { items }
    }
}

#[async_trait]
impl ChallengeSource for StaticSource {
    async fn fetch(&self) -> FlagrunResult<Vec<ChallengeItem>> {
        Ok(self.items.clone())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// Targets read from a text file on every fetch.
pub struct TargetsFile {
    path: PathBuf,
}

impl TargetsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ChallengeSource for TargetsFile {
    async fn fetch(&self) -> FlagrunResult<Vec<ChallengeItem>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(items_from_urls(parse_targets(&content))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "targets file not found");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        "targets-file"
    }
}
