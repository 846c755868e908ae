//! Normalization of the platform's challenge listing
//!
//! The listing looks like `{current_stage, challenges: [...]}`. Field names
//! vary between platform versions, so URL and code are looked up under
//! several aliases, and challenges that only expose `target_info` get their
//! URLs synthesized from ip and ports.

use serde_json::Value;
use std::cmp::Ordering;

use flagrun_common::ChallengeItem;

const URL_FIELDS: [&str; 4] = ["url", "target_url", "target", "challenge_url"];
const CODE_FIELDS: [&str; 4] = ["code", "challenge_code", "id", "challenge_id"];

/// Counts reported after each fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeStats {
    pub total: usize,
    pub solved: usize,
    pub easy: usize,
    pub medium: usize,
    pub hard: usize,
}

impl ChallengeStats {
    pub fn unsolved(&self) -> usize {
        self.total.saturating_sub(self.solved)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub stage: Option<String>,
    pub stats: ChallengeStats,
    pub items: Vec<ChallengeItem>,
}

/// Normalize a listing into sorted, unsolved challenge items.
///
/// A platform in its `debug` stage yields nothing unless `debug` is set, and
/// solved challenges are kept only in debug mode.
pub fn normalize_challenges(doc: &Value, debug: bool) -> Normalized {
    let stage = doc
        .get("current_stage")
        .and_then(Value::as_str)
        .map(str::to_string);

    if stage.as_deref() == Some("debug") && !debug {
        return Normalized {
            stage,
            ..Normalized::default()
        };
    }

    let challenges = doc
        .get("challenges")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut stats = ChallengeStats {
        total: challenges.len(),
        ..ChallengeStats::default()
    };
    let mut items = Vec::new();

    for challenge in challenges {
        let difficulty = challenge
            .get("difficulty")
            .and_then(Value::as_str)
            .map(str::to_lowercase)
            .filter(|d| !d.is_empty());
        match difficulty.as_deref() {
            Some("easy") => stats.easy += 1,
            Some("medium") => stats.medium += 1,
            Some("hard") => stats.hard += 1,
            _ => {}
        }

        let solved = challenge
            .get("solved")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if solved {
            stats.solved += 1;
            if !debug {
                continue;
            }
        }

        let code = first_field(challenge, &CODE_FIELDS);
        let hint_viewed = challenge
            .get("hint_viewed")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let urls = match first_field(challenge, &URL_FIELDS) {
            Some(url) => vec![url],
            None => challenge
                .get("target_info")
                .map(urls_from_target_info)
                .unwrap_or_default(),
        };

        for url in urls {
            items.push(ChallengeItem {
                url,
                code: code.clone(),
                difficulty: difficulty.clone(),
                hint_viewed,
                failure_counts: 0,
            });
        }
    }

    items.sort_by(compare_items);

    Normalized {
        stage,
        stats,
        items,
    }
}

/// easy < medium < hard < anything else
pub fn difficulty_rank(difficulty: Option<&str>) -> u8 {
    match difficulty {
        Some("easy") => 0,
        Some("medium") => 1,
        Some("hard") => 2,
        _ => 99,
    }
}

fn compare_items(a: &ChallengeItem, b: &ChallengeItem) -> Ordering {
    difficulty_rank(a.difficulty.as_deref())
        .cmp(&difficulty_rank(b.difficulty.as_deref()))
        .then_with(|| {
            a.code
                .as_deref()
                .unwrap_or("")
                .cmp(b.code.as_deref().unwrap_or(""))
        })
        .then_with(|| a.url.cmp(&b.url))
}

fn first_field(challenge: &Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .filter_map(|name| challenge.get(*name))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn urls_from_target_info(info: &Value) -> Vec<String> {
    let ip = match info.get("ip").and_then(Value::as_str) {
        Some(ip) if !ip.trim().is_empty() => ip.trim(),
        _ => return Vec::new(),
    };

    let ports: Vec<u16> = match info.get("port") {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()).into_iter().collect(),
        Some(Value::Array(values)) => values.iter().filter_map(port_value).collect(),
        _ => Vec::new(),
    };

    if ports.is_empty() {
        return vec![format!("http://{}", ip)];
    }

    let mut urls: Vec<String> = Vec::with_capacity(ports.len());
    for port in ports {
        let url = match port {
            80 => format!("http://{}", ip),
            443 => format!("https://{}", ip),
            p => format!("http://{}:{}", ip, p),
        };
        if !urls.contains(&url) {
            urls.push(url);
        }
    }
    urls
}

fn port_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
